/* Driver framework: ProtocolDriver trait, shared byte-level read helpers,
 * driver factory, and the capability surface drivers advertise. */
#[cfg(feature = "driver-albatross")]
pub mod albatross;
#[cfg(feature = "driver-baum")]
pub mod baum;
#[cfg(feature = "driver-braillenote")]
pub mod braillenote;
#[cfg(feature = "driver-braudi")]
pub mod braudi;
#[cfg(feature = "driver-combibraille")]
pub mod combibraille;
#[cfg(feature = "driver-eurobraille")]
pub mod eurobraille;
#[cfg(feature = "driver-freedom-scientific")]
pub mod freedom_scientific;
#[cfg(feature = "driver-handytech")]
pub mod handytech;
#[cfg(feature = "driver-technibraille")]
pub mod technibraille;
#[cfg(feature = "driver-tsi")]
pub mod tsi;

use async_trait::async_trait;
use tracing::warn;

use crate::command::{CommandContext, ReadResult};
use crate::device_spec::TransportKind;
use crate::error::{BrailleError, Result};
use crate::parameters::Parameters;
use crate::transport::{Port, UsbDeviceId};

/* Display geometry, fixed at the end of open. The resize flag re-issues
 * it when the device reports a different size mid-session. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub text_columns: usize,
    pub text_rows: usize,
    pub status_columns: usize,
    pub help_page: usize,
}

impl Geometry {
    pub fn new(text_columns: usize, status_columns: usize) -> Self {
        Self {
            text_columns,
            text_rows: 1,
            status_columns,
            help_page: 0,
        }
    }
}

/* Optional surfaces a binding advertises to the host. */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub packet_io: bool,
    pub visual_display: bool,
    pub firmness: bool,
    pub key_codes: bool,
}

/* The universal driver interface for all display protocols.             */
/*                                                                       */
/* Every supported protocol implements this trait. The dispatch handle   */
/* calls these methods from the host's refresh loop. open establishes    */
/* transport, identity and geometry or fails without leaving state       */
/* behind; read_command never blocks beyond a short internal timeout.    */
#[async_trait]
pub trait ProtocolDriver: Send {
    /* Returns the driver name for logging purposes. */
    fn name(&self) -> &'static str;

    /* Compile-time parameter list, positional. */
    fn parameter_names(&self) -> &'static [&'static str] {
        &[]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn supported_transports(&self) -> &'static [TransportKind] {
        &[TransportKind::Serial]
    }

    /* Vendor/product pairs accepted on the USB transport. */
    fn usb_ids(&self) -> &'static [UsbDeviceId] {
        &[]
    }

    /* Probe the device, select the protocol variant, size the buffers
     * and force the first full refresh. */
    async fn open(&mut self, port: &mut Port, parameters: &Parameters) -> Result<Geometry>;

    async fn close(&mut self, port: &mut Port) {
        let _ = port;
    }

    /* Current geometry; may change after a hot-reattach. */
    fn geometry(&self) -> Geometry;

    /* True once after the device announced a different size. */
    fn take_resize_required(&mut self) -> bool {
        false
    }

    async fn write_window(&mut self, port: &mut Port, cells: &[u8]) -> Result<()>;

    async fn write_status(&mut self, port: &mut Port, cells: &[u8]) -> Result<()> {
        let _ = (port, cells);
        Ok(())
    }

    async fn read_command(
        &mut self,
        port: &mut Port,
        context: CommandContext,
    ) -> Result<ReadResult>;

    async fn read_packet(&mut self, port: &mut Port, buf: &mut [u8]) -> Result<usize> {
        let _ = (port, buf);
        Err(BrailleError::UnsupportedOperation("read_packet"))
    }

    async fn write_packet(&mut self, port: &mut Port, packet: &[u8]) -> Result<usize> {
        let _ = (port, packet);
        Err(BrailleError::UnsupportedOperation("write_packet"))
    }

    async fn reset(&mut self, port: &mut Port) -> Result<()> {
        let _ = port;
        Err(BrailleError::UnsupportedOperation("reset"))
    }

    /* Dot firmness, scaled 0..=255. */
    async fn set_firmness(&mut self, port: &mut Port, setting: u8) -> Result<()> {
        let _ = (port, setting);
        Err(BrailleError::UnsupportedOperation("set_firmness"))
    }

    /* Plain text shadow of the window for devices with an LCD. */
    async fn write_visual(&mut self, port: &mut Port, text: &[u8]) -> Result<()> {
        let _ = (port, text);
        Err(BrailleError::UnsupportedOperation("write_visual"))
    }
}

/* Read one byte; None when nothing is pending within the short timeout. */
pub(crate) async fn read_byte(port: &mut Port, wait: bool) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    match port.read_bytes(&mut byte, wait).await? {
        0 => Ok(None),
        _ => Ok(Some(byte[0])),
    }
}

/* Drop whatever the device queued while nobody was listening. */
pub(crate) async fn flush_input(port: &mut Port) -> Result<()> {
    while read_byte(port, false).await?.is_some() {}
    Ok(())
}

/* Instantiate the correct driver from the compile-time registry. */
pub fn create_driver(driver_name: &str) -> Option<Box<dyn ProtocolDriver>> {
    match driver_name {
        #[cfg(feature = "driver-albatross")]
        "albatross" => Some(Box::new(albatross::AlbatrossDriver::new())),
        #[cfg(feature = "driver-baum")]
        "baum" => Some(Box::new(baum::BaumDriver::new())),
        #[cfg(feature = "driver-braillenote")]
        "braillenote" => Some(Box::new(braillenote::BrailleNoteDriver::new())),
        #[cfg(feature = "driver-braudi")]
        "braudi" => Some(Box::new(braudi::BraudiDriver::new())),
        #[cfg(feature = "driver-combibraille")]
        "combibraille" => Some(Box::new(combibraille::CombiBrailleDriver::new())),
        #[cfg(feature = "driver-eurobraille")]
        "eurobraille" => Some(Box::new(eurobraille::EuroBrailleDriver::new())),
        #[cfg(feature = "driver-freedom-scientific")]
        "freedomscientific" | "focus" => {
            Some(Box::new(freedom_scientific::FreedomScientificDriver::new()))
        }
        #[cfg(feature = "driver-handytech")]
        "handytech" => Some(Box::new(handytech::HandyTechDriver::new())),
        #[cfg(feature = "driver-technibraille")]
        "technibraille" => Some(Box::new(technibraille::TechniBrailleDriver::new())),
        #[cfg(feature = "driver-tsi")]
        "tsi" => Some(Box::new(tsi::TsiDriver::new())),
        _ => {
            warn!("Unknown driver: {driver_name}");
            None
        }
    }
}
