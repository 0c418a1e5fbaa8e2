/* Dispatch layer: one handle per open display, owning the protocol
 * engine, the transport and the session state. The host talks only to
 * this handle; the process may hold several of them. */

use std::time::Duration;

use tracing::{info, warn};

use crate::command::{CommandContext, ReadResult};
use crate::device_spec::DeviceSpec;
use crate::driver::{Capabilities, Geometry, ProtocolDriver, create_driver};
use crate::error::{BrailleError, Result};
use crate::parameters::Parameters;
use crate::transport::{
    BluetoothChannel, Link, NetChannel, Port, SerialPort, UsbChannel,
};

pub struct BrailleDisplay {
    driver: Box<dyn ProtocolDriver>,
    port: Port,
    geometry: Geometry,
    resize_required: bool,
    closed: bool,
}

impl BrailleDisplay {
    /* Open a display: select the driver from the registry, open the
     * transport the spec names, and run the driver's probe. Either all
     * of {transport, identity, geometry} get established, or this
     * returns an error and no handle exists. */
    pub async fn open(
        driver_name: &str,
        device_spec: &str,
        parameters: &[&str],
    ) -> Result<BrailleDisplay> {
        let mut driver = create_driver(driver_name)
            .ok_or_else(|| BrailleError::UnknownDriver(driver_name.to_string()))?;

        let spec = DeviceSpec::parse(device_spec)?;
        if !driver.supported_transports().contains(&spec.kind()) {
            return Err(BrailleError::UnsupportedTransport {
                driver: driver.name(),
                spec: device_spec.to_string(),
            });
        }

        let mut port = open_port(&spec, driver.as_ref(), device_spec).await?;
        let parameters = Parameters::new(driver.parameter_names(), parameters);

        let geometry = driver.open(&mut port, &parameters).await?;
        info!(
            "{}: {} text cells, {} status cells on {}",
            driver.name(),
            geometry.text_columns,
            geometry.status_columns,
            port.device()
        );

        Ok(BrailleDisplay {
            driver,
            port,
            geometry,
            resize_required: false,
            closed: false,
        })
    }

    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn capabilities(&self) -> Capabilities {
        self.driver.capabilities()
    }

    /* True once after a hot-reattach changed the geometry; the host
     * must re-size its buffers before the next write_window. */
    pub fn take_resize_required(&mut self) -> bool {
        std::mem::take(&mut self.resize_required)
    }

    /* Accumulated wire-time credit; the host sleeps this long before
     * its next cycle. */
    pub fn take_write_delay(&mut self) -> Duration {
        self.port.take_write_delay()
    }

    pub async fn write_window(&mut self, cells: &[u8]) -> Result<()> {
        self.driver.write_window(&mut self.port, cells).await
    }

    pub async fn write_status(&mut self, cells: &[u8]) -> Result<()> {
        self.driver.write_status(&mut self.port, cells).await
    }

    /* Poll for one host command. Fatal transport states surface as
     * ReadResult::Restart, never as an error: the host's recovery is
     * the same either way (close and reopen). */
    pub async fn read_command(&mut self, context: CommandContext) -> ReadResult {
        let result = match self.driver.read_command(&mut self.port, context).await {
            Ok(result) => result,
            Err(e) => {
                warn!("{}: read failed: {e}", self.driver.name());
                ReadResult::Restart
            }
        };
        if self.driver.take_resize_required() {
            self.geometry = self.driver.geometry();
            self.resize_required = true;
        }
        result
    }

    pub async fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.driver.read_packet(&mut self.port, buf).await
    }

    pub async fn write_packet(&mut self, packet: &[u8]) -> Result<usize> {
        self.driver.write_packet(&mut self.port, packet).await
    }

    pub async fn reset(&mut self) -> Result<()> {
        self.driver.reset(&mut self.port).await
    }

    pub async fn set_firmness(&mut self, setting: u8) -> Result<()> {
        self.driver.set_firmness(&mut self.port, setting).await
    }

    pub async fn write_visual(&mut self, text: &[u8]) -> Result<()> {
        self.driver.write_visual(&mut self.port, text).await
    }

    /* Idempotent; the transport closes when the handle drops. */
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.driver.close(&mut self.port).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_driver_is_rejected() {
        let result = BrailleDisplay::open("papenmeier", "serial:/dev/null", &[]).await;
        assert!(matches!(result, Err(BrailleError::UnknownDriver(_))));
    }

    #[tokio::test]
    async fn test_unsupported_transport_is_rejected() {
        /* Braudi is serial-only. */
        let result = BrailleDisplay::open("braudi", "usb:", &[]).await;
        assert!(matches!(
            result,
            Err(BrailleError::UnsupportedTransport { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_spec_is_rejected() {
        let result = BrailleDisplay::open("baum", "parallel:/dev/lp0", &[]).await;
        assert!(matches!(result, Err(BrailleError::InvalidDeviceSpec(_))));
    }
}

async fn open_port(
    spec: &DeviceSpec,
    driver: &dyn ProtocolDriver,
    device: &str,
) -> Result<Port> {
    let link = match spec {
        DeviceSpec::Serial { path } => {
            let serial = SerialPort::open(path).map_err(|source| BrailleError::OpenFailed {
                device: device.to_string(),
                source,
            })?;
            Link::Serial(serial)
        }
        DeviceSpec::Usb {
            vendor,
            product,
            index,
        } => {
            let channel = UsbChannel::open(driver.usb_ids(), *vendor, *product, *index)
                .map_err(|source| BrailleError::OpenFailed {
                    device: device.to_string(),
                    source,
                })?;
            Link::Usb(channel)
        }
        DeviceSpec::Bluetooth { address, channel } => {
            let rfcomm = BluetoothChannel::open(*address, *channel).map_err(|source| {
                BrailleError::OpenFailed {
                    device: device.to_string(),
                    source,
                }
            })?;
            Link::Bluetooth(rfcomm)
        }
        DeviceSpec::Net { host, port } => {
            let tcp = NetChannel::connect(host, *port).await.map_err(|source| {
                BrailleError::OpenFailed {
                    device: device.to_string(),
                    source,
                }
            })?;
            Link::Net(tcp)
        }
    };
    Ok(Port::new(link, device.to_string()))
}
