/* Transport layer: one uniform blocking/poll/timeout surface over serial,
 * USB, Bluetooth and TCP links. Drivers never touch a backend directly;
 * they hold a Port, which dispatches by variant. */

pub mod bluetooth;
pub mod net;
pub mod serial;
pub mod usb;

#[cfg(test)]
pub(crate) mod mock;

use std::time::Duration;

use crate::error::{BrailleError, Result};

pub use crate::device_spec::TransportKind;
pub use bluetooth::BluetoothChannel;
pub use net::NetChannel;
pub use serial::SerialPort;
pub use usb::UsbChannel;

/* Reads block at most this long once a transfer has started. */
pub const SHORT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/* Settle time after a structural reconfiguration (baud change). */
pub const RECONFIGURE_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialParity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy)]
pub struct SerialConfig {
    pub baud: u32,
    pub parity: SerialParity,
}

impl SerialConfig {
    pub const fn new(baud: u32, parity: SerialParity) -> Self {
        Self { baud, parity }
    }

    /* Start bit + 8 data bits + stop bit, plus the parity bit if any. */
    pub fn bits_per_character(&self) -> u32 {
        match self.parity {
            SerialParity::None => 10,
            _ => 11,
        }
    }

    pub fn characters_per_second(&self) -> u32 {
        self.baud / self.bits_per_character()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Hardware,
}

/* One vendor/product pair a driver accepts. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbDeviceId {
    pub vendor: u16,
    pub product: u16,
}

pub(crate) enum Link {
    Serial(SerialPort),
    Usb(UsbChannel),
    Bluetooth(BluetoothChannel),
    Net(NetChannel),
    #[cfg(test)]
    Mock(mock::MockPort),
}

pub struct Port {
    link: Link,
    device: String,
    characters_per_second: u32,
    write_delay: Duration,
}

impl Port {
    pub(crate) fn new(link: Link, device: String) -> Self {
        Self {
            link,
            device,
            characters_per_second: 0,
            write_delay: Duration::ZERO,
        }
    }

    #[cfg(test)]
    pub(crate) fn mock() -> Self {
        Self::new(Link::Mock(mock::MockPort::new()), "mock".to_string())
    }

    #[cfg(test)]
    pub(crate) fn mock_mut(&mut self) -> &mut mock::MockPort {
        match &mut self.link {
            Link::Mock(mock) => mock,
            _ => unreachable!(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match &self.link {
            Link::Serial(_) => TransportKind::Serial,
            Link::Usb(_) => TransportKind::Usb,
            Link::Bluetooth(_) => TransportKind::Bluetooth,
            Link::Net(_) => TransportKind::Net,
            #[cfg(test)]
            Link::Mock(_) => TransportKind::Serial,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    fn io_error(&self, source: std::io::Error) -> BrailleError {
        io_failure(&self.device, source)
    }

    /* True iff at least one byte becomes readable within the timeout. */
    pub async fn await_input(&mut self, timeout: Duration) -> Result<bool> {
        let result = match &mut self.link {
            Link::Serial(s) => s.wait_readable(timeout).await,
            Link::Usb(u) => u.wait_readable(timeout),
            Link::Bluetooth(b) => b.wait_readable(timeout).await,
            Link::Net(n) => n.wait_readable(timeout).await,
            #[cfg(test)]
            Link::Mock(m) => m.wait_readable(),
        };
        result.map_err(|e| self.io_error(e))
    }

    /* Read into `buf`. Returns 0 immediately when `!wait` and nothing is
     * pending; otherwise keeps collecting until the buffer fills or a
     * short inter-byte timeout expires. Short counts are normal; the
     * caller reassembles. */
    pub async fn read_bytes(&mut self, buf: &mut [u8], wait: bool) -> Result<usize> {
        let mut offset = 0;
        while offset < buf.len() {
            let timeout = if offset == 0 {
                if wait { SHORT_READ_TIMEOUT } else { Duration::ZERO }
            } else {
                SHORT_READ_TIMEOUT
            };
            let count = self.read_chunk_at(offset, buf, timeout).await?;
            if count == 0 {
                break;
            }
            offset += count;
        }
        Ok(offset)
    }

    async fn read_chunk_at(
        &mut self,
        offset: usize,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let buf = &mut buf[offset..];
        let result = match &mut self.link {
            Link::Serial(s) => s.read_chunk(buf, timeout).await,
            Link::Usb(u) => u.read_chunk(buf, timeout),
            Link::Bluetooth(b) => b.read_chunk(buf, timeout).await,
            Link::Net(n) => n.read_chunk(buf, timeout).await,
            #[cfg(test)]
            Link::Mock(m) => m.read_chunk(buf),
        };
        result.map_err(|e| self.io_error(e))
    }

    pub async fn write_bytes(&mut self, data: &[u8]) -> Result<usize> {
        let result = match &mut self.link {
            Link::Serial(s) => s.write(data).await,
            Link::Usb(u) => u.write(data),
            Link::Bluetooth(b) => b.write(data).await,
            Link::Net(n) => n.write(data).await,
            #[cfg(test)]
            Link::Mock(m) => m.write(data),
        };
        result.map_err(|e| self.io_error(e))
    }

    pub async fn discard_input(&mut self) -> Result<()> {
        let result = match &mut self.link {
            Link::Serial(s) => s.discard_input(),
            Link::Usb(u) => u.discard_input(),
            Link::Bluetooth(b) => b.discard_input().await,
            Link::Net(n) => n.discard_input().await,
            #[cfg(test)]
            Link::Mock(m) => m.discard_input(),
        };
        result.map_err(|e| self.io_error(e))
    }

    pub async fn drain_output(&mut self) -> Result<()> {
        let result = match &mut self.link {
            Link::Serial(s) => s.drain_output(),
            _ => Ok(()),
        };
        result.map_err(|e| self.io_error(e))
    }

    /* Reconfigure the serial line and wait for the hardware to settle.
     * On non-serial links only the write pacing changes: the bridge
     * carries the protocol's nominal baud. */
    pub async fn configure_serial(&mut self, config: &SerialConfig) -> Result<()> {
        self.characters_per_second = config.characters_per_second();
        if let Link::Serial(s) = &mut self.link {
            s.configure(config).map_err(|e| io_failure(&self.device, e))?;
            self.discard_input().await?;
            tokio::time::sleep(RECONFIGURE_SETTLE).await;
        }
        Ok(())
    }

    pub async fn set_flow_control(&mut self, flow: FlowControl) -> Result<()> {
        if let Link::Serial(s) = &mut self.link {
            s.set_flow_control(flow).map_err(|e| io_failure(&self.device, e))?;
        }
        Ok(())
    }

    pub fn set_modem_line_dtr(&mut self, up: bool) -> Result<()> {
        match &mut self.link {
            Link::Serial(s) => s.set_dtr(up).map_err(|e| io_failure(&self.device, e)),
            _ => Err(BrailleError::UnsupportedOperation("modem lines")),
        }
    }

    pub fn set_modem_line_rts(&mut self, up: bool) -> Result<()> {
        match &mut self.link {
            Link::Serial(s) => s.set_rts(up).map_err(|e| io_failure(&self.device, e)),
            _ => Err(BrailleError::UnsupportedOperation("modem lines")),
        }
    }

    pub fn test_modem_line_cts(&mut self) -> Result<bool> {
        match &mut self.link {
            Link::Serial(s) => s.test_cts().map_err(|e| io_failure(&self.device, e)),
            _ => Err(BrailleError::UnsupportedOperation("modem lines")),
        }
    }

    pub fn test_modem_line_dsr(&mut self) -> Result<bool> {
        match &mut self.link {
            Link::Serial(s) => s.test_dsr().map_err(|e| io_failure(&self.device, e)),
            _ => Err(BrailleError::UnsupportedOperation("modem lines")),
        }
    }

    /* Pacing override for links opened without a serial configuration. */
    pub fn set_pacing(&mut self, characters_per_second: u32) {
        self.characters_per_second = characters_per_second;
    }

    /* Credit the delay the wire needs to carry `bytes`: displays without
     * flow control overflow if the host writes back to back. */
    pub fn credit_write_delay(&mut self, bytes: usize) {
        if self.characters_per_second > 0 {
            let ms = (bytes as u64 * 1000) / u64::from(self.characters_per_second) + 1;
            self.write_delay += Duration::from_millis(ms);
        }
    }

    /* The host honors this by sleeping before its next cycle. */
    pub fn take_write_delay(&mut self) -> Duration {
        std::mem::take(&mut self.write_delay)
    }
}

fn io_failure(device: &str, source: std::io::Error) -> BrailleError {
    BrailleError::Io {
        device: device.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_per_character() {
        assert_eq!(SerialConfig::new(57600, SerialParity::None).bits_per_character(), 10);
        assert_eq!(SerialConfig::new(19200, SerialParity::Odd).bits_per_character(), 11);
        assert_eq!(SerialConfig::new(19200, SerialParity::Even).characters_per_second(), 1745);
    }

    #[tokio::test]
    async fn test_write_delay_credit() {
        let mut port = Port::mock();
        port.set_pacing(5760); /* 57600 baud, 10 bits */
        port.credit_write_delay(100);
        let delay = port.take_write_delay();
        assert_eq!(delay, Duration::from_millis(100 * 1000 / 5760 + 1));
        assert_eq!(port.take_write_delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_no_pacing_no_delay() {
        let mut port = Port::mock();
        port.credit_write_delay(1000);
        assert_eq!(port.take_write_delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_mock_read_nonblocking() {
        let mut port = Port::mock();
        let mut buf = [0u8; 4];
        assert_eq!(port.read_bytes(&mut buf, false).await.unwrap(), 0);

        port.mock_mut().push_input(&[1, 2, 3]);
        assert!(port.await_input(Duration::from_millis(10)).await.unwrap());
        assert_eq!(port.read_bytes(&mut buf, false).await.unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_dead_link_surfaces_io_error() {
        let mut port = Port::mock();
        port.mock_mut().break_link();
        let mut buf = [0u8; 4];
        let result = port.read_bytes(&mut buf, false).await;
        assert!(matches!(result, Err(BrailleError::Io { .. })));
    }
}
