/* USB transport: bulk-endpoint I/O on a device matched by vendor/product
 * against the driver's id list. Enumeration goes no further than that. */

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use rusb::{Context, DeviceHandle, Direction, TransferType, UsbContext};
use tracing::debug;

use super::UsbDeviceId;

/* Bulk reads land here first so await_input can buffer without loss. */
const READ_CHUNK: usize = 64;

const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

pub struct UsbChannel {
    handle: DeviceHandle<Context>,
    in_endpoint: u8,
    out_endpoint: u8,
    pending: VecDeque<u8>,
}

fn usb_io(err: rusb::Error) -> io::Error {
    match err {
        rusb::Error::NoDevice | rusb::Error::Io => {
            io::Error::new(io::ErrorKind::NotConnected, err.to_string())
        }
        other => io::Error::other(other.to_string()),
    }
}

impl UsbChannel {
    /* Match the driver's allowed list, narrowed by the optional selector
     * from the device specification, and claim the interface holding a
     * bulk in/out pair. */
    pub fn open(
        ids: &[UsbDeviceId],
        vendor: Option<u16>,
        product: Option<u16>,
        index: usize,
    ) -> io::Result<Self> {
        let context = Context::new().map_err(usb_io)?;
        let devices = context.devices().map_err(usb_io)?;

        let mut skip = index;
        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            let id = UsbDeviceId {
                vendor: descriptor.vendor_id(),
                product: descriptor.product_id(),
            };
            if !ids.contains(&id) {
                continue;
            }
            if vendor.is_some_and(|v| v != id.vendor) || product.is_some_and(|p| p != id.product)
            {
                continue;
            }
            if skip > 0 {
                skip -= 1;
                continue;
            }

            let config = device.active_config_descriptor().map_err(usb_io)?;
            let endpoints = config
                .interfaces()
                .flat_map(|interface| interface.descriptors())
                .find_map(|descriptor| {
                    let mut input = None;
                    let mut output = None;
                    for endpoint in descriptor.endpoint_descriptors() {
                        match (endpoint.direction(), endpoint.transfer_type()) {
                            (Direction::In, TransferType::Bulk) => {
                                input = Some(endpoint.address());
                            }
                            (Direction::Out, TransferType::Bulk) => {
                                output = Some(endpoint.address());
                            }
                            _ => {}
                        }
                    }
                    Some((input?, output?, descriptor.interface_number()))
                });
            let Some((in_endpoint, out_endpoint, interface)) = endpoints else {
                return Err(io::Error::other(format!(
                    "no bulk endpoint pair on {:04x}:{:04x}",
                    id.vendor, id.product
                )));
            };

            let handle = device.open().map_err(usb_io)?;
            let _ = handle.set_auto_detach_kernel_driver(true);
            handle.claim_interface(interface).map_err(usb_io)?;

            debug!(
                "usb channel open: {:04x}:{:04x} in={:#04x} out={:#04x}",
                id.vendor, id.product, in_endpoint, out_endpoint
            );
            return Ok(Self {
                handle,
                in_endpoint,
                out_endpoint,
                pending: VecDeque::new(),
            });
        }

        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no matching USB device",
        ))
    }

    /* Pull one bulk transfer into the pending buffer. */
    fn fill_pending(&mut self, limit: Duration) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        /* libusb treats a zero timeout as unlimited. */
        let limit = limit.max(Duration::from_millis(1));
        match self.handle.read_bulk(self.in_endpoint, &mut chunk, limit) {
            Ok(count) => {
                self.pending.extend(&chunk[..count]);
                Ok(count)
            }
            Err(rusb::Error::Timeout) => Ok(0),
            Err(rusb::Error::Pipe) => {
                self.handle.clear_halt(self.in_endpoint).map_err(usb_io)?;
                Ok(0)
            }
            Err(e) => Err(usb_io(e)),
        }
    }

    pub fn wait_readable(&mut self, limit: Duration) -> io::Result<bool> {
        if !self.pending.is_empty() {
            return Ok(true);
        }
        Ok(self.fill_pending(limit)? > 0)
    }

    pub fn read_chunk(&mut self, buf: &mut [u8], limit: Duration) -> io::Result<usize> {
        if self.pending.is_empty() {
            self.fill_pending(limit)?;
        }
        let mut count = 0;
        while count < buf.len() {
            match self.pending.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < data.len() {
            match self
                .handle
                .write_bulk(self.out_endpoint, &data[written..], WRITE_TIMEOUT)
            {
                Ok(count) => written += count,
                Err(rusb::Error::Pipe) => {
                    self.handle.clear_halt(self.out_endpoint).map_err(usb_io)?;
                }
                Err(e) => return Err(usb_io(e)),
            }
        }
        debug!("TX {} bytes: {:02x?}", data.len(), data);
        Ok(written)
    }

    pub fn discard_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        while self.fill_pending(Duration::from_millis(1))? > 0 {}
        self.pending.clear();
        Ok(())
    }
}
