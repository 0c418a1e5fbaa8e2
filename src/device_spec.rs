/* Device specification parsing. A spec is a URI-like string naming the
 * transport and the endpoint: `serial:/dev/ttyS0`, `usb:0f4e:0100`,
 * `bluetooth:AA:BB:CC:DD:EE:FF`, `net:host:port`. A bare path is taken
 * as a serial device. */

use std::fmt;
use std::path::PathBuf;

use crate::error::BrailleError;

pub const DEFAULT_NET_PORT: u16 = 2020;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Serial,
    Usb,
    Bluetooth,
    Net,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => f.write_str("serial"),
            TransportKind::Usb => f.write_str("usb"),
            TransportKind::Bluetooth => f.write_str("bluetooth"),
            TransportKind::Net => f.write_str("net"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSpec {
    Serial {
        path: PathBuf,
    },
    /* Vendor/product narrow the per-driver id list; index picks between
     * identical devices. */
    Usb {
        vendor: Option<u16>,
        product: Option<u16>,
        index: usize,
    },
    Bluetooth {
        address: [u8; 6],
        channel: u8,
    },
    Net {
        host: String,
        port: u16,
    },
}

impl DeviceSpec {
    pub fn kind(&self) -> TransportKind {
        match self {
            DeviceSpec::Serial { .. } => TransportKind::Serial,
            DeviceSpec::Usb { .. } => TransportKind::Usb,
            DeviceSpec::Bluetooth { .. } => TransportKind::Bluetooth,
            DeviceSpec::Net { .. } => TransportKind::Net,
        }
    }

    pub fn parse(spec: &str) -> Result<Self, BrailleError> {
        let invalid = || BrailleError::InvalidDeviceSpec(spec.to_string());

        if let Some(path) = spec.strip_prefix("serial:") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(DeviceSpec::Serial {
                path: PathBuf::from(path),
            });
        }

        if let Some(rest) = spec.strip_prefix("usb:") {
            if rest.is_empty() {
                return Ok(DeviceSpec::Usb {
                    vendor: None,
                    product: None,
                    index: 0,
                });
            }
            let segments: Vec<&str> = rest.split(':').collect();
            if segments.len() < 2 || segments.len() > 3 {
                return Err(invalid());
            }
            let vendor = u16::from_str_radix(segments[0], 16).map_err(|_| invalid())?;
            let product = u16::from_str_radix(segments[1], 16).map_err(|_| invalid())?;
            let index = if segments.len() == 3 {
                segments[2].parse().map_err(|_| invalid())?
            } else {
                0
            };
            return Ok(DeviceSpec::Usb {
                vendor: Some(vendor),
                product: Some(product),
                index,
            });
        }

        if let Some(rest) = spec.strip_prefix("bluetooth:") {
            let address = parse_bdaddr(rest).ok_or_else(invalid)?;
            return Ok(DeviceSpec::Bluetooth {
                address,
                channel: 1,
            });
        }

        if let Some(rest) = spec.strip_prefix("net:") {
            if rest.is_empty() {
                return Err(invalid());
            }
            let (host, port) = match rest.rsplit_once(':') {
                Some((host, port)) => {
                    (host.to_string(), port.parse().map_err(|_| invalid())?)
                }
                None => (rest.to_string(), DEFAULT_NET_PORT),
            };
            if host.is_empty() {
                return Err(invalid());
            }
            return Ok(DeviceSpec::Net { host, port });
        }

        /* Historical convention: a bare absolute path is a serial device. */
        if spec.starts_with('/') {
            return Ok(DeviceSpec::Serial {
                path: PathBuf::from(spec),
            });
        }

        Err(invalid())
    }
}

/* Parse "AA:BB:CC:DD:EE:FF" into transmission order. */
fn parse_bdaddr(s: &str) -> Option<[u8; 6]> {
    let mut address = [0u8; 6];
    let mut count = 0;
    for part in s.split(':') {
        if count == 6 || part.len() != 2 {
            return None;
        }
        address[count] = u8::from_str_radix(part, 16).ok()?;
        count += 1;
    }
    if count != 6 {
        return None;
    }
    Some(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serial() {
        let spec = DeviceSpec::parse("serial:/dev/ttyS0").unwrap();
        assert_eq!(spec.kind(), TransportKind::Serial);
    }

    #[test]
    fn test_parse_bare_path_is_serial() {
        let spec = DeviceSpec::parse("/dev/ttyUSB0").unwrap();
        assert_eq!(spec.kind(), TransportKind::Serial);
    }

    #[test]
    fn test_parse_usb_with_ids() {
        let spec = DeviceSpec::parse("usb:0f4e:0100").unwrap();
        assert_eq!(
            spec,
            DeviceSpec::Usb {
                vendor: Some(0x0F4E),
                product: Some(0x0100),
                index: 0,
            }
        );
    }

    #[test]
    fn test_parse_usb_with_index() {
        let spec = DeviceSpec::parse("usb:0403:fe72:1").unwrap();
        assert_eq!(
            spec,
            DeviceSpec::Usb {
                vendor: Some(0x0403),
                product: Some(0xFE72),
                index: 1,
            }
        );
    }

    #[test]
    fn test_parse_usb_any() {
        let spec = DeviceSpec::parse("usb:").unwrap();
        assert_eq!(spec.kind(), TransportKind::Usb);
    }

    #[test]
    fn test_parse_bluetooth() {
        let spec = DeviceSpec::parse("bluetooth:00:11:22:33:44:55").unwrap();
        assert_eq!(
            spec,
            DeviceSpec::Bluetooth {
                address: [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
                channel: 1,
            }
        );
    }

    #[test]
    fn test_parse_net_default_port() {
        let spec = DeviceSpec::parse("net:displayhost").unwrap();
        assert_eq!(
            spec,
            DeviceSpec::Net {
                host: "displayhost".to_string(),
                port: DEFAULT_NET_PORT,
            }
        );
    }

    #[test]
    fn test_parse_net_explicit_port() {
        let spec = DeviceSpec::parse("net:10.0.0.5:4101").unwrap();
        assert_eq!(
            spec,
            DeviceSpec::Net {
                host: "10.0.0.5".to_string(),
                port: 4101,
            }
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!(DeviceSpec::parse("parallel:/dev/lp0").is_err());
        assert!(DeviceSpec::parse("usb:0f4e").is_err());
        assert!(DeviceSpec::parse("bluetooth:00:11:22").is_err());
    }
}
