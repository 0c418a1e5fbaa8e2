/* brld: the braille display driver core of a screen reader. The host
 * opens one BrailleDisplay handle per device, pushes dot-pattern cell
 * buffers at it, and polls it for device-independent commands. */

pub mod cells;
pub mod command;
pub mod device_spec;
pub mod display;
pub mod driver;
pub mod error;
pub mod keys;
pub mod parameters;
pub mod transport;

pub use command::{CommandContext, ReadResult};
pub use device_spec::{DeviceSpec, TransportKind};
pub use display::BrailleDisplay;
pub use driver::{Capabilities, Geometry, create_driver};
pub use error::{BrailleError, Result};
