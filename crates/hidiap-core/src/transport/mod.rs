//! Transport layer module.

pub mod hid_descriptor;
pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::MockTransport;
pub use nusb::NusbTransport;
pub use traits::{DeviceIdentity, ReportTransport, TransportError};
