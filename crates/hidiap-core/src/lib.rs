//! hidiap-core: in-application-programming over HID feature reports.
//!
//! This crate drives firmware updates and bulk data uploads for devices
//! that accept 64-byte framed commands on feature report 3.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, CRC16, frame encoder, acknowledgment parser
//! - **Payload**: Source images and chunk planning
//! - **Transport**: Feature-report I/O abstraction (nusb, mock)
//! - **State**: Session status machine and progress tracking
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use hidiap_core::{ByteImage, NusbTransport, SessionConfig, TransferSession};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = TransferSession::new(SessionConfig::default());
//!
//! session.connect(NusbTransport::find(0x3151, 0x4015)?)?;
//! session.enter_update_mode()?;
//!
//! let device = NusbTransport::wait_for_device(0x3151, 0x4015, Duration::from_secs(30))?;
//! session.connect(device)?;
//! session.transfer_firmware(&ByteImage::from_file("firmware.bin")?)?;
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use events::{
    LogEntry, LogLevel, NullObserver, RecordingObserver, TracingObserver, TransferEvent,
    TransferObserver,
};
pub use payload::ByteImage;
pub use protocol::{AckFrame, Frame, FrameMode, ParsedResponse, StaticCommand};
pub use session::{CancelToken, SessionConfig, SessionError, TransferSession};
pub use state::{Status, TransferKind};
pub use transport::{DeviceIdentity, MockTransport, NusbTransport, ReportTransport, TransportError};
