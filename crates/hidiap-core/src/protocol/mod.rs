//! Protocol module - IAP feature-report protocol definitions.

pub mod ack;
pub mod checksum;
pub mod constants;
pub mod frame;

pub use ack::{AckFrame, ParsedResponse, ResponseError, hex_preview, parse_response};
pub use checksum::{crc16, crc16_bytes};
pub use constants::*;
pub use frame::{Frame, FrameError, FrameMode, StaticCommand};
