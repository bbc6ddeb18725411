//! Outbound frame construction.
//!
//! Every command the host sends is a single 64-byte frame:
//!
//! ```text
//! [A5 5A FC 2E][len][mode][payload ...][FC 5A A5][crc_hi][crc_lo][00 ...]
//! ```
//!
//! `len` is the payload length plus one (for the mode byte). The CRC covers
//! everything from the preamble through the postamble.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::checksum::crc16_bytes;
use super::constants::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("{mode} payload of {len} bytes exceeds the {max}-byte limit")]
    LengthExceeded {
        mode: FrameMode,
        len: usize,
        max: usize,
    },
    #[error("Image of {0} bytes cannot be announced in a 32-bit size field")]
    SizeOverflow(usize),
}

/// Command kind carried in the mode byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameMode {
    EnterUpgrade,
    StartIap,
    FirmwareData,
    Verify,
    EndIap,
    BulkSize,
    BulkData,
}

impl FrameMode {
    /// Mode byte as it appears on the wire.
    pub const fn byte(self) -> u8 {
        match self {
            FrameMode::EnterUpgrade => MODE_ENTER_UPGRADE,
            FrameMode::StartIap => MODE_START_IAP,
            FrameMode::FirmwareData => MODE_FIRMWARE_DATA,
            FrameMode::Verify => MODE_VERIFY,
            FrameMode::EndIap => MODE_END_IAP,
            FrameMode::BulkSize => MODE_BULK_SIZE,
            FrameMode::BulkData => MODE_BULK_DATA,
        }
    }

    /// Largest payload this mode accepts.
    pub const fn max_payload(self) -> usize {
        match self {
            FrameMode::FirmwareData | FrameMode::Verify => FIRMWARE_CHUNK_SIZE,
            FrameMode::BulkData => BULK_CHUNK_SIZE,
            FrameMode::BulkSize => BULK_SIZE_PAYLOAD_LEN,
            FrameMode::EnterUpgrade | FrameMode::StartIap | FrameMode::EndIap => {
                StaticCommand::from_mode(self).payload().len()
            }
        }
    }

    /// Reverse lookup from a mode byte (e.g. an echoed command in an ACK).
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            MODE_ENTER_UPGRADE => Some(FrameMode::EnterUpgrade),
            MODE_START_IAP => Some(FrameMode::StartIap),
            MODE_FIRMWARE_DATA => Some(FrameMode::FirmwareData),
            MODE_VERIFY => Some(FrameMode::Verify),
            MODE_END_IAP => Some(FrameMode::EndIap),
            MODE_BULK_SIZE => Some(FrameMode::BulkSize),
            MODE_BULK_DATA => Some(FrameMode::BulkData),
            _ => None,
        }
    }
}

impl fmt::Display for FrameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameMode::EnterUpgrade => "ENTER_UPGRADE",
            FrameMode::StartIap => "START_IAP",
            FrameMode::FirmwareData => "FW_DATA",
            FrameMode::Verify => "VERIFY",
            FrameMode::EndIap => "END_IAP",
            FrameMode::BulkSize => "BULK_SIZE",
            FrameMode::BulkData => "BULK_DATA",
        };
        write!(f, "{}(0x{:02X})", name, self.byte())
    }
}

/// Commands whose frames never depend on runtime data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticCommand {
    /// Ask the running firmware to prepare for an upgrade.
    EnterUpgrade,
    /// Reboot into the IAP loader. The device drops off the bus afterwards.
    StartIap,
    /// Finish the update and let the device commit the image.
    EndIap,
}

impl StaticCommand {
    const fn from_mode(mode: FrameMode) -> Self {
        match mode {
            FrameMode::StartIap => StaticCommand::StartIap,
            FrameMode::EndIap => StaticCommand::EndIap,
            _ => StaticCommand::EnterUpgrade,
        }
    }

    pub const fn mode(self) -> FrameMode {
        match self {
            StaticCommand::EnterUpgrade => FrameMode::EnterUpgrade,
            StaticCommand::StartIap => FrameMode::StartIap,
            StaticCommand::EndIap => FrameMode::EndIap,
        }
    }

    /// Fixed payload bytes following the mode byte.
    pub const fn payload(self) -> &'static [u8] {
        match self {
            StaticCommand::EnterUpgrade => &[0x01, 0x00, 0x01],
            StaticCommand::StartIap => &[0x00, 0x00],
            StaticCommand::EndIap => &[0x00, 0x00],
        }
    }
}

/// A complete, sealed 64-byte outbound frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    bytes: [u8; FRAME_SIZE],
}

impl Frame {
    /// Build a frame for `mode` carrying `payload`.
    ///
    /// Fails without touching any buffer if the payload is longer than the
    /// mode allows; payloads are never truncated.
    pub fn build(mode: FrameMode, payload: &[u8]) -> Result<Self, FrameError> {
        let max = mode.max_payload();
        if payload.len() > max {
            return Err(FrameError::LengthExceeded {
                mode,
                len: payload.len(),
                max,
            });
        }
        Ok(Self::encode(mode, payload))
    }

    /// Frame for one of the fixed commands.
    pub fn command(command: StaticCommand) -> Self {
        Self::encode(command.mode(), command.payload())
    }

    /// Firmware data frame for one chunk.
    pub fn firmware_chunk(chunk: &[u8]) -> Result<Self, FrameError> {
        Self::build(FrameMode::FirmwareData, chunk)
    }

    /// Verification frame, built from the first firmware chunk.
    pub fn verification(first_chunk: &[u8]) -> Result<Self, FrameError> {
        Self::build(FrameMode::Verify, first_chunk)
    }

    /// Bulk size announcement carrying the total image length.
    pub fn bulk_size(total_len: usize) -> Result<Self, FrameError> {
        let total = u32::try_from(total_len).map_err(|_| FrameError::SizeOverflow(total_len))?;
        let mut size = [0u8; BULK_SIZE_PAYLOAD_LEN];
        LittleEndian::write_u32(&mut size, total);
        Self::build(FrameMode::BulkSize, &size)
    }

    /// Bulk data frame for one chunk.
    pub fn bulk_data(chunk: &[u8]) -> Result<Self, FrameError> {
        Self::build(FrameMode::BulkData, chunk)
    }

    // Caller guarantees payload.len() <= MAX_FRAME_PAYLOAD.
    fn encode(mode: FrameMode, payload: &[u8]) -> Self {
        let mut bytes = [0u8; FRAME_SIZE];
        let payload_start = FRAME_PREAMBLE.len() + 2;
        let payload_end = payload_start + payload.len();
        let crc_start = payload_end + FRAME_POSTAMBLE.len();

        bytes[..FRAME_PREAMBLE.len()].copy_from_slice(&FRAME_PREAMBLE);
        bytes[FRAME_PREAMBLE.len()] = (payload.len() + 1) as u8;
        bytes[FRAME_PREAMBLE.len() + 1] = mode.byte();
        bytes[payload_start..payload_end].copy_from_slice(payload);
        bytes[payload_end..crc_start].copy_from_slice(&FRAME_POSTAMBLE);

        let crc = crc16_bytes(&bytes[..crc_start]);
        bytes[crc_start..crc_start + 2].copy_from_slice(&crc);

        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_SIZE] {
        &self.bytes
    }

    pub fn mode_byte(&self) -> u8 {
        self.bytes[FRAME_PREAMBLE.len() + 1]
    }

    pub fn mode(&self) -> Option<FrameMode> {
        FrameMode::from_byte(self.mode_byte())
    }

    /// Payload length, derived from the length byte.
    pub fn payload_len(&self) -> usize {
        (self.bytes[FRAME_PREAMBLE.len()] as usize).saturating_sub(1)
    }

    pub fn payload(&self) -> &[u8] {
        let start = FRAME_PREAMBLE.len() + 2;
        &self.bytes[start..start + self.payload_len()]
    }

    /// Bytes covered by the checksum (preamble through postamble).
    pub fn covered(&self) -> &[u8] {
        &self.bytes[..FRAME_PREAMBLE.len() + 2 + self.payload_len() + FRAME_POSTAMBLE.len()]
    }

    /// Checksum as stored in the frame, `[high, low]`.
    pub fn checksum(&self) -> [u8; 2] {
        let start = self.covered().len();
        [self.bytes[start], self.bytes[start + 1]]
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.covered().len() + 2;
        write!(f, "Frame(")?;
        for (i, b) in self.bytes[..end].iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        write!(f, ")")
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}
