//! Acknowledgment frame parsing.
//!
//! Device acknowledgments look like command frames with the direction byte
//! flipped:
//!
//! ```text
//! [A5 5A FF][..][..][cmd][packet number, u32 LE][FF 5A A5][crc_hi][crc_lo]
//! ```
//!
//! Only the header tag is checked. Inbound checksums are not verified; the
//! device is trusted on this channel.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::{ACK_COMMAND_OFFSET, ACK_HEADER, ACK_MIN_LEN, ACK_PACKET_NUMBER_OFFSET};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    #[error("Response too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("Invalid response header: expected {expected:02X?}, got {actual:02X?}")]
    BadHeader { expected: [u8; 3], actual: [u8; 3] },
}

/// A decoded device acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    /// Command byte echoed by the device.
    pub command: u8,
    /// Packet / sequence number reported by the device.
    pub packet_number: u32,
}

impl AckFrame {
    /// Parse `data`, treating a missing or mismatched header as an error.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ResponseError> {
        if data.len() < ACK_MIN_LEN {
            return Err(ResponseError::TooShort {
                expected: ACK_MIN_LEN,
                actual: data.len(),
            });
        }

        let header = [data[0], data[1], data[2]];
        if header != ACK_HEADER {
            return Err(ResponseError::BadHeader {
                expected: ACK_HEADER,
                actual: header,
            });
        }

        Ok(Self {
            command: data[ACK_COMMAND_OFFSET],
            packet_number: LittleEndian::read_u32(
                &data[ACK_PACKET_NUMBER_OFFSET..ACK_PACKET_NUMBER_OFFSET + 4],
            ),
        })
    }
}

impl fmt::Display for AckFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ACK cmd=0x{:02X} pkt={}", self.command, self.packet_number)
    }
}

/// Outcome of a lenient parse. An invalid response is an expected result
/// ("no usable ack"), not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedResponse {
    Valid(AckFrame),
    Invalid,
}

impl ParsedResponse {
    pub fn is_valid(&self) -> bool {
        matches!(self, ParsedResponse::Valid(_))
    }
}

/// Lenient parse used for best-effort acknowledgment correlation.
pub fn parse_response(data: &[u8]) -> ParsedResponse {
    match AckFrame::from_bytes(data) {
        Ok(ack) => ParsedResponse::Valid(ack),
        Err(_) => ParsedResponse::Invalid,
    }
}

/// Uppercase hex dump of (at most) the first `limit` bytes.
pub fn hex_preview(data: &[u8], limit: usize) -> String {
    data.iter()
        .take(limit)
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack_bytes(command: u8, packet: u32) -> Vec<u8> {
        let mut data = vec![0xA5, 0x5A, 0xFF, 0x2E, 0x05, command];
        data.extend_from_slice(&packet.to_le_bytes());
        data.extend_from_slice(&[0xFF, 0x5A, 0xA5, 0x00, 0x00]);
        data.resize(64, 0);
        data
    }

    #[test]
    fn test_valid_ack() {
        let parsed = parse_response(&ack_bytes(0x74, 0x0000_0102));
        assert_eq!(
            parsed,
            ParsedResponse::Valid(AckFrame {
                command: 0x74,
                packet_number: 258
            })
        );
    }

    #[test]
    fn test_command_direction_tag_is_invalid() {
        let mut data = ack_bytes(0x74, 1);
        data[2] = 0xFC;
        assert_eq!(parse_response(&data), ParsedResponse::Invalid);
        assert_eq!(
            AckFrame::from_bytes(&data),
            Err(ResponseError::BadHeader {
                expected: [0xA5, 0x5A, 0xFF],
                actual: [0xA5, 0x5A, 0xFC]
            })
        );
    }

    #[test]
    fn test_short_buffer_is_invalid() {
        assert!(!parse_response(&[0xA5, 0x5A, 0xFF, 0x00]).is_valid());
        assert!(matches!(
            AckFrame::from_bytes(&[0xA5, 0x5A, 0xFF]),
            Err(ResponseError::TooShort { expected: 10, actual: 3 })
        ));
    }

    #[test]
    fn test_minimum_length_ack() {
        let data = [0xA5, 0x5A, 0xFF, 0x00, 0x00, 0x73, 0x01, 0x00, 0x00, 0x00];
        let ack = AckFrame::from_bytes(&data).unwrap();
        assert_eq!(ack.command, 0x73);
        assert_eq!(ack.packet_number, 1);
    }

    #[test]
    fn test_hex_preview() {
        assert_eq!(hex_preview(&[0xA5, 0x0F, 0x00], 2), "A5 0F");
        assert_eq!(hex_preview(&[], 8), "");
    }
}
