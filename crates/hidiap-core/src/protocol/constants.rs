//! Protocol constants for the IAP feature-report protocol.
//!
//! Values match the device firmware byte for byte. Changing any of them
//! breaks interoperability.

// ============================================================================
// Report Geometry
// ============================================================================

/// Feature report id used for every command and acknowledgment.
pub const DEFAULT_REPORT_ID: u8 = 3;

/// Size of one report / frame on the wire (excluding the report id).
pub const FRAME_SIZE: usize = 64;

// ============================================================================
// Frame Layout (Host -> Device)
// ============================================================================

/// Fixed preamble opening every outbound frame.
pub const FRAME_PREAMBLE: [u8; 4] = [0xA5, 0x5A, 0xFC, 0x2E];

/// Fixed postamble closing the covered region of every outbound frame.
pub const FRAME_POSTAMBLE: [u8; 3] = [0xFC, 0x5A, 0xA5];

/// Bytes of framing around the payload: preamble, length, mode, postamble, CRC.
pub const FRAME_OVERHEAD: usize = FRAME_PREAMBLE.len() + 1 + 1 + FRAME_POSTAMBLE.len() + 2;

/// Largest payload that physically fits inside one frame.
pub const MAX_FRAME_PAYLOAD: usize = FRAME_SIZE - FRAME_OVERHEAD;

// ============================================================================
// Mode Bytes
// ============================================================================

/// Switch the running firmware into upgrade mode.
pub const MODE_ENTER_UPGRADE: u8 = 0x2B;

/// Firmware image data chunk.
pub const MODE_FIRMWARE_DATA: u8 = 0x80;

/// Reboot into the IAP loader.
pub const MODE_START_IAP: u8 = 0x81;

/// Re-send of the first chunk so the device can verify its received image.
pub const MODE_VERIFY: u8 = 0x82;

/// End of update; device commits the image.
pub const MODE_END_IAP: u8 = 0x83;

/// Total byte count of a bulk image (4 bytes, little-endian).
pub const MODE_BULK_SIZE: u8 = 0x73;

/// Bulk image data chunk.
pub const MODE_BULK_DATA: u8 = 0x74;

// ============================================================================
// Payload Limits
// ============================================================================

/// Firmware bytes carried per data frame.
pub const FIRMWARE_CHUNK_SIZE: usize = 52;

/// Bulk bytes carried per data frame.
pub const BULK_CHUNK_SIZE: usize = 47;

/// Payload of the bulk size announcement.
pub const BULK_SIZE_PAYLOAD_LEN: usize = 4;

// ============================================================================
// Acknowledgments (Device -> Host)
// ============================================================================

/// Header tag of inbound acknowledgment frames. The third byte (`0xFF`
/// instead of `0xFC`) marks the device-to-host direction.
pub const ACK_HEADER: [u8; 3] = [0xA5, 0x5A, 0xFF];

/// Offset of the echoed command byte in an acknowledgment.
pub const ACK_COMMAND_OFFSET: usize = 5;

/// Offset of the 4-byte little-endian packet number in an acknowledgment.
pub const ACK_PACKET_NUMBER_OFFSET: usize = 6;

/// Shortest buffer that can hold an acknowledgment's fixed fields.
pub const ACK_MIN_LEN: usize = ACK_PACKET_NUMBER_OFFSET + 4;

// ============================================================================
// Timing (defaults, overridable through SessionConfig)
// ============================================================================

/// Pause after each firmware data frame.
pub const FIRMWARE_PACING_MS: u64 = 15;

/// Pause after each bulk data frame.
pub const BULK_PACING_MS: u64 = 5;

/// Pause between the bulk size announcement and reading its acknowledgment.
pub const BULK_SIZE_ACK_DELAY_MS: u64 = 15;

/// Pause between the upgrade-mode frame and the IAP-entry frame.
pub const MODE_SWITCH_DELAY_MS: u64 = 500;

/// Firmware progress is logged every this many chunks.
pub const FIRMWARE_LOG_INTERVAL: usize = 50;

/// Bulk progress is logged every this many chunks.
pub const BULK_LOG_INTERVAL: usize = 100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_limits_fit_in_frame() {
        assert_eq!(MAX_FRAME_PAYLOAD, 53);
        assert!(FIRMWARE_CHUNK_SIZE <= MAX_FRAME_PAYLOAD);
        assert!(BULK_CHUNK_SIZE <= MAX_FRAME_PAYLOAD);
    }

    #[test]
    fn test_ack_header_differs_in_direction_byte() {
        assert_eq!(ACK_HEADER[..2], FRAME_PREAMBLE[..2]);
        assert_ne!(ACK_HEADER[2], FRAME_PREAMBLE[2]);
    }
}
