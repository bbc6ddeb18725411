//! Report transport abstraction.
//!
//! Defines the `ReportTransport` trait for feature-report exchanges,
//! allowing different implementations (nusb, mock, etc.).

use std::fmt;

use thiserror::Error;

use crate::protocol::FRAME_SIZE;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("No HID interface on device VID={vid:04X} PID={pid:04X}")]
    NoHidInterface { vid: u16, pid: u16 },

    #[error("Device not open")]
    NotOpen,

    #[error("Send failed (report {report_id}): {message}")]
    SendFailed { report_id: u8, message: String },

    #[error("Receive failed (report {report_id}): {message}")]
    ReceiveFailed { report_id: u8, message: String },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Who is on the other end of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub product_name: Option<String>,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (VID: {:04X}, PID: {:04X})",
            self.product_name.as_deref().unwrap_or("Unknown device"),
            self.vendor_id,
            self.product_id
        )
    }
}

/// Abstract feature-report transport.
///
/// The handle belongs to the caller; a session only drives it through
/// this interface. Every call may block until the underlying I/O is done.
pub trait ReportTransport: Send {
    /// Open the device for report exchange.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Release the device.
    fn close(&mut self) -> Result<(), TransportError>;

    /// Send one full frame as a feature report.
    fn send_report(&self, report_id: u8, data: &[u8; FRAME_SIZE]) -> Result<(), TransportError>;

    /// Read one feature report. Bounded wait; fails if nothing arrives.
    fn receive_report(&self, report_id: u8) -> Result<Vec<u8>, TransportError>;

    /// Check if the device is open and still reachable.
    fn is_connected(&self) -> bool;

    /// Identity of the attached device.
    fn identity(&self) -> DeviceIdentity;
}

impl<T: ReportTransport + ?Sized> ReportTransport for Box<T> {
    fn open(&mut self) -> Result<(), TransportError> {
        (**self).open()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }

    fn send_report(&self, report_id: u8, data: &[u8; FRAME_SIZE]) -> Result<(), TransportError> {
        (**self).send_report(report_id, data)
    }

    fn receive_report(&self, report_id: u8) -> Result<Vec<u8>, TransportError> {
        (**self).receive_report(report_id)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn identity(&self) -> DeviceIdentity {
        (**self).identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display() {
        let id = DeviceIdentity {
            vendor_id: 0x1A2B,
            product_id: 0x00FF,
            product_name: Some("K20".into()),
        };
        assert_eq!(id.to_string(), "K20 (VID: 1A2B, PID: 00FF)");
        assert_eq!(
            DeviceIdentity::default().to_string(),
            "Unknown device (VID: 0000, PID: 0000)"
        );
    }
}
