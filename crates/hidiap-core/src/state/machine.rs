//! Session status state machine.

use std::fmt;

/// Status of a transfer session.
///
/// ```text
/// Idle -> Connecting -> Idle
/// Idle -> EnteringUpgradeMode -> EnteringIapMode -> Idle (IAP armed)
/// Idle (IAP armed) -> SendingFirmware -> Verifying -> Finishing -> Success | Error
/// Idle -> SendingBulkSize -> SendingBulkData -> Success | Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Idle,
    Connecting,
    EnteringUpgradeMode,
    EnteringIapMode,
    SendingFirmware,
    Verifying,
    Finishing,
    SendingBulkSize,
    SendingBulkData,
    Success,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Idle => write!(f, "Idle"),
            Status::Connecting => write!(f, "Connecting"),
            Status::EnteringUpgradeMode => write!(f, "Entering Upgrade Mode"),
            Status::EnteringIapMode => write!(f, "Entering IAP Mode"),
            Status::SendingFirmware => write!(f, "Sending Firmware"),
            Status::Verifying => write!(f, "Verifying"),
            Status::Finishing => write!(f, "Finishing"),
            Status::SendingBulkSize => write!(f, "Sending Bulk Size"),
            Status::SendingBulkData => write!(f, "Sending Bulk Data"),
            Status::Success => write!(f, "Success"),
            Status::Error => write!(f, "Error"),
        }
    }
}

impl Status {
    /// Human-readable description for a status line.
    pub fn message(&self) -> &'static str {
        match self {
            Status::Idle => "Waiting to start",
            Status::Connecting => "Connecting to device...",
            Status::EnteringUpgradeMode => "Entering firmware upgrade mode...",
            Status::EnteringIapMode => "Entering IAP mode...",
            Status::SendingFirmware => "Sending firmware data...",
            Status::Verifying => "Verifying...",
            Status::Finishing => "Finishing upgrade...",
            Status::SendingBulkSize => "Sending bulk image size...",
            Status::SendingBulkData => "Sending bulk image data...",
            Status::Success => "Upgrade succeeded",
            Status::Error => "Upgrade failed",
        }
    }

    /// No operation is in flight; a new one may start.
    pub fn is_settled(&self) -> bool {
        matches!(self, Status::Idle | Status::Success | Status::Error)
    }
}

/// Which transfer path an operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Firmware,
    Bulk,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Firmware => write!(f, "firmware"),
            TransferKind::Bulk => write!(f, "bulk"),
        }
    }
}

/// Chunk progress tracking for one transfer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Chunks sent so far.
    pub sent: usize,
    /// Total chunks planned.
    pub total: usize,
}

impl ChunkProgress {
    pub fn new(total: usize) -> Self {
        Self { sent: 0, total }
    }

    pub fn advance(&mut self) {
        self.sent += 1;
    }

    pub fn is_done(&self) -> bool {
        self.sent >= self.total
    }

    /// Percentage sent, rounded half up.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        let sent = self.sent.min(self.total);
        ((sent * 100 + self.total / 2) / self.total) as u8
    }

    /// Whether this point should be written to the session log.
    pub fn is_log_point(&self, interval: usize) -> bool {
        (interval > 0 && self.sent % interval == 0) || self.sent == self.total
    }
}

/// Mutable session state.
#[derive(Debug, Default, Clone)]
pub struct SessionState {
    /// Current status.
    pub status: Status,
    /// 0-100, non-decreasing within one transfer.
    pub progress: u8,
    /// The device was told to reboot into IAP; the next firmware
    /// transfer may proceed once reconnected.
    pub iap_armed: bool,
    /// Cause of the last failure.
    pub error: Option<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to a new status, returning the previous one.
    pub fn goto_status(&mut self, new_status: Status) -> Status {
        tracing::info!(from = %self.status, to = %new_status, "Status transition");
        std::mem::replace(&mut self.status, new_status)
    }

    /// Raise progress. Never moves backwards within a transfer.
    pub fn raise_progress(&mut self, percent: u8) -> u8 {
        self.progress = self.progress.max(percent.min(100));
        self.progress
    }

    /// Start a new transfer: progress back to 0, previous error cleared.
    pub fn begin_transfer(&mut self) {
        self.progress = 0;
        self.error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_rounding() {
        let mut p = ChunkProgress::new(3);
        let mut seen = Vec::new();
        while !p.is_done() {
            p.advance();
            seen.push(p.percent());
        }
        assert_eq!(seen, vec![33, 67, 100]);
    }

    #[test]
    fn test_progress_half_rounds_up() {
        let p = ChunkProgress { sent: 1, total: 8 };
        assert_eq!(p.percent(), 13);
        let p = ChunkProgress { sent: 1, total: 200 };
        assert_eq!(p.percent(), 1);
    }

    #[test]
    fn test_log_points() {
        let mut p = ChunkProgress::new(120);
        let mut points = Vec::new();
        while !p.is_done() {
            p.advance();
            if p.is_log_point(50) {
                points.push(p.sent);
            }
        }
        assert_eq!(points, vec![50, 100, 120]);
    }

    #[test]
    fn test_settled_statuses() {
        assert!(Status::Idle.is_settled());
        assert!(Status::Success.is_settled());
        assert!(Status::Error.is_settled());
        assert!(!Status::SendingFirmware.is_settled());
        assert!(!Status::Connecting.is_settled());
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut state = SessionState::new();
        state.raise_progress(40);
        assert_eq!(state.raise_progress(20), 40);
        assert_eq!(state.raise_progress(150), 100);
        state.begin_transfer();
        assert_eq!(state.progress, 0);
    }

    #[test]
    fn test_goto_status_returns_previous() {
        let mut state = SessionState::new();
        assert_eq!(state.goto_status(Status::Connecting), Status::Idle);
        assert_eq!(state.status, Status::Connecting);
    }
}
