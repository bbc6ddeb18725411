//! Event system for UI decoupling.
//!
//! Allows CLI/TUI/GUI to subscribe to session events without
//! tight coupling to the core logic.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Local};

use crate::state::{Status, TransferKind};
use crate::transport::DeviceIdentity;

/// Kind of a session log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Success => write!(f, "OK"),
        }
    }
}

/// One entry of the session's append-only log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Local>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Local::now(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:<5} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.level,
            self.message
        )
    }
}

/// Report direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Transmit (Host -> Device)
    Rx, // Receive (Device -> Host)
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by a transfer session.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Transport opened.
    DeviceConnected { identity: DeviceIdentity },
    /// Transport handle dropped (disconnect or IAP entry).
    DeviceReleased,
    /// Status changed.
    StatusChanged { from: Status, to: Status },
    /// A chunk was sent.
    Progress {
        kind: TransferKind,
        current: usize,
        total: usize,
        percent: u8,
    },
    /// Entry appended to the session log.
    Log(LogEntry),
    /// Feature report sent/received.
    Packet {
        direction: PacketDirection,
        report_id: u8,
        length: usize,
        preview: Vec<u8>,
    },
    /// Valid acknowledgment received.
    AckReceived { command: u8, packet_number: u32 },
    /// Acknowledged packet number disagrees with the chunk just sent.
    /// Advisory only; the transfer continues.
    AckMismatch { expected: u32, actual: u32 },
    /// Transfer finished successfully.
    Complete { kind: TransferKind },
}

/// Observer trait for receiving session events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait TransferObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &TransferEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl TransferObserver for NullObserver {
    fn on_event(&self, _event: &TransferEvent) {
        // Do nothing
    }
}

/// Observer that keeps every event, for inspection after the fact.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<TransferEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events seen so far.
    pub fn events(&self) -> Vec<TransferEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Percentages from every `Progress` event, in order.
    pub fn progress_values(&self) -> Vec<u8> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect()
    }

    /// `(from, to)` of every status change, in order.
    pub fn transitions(&self) -> Vec<(Status, Status)> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                TransferEvent::StatusChanged { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    /// `(expected, actual)` of every advisory ack mismatch.
    pub fn ack_mismatches(&self) -> Vec<(u32, u32)> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                TransferEvent::AckMismatch { expected, actual } => Some((*expected, *actual)),
                _ => None,
            })
            .collect()
    }
}

impl TransferObserver for RecordingObserver {
    fn on_event(&self, event: &TransferEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl TransferObserver for TracingObserver {
    fn on_event(&self, event: &TransferEvent) {
        match event {
            TransferEvent::DeviceConnected { identity } => {
                tracing::info!(
                    vid = %format!("{:04X}", identity.vendor_id),
                    pid = %format!("{:04X}", identity.product_id),
                    "Device connected"
                );
            }
            TransferEvent::DeviceReleased => {
                tracing::info!("Device released");
            }
            TransferEvent::StatusChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Status changed");
            }
            TransferEvent::Progress {
                kind,
                current,
                total,
                percent,
            } => {
                tracing::debug!(kind = %kind, current, total, progress = %format!("{}%", percent), "Progress");
            }
            TransferEvent::Log(entry) => match entry.level {
                LogLevel::Info | LogLevel::Success => tracing::info!("{}", entry.message),
                LogLevel::Warn => tracing::warn!("{}", entry.message),
                LogLevel::Error => tracing::error!("{}", entry.message),
            },
            TransferEvent::Packet {
                direction,
                report_id,
                length,
                ..
            } => {
                tracing::trace!(dir = %direction, report_id, len = length, "Feature report");
            }
            TransferEvent::AckReceived {
                command,
                packet_number,
            } => {
                tracing::debug!(cmd = %format!("0x{:02X}", command), packet_number, "ACK received");
            }
            TransferEvent::AckMismatch { expected, actual } => {
                tracing::warn!(expected, actual, "ACK packet number mismatch");
            }
            TransferEvent::Complete { kind } => {
                tracing::info!(kind = %kind, "Transfer complete");
            }
        }
    }
}
