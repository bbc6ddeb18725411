//! Transfer session - orchestrates connect, IAP entry and image transfers.
//!
//! A session is single-owner and cooperative: every operation takes
//! `&mut self`, so at most one transfer is ever in flight, and every
//! transport call blocks the calling thread until its I/O finishes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::events::{
    LogEntry, LogLevel, PacketDirection, TracingObserver, TransferEvent, TransferObserver,
};
use crate::payload::{ByteImage, ChunkError, plan_chunks};
use crate::protocol::constants::*;
use crate::protocol::{AckFrame, Frame, FrameError, ParsedResponse, ResponseError, StaticCommand};
use crate::protocol::{hex_preview, parse_response};
use crate::state::{ChunkProgress, SessionState, Status, TransferKind};
use crate::transport::{ReportTransport, TransportError};

/// Bytes of an inbound report shown in the size-acknowledgment log line.
const RESPONSE_PREVIEW_LEN: usize = 32;

/// Errors returned by session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No device connected")]
    TransportUnavailable,

    #[error("Transport error: {0}")]
    TransportIo(#[from] TransportError),

    #[error("Invalid response frame: {0}")]
    InvalidResponseFrame(#[from] ResponseError),

    #[error("{0}")]
    LengthExceeded(FrameError),

    #[error("Image of {0} bytes is too large to announce")]
    ImageTooLarge(usize),

    #[error("cancelled")]
    Cancelled,

    #[error("{operation} not allowed: {reason}")]
    PreconditionViolation {
        operation: &'static str,
        reason: String,
    },

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(usize),

    #[error("Firmware image is empty")]
    EmptyImage,
}

impl From<FrameError> for SessionError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::SizeOverflow(len) => SessionError::ImageTooLarge(len),
            e @ FrameError::LengthExceeded { .. } => SessionError::LengthExceeded(e),
        }
    }
}

impl From<ChunkError> for SessionError {
    fn from(e: ChunkError) -> Self {
        match e {
            ChunkError::InvalidChunkSize(size) => SessionError::InvalidChunkSize(size),
        }
    }
}

/// Configuration for a transfer session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Feature report id for all exchanges.
    pub report_id: u8,
    /// Pause after each firmware data frame (ms).
    pub firmware_pacing_ms: u64,
    /// Pause after each bulk data frame (ms).
    pub bulk_pacing_ms: u64,
    /// Pause before reading the bulk size acknowledgment (ms).
    pub bulk_size_ack_delay_ms: u64,
    /// Pause between the upgrade-mode and IAP-entry frames (ms).
    pub mode_switch_delay_ms: u64,
    /// Log firmware progress every N chunks.
    pub firmware_log_interval: usize,
    /// Log bulk progress every N chunks.
    pub bulk_log_interval: usize,
    /// Abort a bulk transfer if the size acknowledgment is missing or malformed.
    pub require_size_ack: bool,
    /// How long a front end waits for re-enumeration after IAP entry (s).
    pub reconnect_timeout_secs: u64,
    /// Control transfer timeout for one report exchange (ms).
    pub report_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            report_id: DEFAULT_REPORT_ID,
            firmware_pacing_ms: FIRMWARE_PACING_MS,
            bulk_pacing_ms: BULK_PACING_MS,
            bulk_size_ack_delay_ms: BULK_SIZE_ACK_DELAY_MS,
            mode_switch_delay_ms: MODE_SWITCH_DELAY_MS,
            firmware_log_interval: FIRMWARE_LOG_INTERVAL,
            bulk_log_interval: BULK_LOG_INTERVAL,
            require_size_ack: false,
            reconnect_timeout_secs: 30,
            report_timeout_ms: 1000,
        }
    }
}

impl SessionConfig {
    /// Default configuration with every pacing delay set to zero.
    pub fn without_delays() -> Self {
        Self {
            firmware_pacing_ms: 0,
            bulk_pacing_ms: 0,
            bulk_size_ack_delay_ms: 0,
            mode_switch_delay_ms: 0,
            ..Self::default()
        }
    }

    /// Parse configuration from TOML text. Missing keys take defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML text.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}

/// Cooperative cancellation flag, shareable across threads and observers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Honored at the next chunk boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Transfer session - owns the state of one device-interaction workflow.
pub struct TransferSession<T: ReportTransport, O: TransferObserver = TracingObserver> {
    config: SessionConfig,
    observer: Arc<O>,
    transport: Option<T>,
    state: SessionState,
    logs: Vec<LogEntry>,
    cancel: CancelToken,
}

impl<T: ReportTransport> TransferSession<T, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<T: ReportTransport, O: TransferObserver> TransferSession<T, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            config,
            observer,
            transport: None,
            state: SessionState::new(),
            logs: Vec::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Use an externally created cancellation token.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    // ------------------------------------------------------------------
    // Read-only surface
    // ------------------------------------------------------------------

    pub fn status(&self) -> Status {
        self.state.status
    }

    pub fn progress(&self) -> u8 {
        self.state.progress
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    /// Cause of the most recent failure, if any.
    pub fn error(&self) -> Option<&str> {
        self.state.error.as_deref()
    }

    pub fn is_iap_armed(&self) -> bool {
        self.state.iap_armed
    }

    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Handle for requesting cancellation from elsewhere.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request cancellation of the running transfer.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drop every log entry. The session itself never removes entries.
    pub fn clear_logs(&mut self) {
        self.logs.clear();
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Open `transport` and make it the session's device.
    ///
    /// On failure the session returns to `Idle` with an error logged and
    /// the caller may retry.
    #[instrument(skip(self, transport))]
    pub fn connect(&mut self, mut transport: T) -> Result<(), SessionError> {
        self.require_settled("connect")?;

        self.set_status(Status::Connecting);
        self.log(LogLevel::Info, "Opening device...");

        if let Some(mut previous) = self.transport.take() {
            if let Err(e) = previous.close() {
                debug!(error = %e, "Closing previous transport failed");
            }
        }

        match transport.open() {
            Ok(()) => {
                let identity = transport.identity();
                self.transport = Some(transport);
                self.state.error = None;
                self.set_status(Status::Idle);
                self.log(LogLevel::Success, format!("Connected: {}", identity));
                self.emit(TransferEvent::DeviceConnected { identity });
                if self.state.iap_armed {
                    self.log(LogLevel::Info, "Device is in IAP mode, ready for firmware");
                }
                Ok(())
            }
            Err(e) => {
                self.state.error = Some(e.to_string());
                self.set_status(Status::Idle);
                self.log(LogLevel::Error, format!("Connection failed: {}", e));
                Err(e.into())
            }
        }
    }

    /// Treat the device as already running its IAP loader.
    ///
    /// For devices left in IAP mode by an earlier process; the handshake
    /// itself cannot be repeated once the loader is running.
    pub fn assume_iap_mode(&mut self) -> Result<(), SessionError> {
        self.require_settled("assume_iap_mode")?;
        if !self.state.iap_armed {
            self.state.iap_armed = true;
            self.log(LogLevel::Info, "Assuming device is in IAP mode");
        }
        Ok(())
    }

    /// Close and drop the current transport.
    #[instrument(skip(self))]
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        self.require_settled("disconnect")?;

        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                self.log(LogLevel::Warn, format!("Closing device failed: {}", e));
            }
            self.emit(TransferEvent::DeviceReleased);
            self.log(LogLevel::Info, "Device disconnected");
        }
        if self.state.status != Status::Idle {
            self.set_status(Status::Idle);
        }
        Ok(())
    }

    /// First phase of the update handshake.
    ///
    /// Sends the upgrade-mode frame, waits, then fires the IAP-entry frame
    /// without waiting for an answer: the device reboots into its loader
    /// and drops off the bus, so a failure of that send is expected and
    /// ignored. The transport is released and the session is IAP-armed;
    /// the caller must `connect` again before `transfer_firmware`.
    #[instrument(skip(self))]
    pub fn enter_update_mode(&mut self) -> Result<(), SessionError> {
        self.require_settled("enter_update_mode")?;
        if self.state.iap_armed {
            return Err(SessionError::PreconditionViolation {
                operation: "enter_update_mode",
                reason: "device is already in IAP mode".into(),
            });
        }
        self.require_transport()?;

        self.state.error = None;
        self.set_status(Status::EnteringUpgradeMode);
        self.log(LogLevel::Info, "Entering firmware upgrade mode...");

        if let Err(e) = self.send_frame(&Frame::command(StaticCommand::EnterUpgrade)) {
            return Err(self.fail("Entering upgrade mode", e));
        }
        self.log(LogLevel::Success, "Firmware upgrade mode entered");
        self.pace(self.config.mode_switch_delay_ms);

        self.set_status(Status::EnteringIapMode);
        self.log(LogLevel::Info, "Entering IAP mode...");

        // The device disconnects while handling this; failure is expected.
        if let Err(e) = self.send_frame(&Frame::command(StaticCommand::StartIap)) {
            debug!(error = %e, "IAP entry send failed after device detach");
        }

        // Drop without closing: the device is already gone.
        self.transport = None;
        self.emit(TransferEvent::DeviceReleased);

        self.state.iap_armed = true;
        self.set_status(Status::Idle);
        self.log(
            LogLevel::Success,
            "IAP command sent, device will re-enumerate",
        );
        self.log(
            LogLevel::Warn,
            "Reconnect the device, then transfer the firmware",
        );
        Ok(())
    }

    /// Second phase: send a firmware image to a device in IAP mode.
    #[instrument(skip(self, image), fields(len = image.len()))]
    pub fn transfer_firmware(&mut self, image: &ByteImage) -> Result<(), SessionError> {
        self.require_settled("transfer_firmware")?;
        if !self.state.iap_armed {
            return Err(SessionError::PreconditionViolation {
                operation: "transfer_firmware",
                reason: "device is not in IAP mode".into(),
            });
        }
        self.require_transport()?;
        if image.is_empty() {
            return Err(SessionError::EmptyImage);
        }

        self.cancel.reset();
        self.state.begin_transfer();
        self.set_status(Status::SendingFirmware);

        match self.run_firmware(image) {
            Ok(()) => {
                self.state.iap_armed = false;
                self.set_status(Status::Success);
                self.log(LogLevel::Success, "Firmware upgrade completed successfully");
                self.emit(TransferEvent::Complete {
                    kind: TransferKind::Firmware,
                });
                Ok(())
            }
            Err(e) => Err(self.fail("Firmware upgrade", e)),
        }
    }

    /// Send a bulk data image. Does not require IAP mode.
    ///
    /// Acknowledgments are read best-effort: missing or mismatched ones are
    /// logged as warnings and never abort the transfer (unless
    /// `require_size_ack` is set, which makes the size acknowledgment
    /// mandatory).
    #[instrument(skip(self, image), fields(len = image.len()))]
    pub fn transfer_bulk(&mut self, image: &ByteImage) -> Result<(), SessionError> {
        self.require_settled("transfer_bulk")?;
        self.require_transport()?;

        self.cancel.reset();
        self.state.begin_transfer();
        self.set_status(Status::SendingBulkSize);

        match self.run_bulk(image) {
            Ok(()) => {
                self.set_status(Status::Success);
                self.log(LogLevel::Success, "Bulk transfer completed successfully");
                self.emit(TransferEvent::Complete {
                    kind: TransferKind::Bulk,
                });
                Ok(())
            }
            Err(e) => Err(self.fail("Bulk transfer", e)),
        }
    }

    // ------------------------------------------------------------------
    // Transfer paths
    // ------------------------------------------------------------------

    fn run_firmware(&mut self, image: &ByteImage) -> Result<(), SessionError> {
        self.log(
            LogLevel::Info,
            format!("Firmware size: {} bytes", image.len()),
        );

        let chunks = plan_chunks(image, FIRMWARE_CHUNK_SIZE)?;
        self.log(LogLevel::Info, format!("Chunk count: {}", chunks.len()));

        let mut progress = ChunkProgress::new(chunks.len());
        for chunk in &chunks {
            self.check_cancelled()?;

            let frame = Frame::firmware_chunk(chunk.data)?;
            self.send_frame(&frame)?;
            self.pace(self.config.firmware_pacing_ms);

            progress.advance();
            self.report_progress(
                TransferKind::Firmware,
                &progress,
                self.config.firmware_log_interval,
            );
        }
        self.log(LogLevel::Success, "Firmware data sent");

        let first = chunks.first().ok_or(SessionError::EmptyImage)?;
        self.set_status(Status::Verifying);
        self.log(LogLevel::Info, "Sending verification frame...");
        self.send_frame(&Frame::verification(first.data)?)?;
        self.log(LogLevel::Success, "Verification frame sent");

        self.set_status(Status::Finishing);
        self.log(LogLevel::Info, "Finishing upgrade...");
        self.send_frame(&Frame::command(StaticCommand::EndIap))?;
        self.log(LogLevel::Success, "End-of-update command sent");

        Ok(())
    }

    fn run_bulk(&mut self, image: &ByteImage) -> Result<(), SessionError> {
        self.log(
            LogLevel::Info,
            format!("Bulk image size: {} bytes", image.len()),
        );

        let size_frame = Frame::bulk_size(image.len())?;
        self.send_frame(&size_frame)?;
        self.log(LogLevel::Info, "Bulk image size sent");

        self.pace(self.config.bulk_size_ack_delay_ms);
        self.read_size_ack()?;

        self.set_status(Status::SendingBulkData);
        let chunks = plan_chunks(image, BULK_CHUNK_SIZE)?;
        self.log(LogLevel::Info, format!("Chunk count: {}", chunks.len()));

        let mut progress = ChunkProgress::new(chunks.len());
        for chunk in &chunks {
            self.check_cancelled()?;

            let frame = Frame::bulk_data(chunk.data)?;
            self.send_frame(&frame)?;
            self.pace(self.config.bulk_pacing_ms);

            self.correlate_ack(chunk.sequence());

            progress.advance();
            self.report_progress(TransferKind::Bulk, &progress, self.config.bulk_log_interval);
        }
        self.log(LogLevel::Success, "Bulk data sent");

        Ok(())
    }

    /// Read the acknowledgment of the size announcement.
    fn read_size_ack(&mut self) -> Result<(), SessionError> {
        let data = match self.receive_report() {
            Ok(data) => data,
            Err(e) if self.config.require_size_ack => return Err(e.into()),
            Err(e) => {
                self.log(
                    LogLevel::Warn,
                    format!("No response to size announcement ({}), continuing", e),
                );
                return Ok(());
            }
        };

        self.log(
            LogLevel::Info,
            format!(
                "Device response: {}...",
                hex_preview(&data, RESPONSE_PREVIEW_LEN)
            ),
        );

        match AckFrame::from_bytes(&data) {
            Ok(ack) => {
                self.emit(TransferEvent::AckReceived {
                    command: ack.command,
                    packet_number: ack.packet_number,
                });
                self.log(
                    LogLevel::Success,
                    format!(
                        "Device acknowledged image size, packet number: {}",
                        ack.packet_number
                    ),
                );
                Ok(())
            }
            Err(e) if self.config.require_size_ack => Err(e.into()),
            Err(e) => {
                self.log(
                    LogLevel::Warn,
                    format!("Unexpected response format ({}), continuing", e),
                );
                Ok(())
            }
        }
    }

    /// Best-effort read and check of the acknowledgment for chunk `sequence`
    /// (1-based). Never fails the transfer.
    fn correlate_ack(&mut self, sequence: usize) {
        let data = match self.receive_report() {
            Ok(data) => data,
            Err(e) => {
                self.log(
                    LogLevel::Warn,
                    format!("Packet {}: no response ({})", sequence, e),
                );
                return;
            }
        };

        let interval = self.config.bulk_log_interval;
        if sequence == 1 || (interval > 0 && sequence % interval == 0) {
            self.log(
                LogLevel::Info,
                format!("Packet {} response: {}", sequence, hex_preview(&data, data.len())),
            );
        }

        if let ParsedResponse::Valid(ack) = parse_response(&data) {
            self.emit(TransferEvent::AckReceived {
                command: ack.command,
                packet_number: ack.packet_number,
            });

            let expected = sequence as u32;
            if ack.packet_number != expected {
                self.emit(TransferEvent::AckMismatch {
                    expected,
                    actual: ack.packet_number,
                });
                self.log(
                    LogLevel::Warn,
                    format!(
                        "Packet number mismatch: expected {}, got {}",
                        expected, ack.packet_number
                    ),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn require_settled(&self, operation: &'static str) -> Result<(), SessionError> {
        if self.state.status.is_settled() {
            Ok(())
        } else {
            Err(SessionError::PreconditionViolation {
                operation,
                reason: format!("session is busy ({})", self.state.status),
            })
        }
    }

    fn require_transport(&self) -> Result<(), SessionError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SessionError::TransportUnavailable)
        }
    }

    fn check_cancelled(&self) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            info!("Cancellation requested, stopping at chunk boundary");
            Err(SessionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Record a fatal error: cause stored and logged, status -> Error.
    fn fail(&mut self, context: &str, err: SessionError) -> SessionError {
        warn!(error = %err, "{} failed", context);
        self.state.error = Some(err.to_string());
        self.log(LogLevel::Error, format!("{} failed: {}", context, err));
        self.set_status(Status::Error);
        err
    }

    fn set_status(&mut self, status: Status) {
        let from = self.state.goto_status(status);
        self.emit(TransferEvent::StatusChanged { from, to: status });
        self.log(LogLevel::Info, format!("Status: {} -> {}", from, status));
    }

    fn report_progress(&mut self, kind: TransferKind, progress: &ChunkProgress, interval: usize) {
        let percent = self.state.raise_progress(progress.percent());
        self.emit(TransferEvent::Progress {
            kind,
            current: progress.sent,
            total: progress.total,
            percent,
        });
        if progress.is_log_point(interval) {
            self.log(
                LogLevel::Info,
                format!(
                    "Progress: {}/{} ({}%)",
                    progress.sent, progress.total, percent
                ),
            );
        }
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), SessionError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(SessionError::TransportUnavailable)?;
        let report_id = self.config.report_id;

        transport.send_report(report_id, frame.as_bytes())?;
        trace!(mode = %format!("0x{:02X}", frame.mode_byte()), "Frame sent");
        self.emit(TransferEvent::Packet {
            direction: PacketDirection::Tx,
            report_id,
            length: frame.as_bytes().len(),
            preview: frame.as_bytes().iter().take(RESPONSE_PREVIEW_LEN).cloned().collect(),
        });
        Ok(())
    }

    fn receive_report(&self) -> Result<Vec<u8>, TransportError> {
        let transport = self.transport.as_ref().ok_or(TransportError::NotOpen)?;
        let report_id = self.config.report_id;

        let data = transport.receive_report(report_id)?;
        self.emit(TransferEvent::Packet {
            direction: PacketDirection::Rx,
            report_id,
            length: data.len(),
            preview: data.iter().take(RESPONSE_PREVIEW_LEN).cloned().collect(),
        });
        Ok(data)
    }

    fn pace(&self, millis: u64) {
        if millis > 0 {
            thread::sleep(Duration::from_millis(millis));
        }
    }

    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(level, message);
        self.emit(TransferEvent::Log(entry.clone()));
        self.logs.push(entry);
    }

    fn emit(&self, event: TransferEvent) {
        self.observer.on_event(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingObserver;
    use crate::transport::MockTransport;

    type TestSession = TransferSession<MockTransport, RecordingObserver>;

    fn session() -> (TestSession, MockTransport, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::new());
        let session = TransferSession::with_observer(SessionConfig::without_delays(), observer.clone());
        (session, MockTransport::new(), observer)
    }

    /// Session that has completed the two-phase handshake and reconnected.
    fn armed_session() -> (TestSession, MockTransport, Arc<RecordingObserver>) {
        let (mut session, mock, observer) = session();
        session.connect(mock.clone()).unwrap();
        session.enter_update_mode().unwrap();
        session.connect(mock.clone()).unwrap();
        mock.clear_sent();
        (session, mock, observer)
    }

    fn image(len: usize) -> ByteImage {
        ByteImage::from((0..len).map(|i| i as u8).collect::<Vec<u8>>())
    }

    fn messages(session: &TestSession, level: LogLevel) -> Vec<String> {
        session
            .logs()
            .iter()
            .filter(|e| e.level == level)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Cancels the session when a given chunk has been reported.
    struct CancelAfter {
        token: CancelToken,
        chunk: usize,
    }

    impl TransferObserver for CancelAfter {
        fn on_event(&self, event: &TransferEvent) {
            if let TransferEvent::Progress { current, .. } = event {
                if *current == self.chunk {
                    self.token.cancel();
                }
            }
        }
    }

    #[test]
    fn test_connect_logs_identity() {
        let (mut session, mock, observer) = session();
        session.connect(mock.clone()).unwrap();

        assert_eq!(session.status(), Status::Idle);
        assert!(session.is_connected());
        assert!(mock.is_open());
        assert_eq!(
            observer.transitions(),
            vec![
                (Status::Idle, Status::Connecting),
                (Status::Connecting, Status::Idle)
            ]
        );
        let success = messages(&session, LogLevel::Success);
        assert!(success[0].contains("Mock HID Device"));
        assert!(success[0].contains("VID: 3151"));
    }

    #[test]
    fn test_connect_failure_is_retryable() {
        let (mut session, mock, _) = session();
        mock.fail_open(true);

        let err = session.connect(mock.clone()).unwrap_err();
        assert!(matches!(err, SessionError::TransportIo(_)));
        assert_eq!(session.status(), Status::Idle);
        assert!(!session.is_connected());
        assert!(session.error().is_some());
        assert_eq!(messages(&session, LogLevel::Error).len(), 1);

        mock.fail_open(false);
        session.connect(mock).unwrap();
        assert!(session.is_connected());
        assert!(session.error().is_none());
    }

    #[test]
    fn test_enter_update_mode_handshake() {
        let (mut session, mock, _) = session();
        session.connect(mock.clone()).unwrap();
        session.enter_update_mode().unwrap();

        let frames = mock.sent();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].1, Frame::command(StaticCommand::EnterUpgrade).as_bytes());
        assert_eq!(&frames[1].1, Frame::command(StaticCommand::StartIap).as_bytes());
        assert!(frames.iter().all(|(id, _)| *id == DEFAULT_REPORT_ID));

        assert!(session.is_iap_armed());
        assert!(!session.is_connected());
        assert_eq!(session.status(), Status::Idle);
    }

    #[test]
    fn test_iap_entry_send_failure_is_swallowed() {
        let (mut session, mock, _) = session();
        session.connect(mock.clone()).unwrap();
        mock.fail_sends_from(1);

        session.enter_update_mode().unwrap();
        assert_eq!(mock.sent_count(), 1);
        assert!(session.is_iap_armed());
        assert_eq!(session.status(), Status::Idle);
        assert!(session.error().is_none());
    }

    #[test]
    fn test_upgrade_mode_send_failure_is_fatal() {
        let (mut session, mock, _) = session();
        session.connect(mock.clone()).unwrap();
        mock.fail_sends_from(0);

        let err = session.enter_update_mode().unwrap_err();
        assert!(matches!(err, SessionError::TransportIo(_)));
        assert_eq!(session.status(), Status::Error);
        assert!(!session.is_iap_armed());
    }

    #[test]
    fn test_enter_update_mode_preconditions() {
        let (mut session, mock, _) = session();
        assert!(matches!(
            session.enter_update_mode(),
            Err(SessionError::TransportUnavailable)
        ));
        assert!(session.logs().is_empty());

        session.connect(mock.clone()).unwrap();
        session.enter_update_mode().unwrap();
        session.connect(mock).unwrap();
        assert!(matches!(
            session.enter_update_mode(),
            Err(SessionError::PreconditionViolation { .. })
        ));
    }

    #[test]
    fn test_firmware_transfer_130_bytes() {
        let (mut session, mock, observer) = armed_session();
        let img = image(130);

        session.transfer_firmware(&img).unwrap();

        assert_eq!(observer.progress_values(), vec![33, 67, 100]);
        assert_eq!(mock.sent_modes(), vec![0x80, 0x80, 0x80, 0x82, 0x83]);

        let frames = mock.sent_frames();
        let first = Frame::firmware_chunk(&img.as_bytes()[..52]).unwrap();
        let last = Frame::firmware_chunk(&img.as_bytes()[104..]).unwrap();
        assert_eq!(&frames[0], first.as_bytes());
        assert_eq!(&frames[2], last.as_bytes());
        assert_eq!(frames[2][4], 27);
        assert_eq!(&frames[3][6..58], &img.as_bytes()[..52]);

        assert_eq!(session.status(), Status::Success);
        assert_eq!(session.progress(), 100);
        assert!(!session.is_iap_armed());

        let path: Vec<Status> = observer.transitions().iter().map(|(_, to)| *to).collect();
        assert!(path.ends_with(&[
            Status::SendingFirmware,
            Status::Verifying,
            Status::Finishing,
            Status::Success
        ]));
    }

    #[test]
    fn test_transfer_while_busy_is_rejected_without_side_effects() {
        let (mut session, _mock, _) = armed_session();
        session.state.status = Status::SendingFirmware;
        session.state.progress = 42;
        let log_len = session.logs().len();

        let err = session.transfer_firmware(&image(10)).unwrap_err();
        assert!(matches!(
            err,
            SessionError::PreconditionViolation {
                operation: "transfer_firmware",
                ..
            }
        ));
        assert_eq!(session.status(), Status::SendingFirmware);
        assert_eq!(session.progress(), 42);
        assert_eq!(session.logs().len(), log_len);
    }

    #[test]
    fn test_firmware_requires_iap_mode() {
        let (mut session, mock, _) = session();
        session.connect(mock.clone()).unwrap();
        let log_len = session.logs().len();

        assert!(matches!(
            session.transfer_firmware(&image(10)),
            Err(SessionError::PreconditionViolation { .. })
        ));
        assert_eq!(mock.sent_count(), 0);
        assert_eq!(session.logs().len(), log_len);
    }

    #[test]
    fn test_firmware_requires_reconnect_after_iap_entry() {
        let (mut session, mock, _) = session();
        session.connect(mock).unwrap();
        session.enter_update_mode().unwrap();

        assert!(matches!(
            session.transfer_firmware(&image(10)),
            Err(SessionError::TransportUnavailable)
        ));
    }

    #[test]
    fn test_assume_iap_mode_allows_firmware() {
        let (mut session, mock, _) = session();
        session.assume_iap_mode().unwrap();
        session.connect(mock.clone()).unwrap();

        session.transfer_firmware(&image(52)).unwrap();
        assert_eq!(mock.sent_modes(), vec![0x80, 0x82, 0x83]);
        assert!(!session.is_iap_armed());
    }

    #[test]
    fn test_empty_firmware_image_rejected() {
        let (mut session, mock, _) = armed_session();
        let status = session.status();

        assert!(matches!(
            session.transfer_firmware(&ByteImage::from(Vec::<u8>::new())),
            Err(SessionError::EmptyImage)
        ));
        assert_eq!(session.status(), status);
        assert_eq!(mock.sent_count(), 0);
    }

    #[test]
    fn test_cancel_after_second_of_five_chunks() {
        let token = CancelToken::new();
        let observer = Arc::new(CancelAfter {
            token: token.clone(),
            chunk: 2,
        });
        let mut session: TransferSession<MockTransport, CancelAfter> =
            TransferSession::with_observer(SessionConfig::without_delays(), observer)
                .with_cancel_token(token);
        let mock = MockTransport::new();
        session.connect(mock.clone()).unwrap();
        session.enter_update_mode().unwrap();
        session.connect(mock.clone()).unwrap();
        mock.clear_sent();

        let err = session.transfer_firmware(&image(5 * 52)).unwrap_err();

        assert!(matches!(err, SessionError::Cancelled));
        assert_eq!(mock.sent_count(), 2);
        assert_eq!(mock.sent_modes(), vec![0x80, 0x80]);
        assert_eq!(session.status(), Status::Error);
        assert_eq!(session.error(), Some("cancelled"));
        assert_eq!(session.progress(), 40);
        // Still armed: the device never received the end-of-update command.
        assert!(session.is_iap_armed());
    }

    #[test]
    fn test_send_failure_aborts_remaining_chunks() {
        let (mut session, mock, _) = armed_session();
        // Index counts every attempt made on this mock so far (2 handshake frames).
        mock.fail_sends_from(3);

        let err = session.transfer_firmware(&image(4 * 52)).unwrap_err();
        assert!(matches!(err, SessionError::TransportIo(_)));
        assert_eq!(mock.sent_count(), 1);
        assert_eq!(session.status(), Status::Error);
        assert!(
            messages(&session, LogLevel::Error)
                .iter()
                .any(|m| m.starts_with("Firmware upgrade failed"))
        );
    }

    #[test]
    fn test_retry_after_error() {
        let (mut session, mock, _) = armed_session();
        mock.fail_sends_from(3);
        assert!(session.transfer_firmware(&image(100)).is_err());
        assert_eq!(session.status(), Status::Error);

        let fresh = MockTransport::new();
        session.connect(fresh.clone()).unwrap();
        session.transfer_firmware(&image(100)).unwrap();
        assert_eq!(session.status(), Status::Success);
        assert_eq!(fresh.sent_count(), 4);
    }

    #[test]
    fn test_bulk_transfer_with_acks() {
        let (mut session, mock, observer) = session();
        session.connect(mock.clone()).unwrap();
        mock.queue_ack(MODE_BULK_SIZE, 0);
        for n in 1..=3 {
            mock.queue_ack(MODE_BULK_DATA, n);
        }

        session.transfer_bulk(&image(100)).unwrap();

        assert_eq!(mock.sent_modes(), vec![0x73, 0x74, 0x74, 0x74]);
        let frames = mock.sent_frames();
        assert_eq!(&frames[0][6..10], &100u32.to_le_bytes());
        assert_eq!(frames[3][4], (100 - 2 * 47 + 1) as u8);

        assert_eq!(session.status(), Status::Success);
        assert_eq!(observer.progress_values(), vec![33, 67, 100]);
        assert!(observer.ack_mismatches().is_empty());
        assert!(messages(&session, LogLevel::Warn).is_empty());
        assert_eq!(mock.pending_responses(), 0);
        // Bulk mode never touches IAP state.
        assert!(!session.is_iap_armed());
    }

    #[test]
    fn test_bulk_ack_mismatch_is_advisory() {
        let (mut session, mock, observer) = session();
        session.connect(mock.clone()).unwrap();
        mock.queue_ack(MODE_BULK_SIZE, 0);
        mock.queue_ack(MODE_BULK_DATA, 1);
        mock.queue_ack(MODE_BULK_DATA, 7);

        session.transfer_bulk(&image(94)).unwrap();

        assert_eq!(session.status(), Status::Success);
        assert_eq!(observer.ack_mismatches(), vec![(2, 7)]);
        let warnings = messages(&session, LogLevel::Warn);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("expected 2, got 7"));
    }

    #[test]
    fn test_bulk_without_responses_completes() {
        let (mut session, mock, _) = session();
        session.connect(mock.clone()).unwrap();

        session.transfer_bulk(&image(47 * 2)).unwrap();

        assert_eq!(session.status(), Status::Success);
        assert_eq!(mock.sent_count(), 3);
        // Size ack + one per chunk.
        assert_eq!(messages(&session, LogLevel::Warn).len(), 3);
    }

    #[test]
    fn test_bulk_invalid_size_ack_continues() {
        let (mut session, mock, _) = session();
        session.connect(mock.clone()).unwrap();
        mock.queue_response(&[0xA5, 0x5A, 0xFC, 0, 0, 0x73, 0, 0, 0, 0]);

        session.transfer_bulk(&image(10)).unwrap();
        assert_eq!(session.status(), Status::Success);
        assert!(
            messages(&session, LogLevel::Warn)
                .iter()
                .any(|m| m.starts_with("Unexpected response format"))
        );
    }

    #[test]
    fn test_bulk_mandatory_size_ack() {
        let observer = Arc::new(RecordingObserver::new());
        let config = SessionConfig {
            require_size_ack: true,
            ..SessionConfig::without_delays()
        };
        let mut session: TestSession = TransferSession::with_observer(config, observer);
        let mock = MockTransport::new();
        session.connect(mock.clone()).unwrap();
        mock.queue_response(&[0xA5, 0x5A, 0xFC, 0, 0, 0x73, 0, 0, 0, 0]);

        let err = session.transfer_bulk(&image(10)).unwrap_err();
        assert!(matches!(err, SessionError::InvalidResponseFrame(_)));
        assert_eq!(session.status(), Status::Error);
        assert_eq!(mock.sent_modes(), vec![0x73]);
    }

    #[test]
    fn test_bulk_cancel() {
        let token = CancelToken::new();
        let observer = Arc::new(CancelAfter {
            token: token.clone(),
            chunk: 1,
        });
        let mut session: TransferSession<MockTransport, CancelAfter> =
            TransferSession::with_observer(SessionConfig::without_delays(), observer)
                .with_cancel_token(token);
        let mock = MockTransport::new();
        session.connect(mock.clone()).unwrap();

        let err = session.transfer_bulk(&image(47 * 3)).unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
        assert_eq!(mock.sent_modes(), vec![0x73, 0x74]);
        assert_eq!(session.error(), Some("cancelled"));
    }

    #[test]
    fn test_cancel_before_start_is_cleared() {
        let (mut session, mock, _) = session();
        session.connect(mock.clone()).unwrap();
        session.cancel();

        session.transfer_bulk(&image(10)).unwrap();
        assert_eq!(session.status(), Status::Success);
    }

    #[test]
    fn test_log_is_ordered_and_clearable() {
        let (mut session, _mock, _) = armed_session();
        session.transfer_firmware(&image(60)).unwrap();

        let logs = session.logs();
        assert!(logs.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(logs.iter().any(|e| e.message == "Progress: 2/2 (100%)"));

        session.clear_logs();
        assert!(session.logs().is_empty());
        assert_eq!(session.status(), Status::Success);
    }

    #[test]
    fn test_disconnect_releases_transport() {
        let (mut session, mock, _) = session();
        session.connect(mock.clone()).unwrap();
        session.disconnect().unwrap();

        assert!(!session.is_connected());
        assert!(!mock.is_open());
        assert!(matches!(
            session.transfer_bulk(&image(1)),
            Err(SessionError::TransportUnavailable)
        ));
    }

    #[test]
    fn test_config_defaults_and_toml() {
        let config = SessionConfig::default();
        assert_eq!(config.report_id, 3);
        assert_eq!(config.firmware_pacing_ms, 15);
        assert_eq!(config.bulk_pacing_ms, 5);

        let partial = SessionConfig::from_toml_str("bulk_pacing_ms = 8\nrequire_size_ack = true\n").unwrap();
        assert_eq!(partial.bulk_pacing_ms, 8);
        assert!(partial.require_size_ack);
        assert_eq!(partial.firmware_pacing_ms, 15);

        assert_eq!(config.report_timeout_ms, 1000);

        let text = config.to_toml_string().unwrap();
        assert_eq!(SessionConfig::from_toml_str(&text).unwrap(), config);
    }

    fn progress_log_points(session: &TestSession) -> Vec<usize> {
        messages(session, LogLevel::Info)
            .iter()
            .filter_map(|m| m.strip_prefix("Progress: "))
            .filter_map(|m| m.split('/').next()?.parse().ok())
            .collect()
    }

    fn ack_dump_points(session: &TestSession) -> Vec<usize> {
        messages(session, LogLevel::Info)
            .iter()
            .filter(|m| m.contains(" response: "))
            .filter_map(|m| m.strip_prefix("Packet "))
            .filter_map(|m| m.split_whitespace().next()?.parse().ok())
            .collect()
    }

    #[test]
    fn test_firmware_progress_log_cadence() {
        let (mut session, mock, _) = armed_session();

        session
            .transfer_firmware(&image(101 * FIRMWARE_CHUNK_SIZE))
            .unwrap();

        assert_eq!(mock.sent_count(), 101 + 2);
        assert_eq!(progress_log_points(&session), vec![50, 100, 101]);
    }

    #[test]
    fn test_bulk_progress_and_ack_dump_cadence() {
        let (mut session, mock, _) = session();
        session.connect(mock.clone()).unwrap();
        mock.queue_ack(MODE_BULK_SIZE, 0);
        for n in 1..=201 {
            mock.queue_ack(MODE_BULK_DATA, n);
        }

        session.transfer_bulk(&image(201 * BULK_CHUNK_SIZE)).unwrap();

        assert_eq!(session.status(), Status::Success);
        assert_eq!(progress_log_points(&session), vec![100, 200, 201]);
        assert_eq!(ack_dump_points(&session), vec![1, 100, 200]);

        // Dumps cover the whole report, not the 32-byte preview.
        let dump = messages(&session, LogLevel::Info)
            .into_iter()
            .find(|m| m.starts_with("Packet 1 response: "))
            .unwrap();
        assert_eq!(dump.split_whitespace().count(), 3 + FRAME_SIZE);
    }

    #[test]
    fn test_frame_errors_map_to_distinct_causes() {
        assert!(matches!(
            SessionError::from(FrameError::SizeOverflow(usize::MAX)),
            SessionError::ImageTooLarge(usize::MAX)
        ));

        let err = Frame::bulk_data(&[0u8; BULK_CHUNK_SIZE + 1]).unwrap_err();
        assert!(matches!(
            SessionError::from(err),
            SessionError::LengthExceeded(FrameError::LengthExceeded { max: 47, .. })
        ));
    }
}
