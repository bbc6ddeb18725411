//! Mock report transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{DeviceIdentity, ReportTransport, TransportError};
use crate::protocol::{ACK_HEADER, FRAME_SIZE};

#[derive(Debug)]
struct MockState {
    /// Queued reports to return on receive.
    responses: VecDeque<Vec<u8>>,
    /// Captured sends.
    sent: Vec<(u8, [u8; FRAME_SIZE])>,
    /// Whether `open()` has been called (and not closed).
    opened: bool,
    /// Whether the device is "plugged in".
    connected: bool,
    fail_open: bool,
    /// Sends with an index at or above this value fail.
    fail_sends_from: Option<usize>,
    send_attempts: usize,
    identity: DeviceIdentity,
}

/// Mock transport for unit testing session logic.
///
/// Clones share state, so a test can keep a handle after moving the
/// transport into a session.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                responses: VecDeque::new(),
                sent: Vec::new(),
                opened: false,
                connected: true,
                fail_open: false,
                fail_sends_from: None,
                send_attempts: 0,
                identity: DeviceIdentity {
                    vendor_id: 0x3151,
                    product_id: 0x4015,
                    product_name: Some("Mock HID Device".to_string()),
                },
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panic inside a test must not hide the captured state.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a raw report to be returned on next receive.
    pub fn queue_response(&self, data: &[u8]) {
        self.lock().responses.push_back(data.to_vec());
    }

    /// Queue a well-formed acknowledgment.
    pub fn queue_ack(&self, command: u8, packet_number: u32) {
        let mut data = vec![0u8; FRAME_SIZE];
        data[..3].copy_from_slice(&ACK_HEADER);
        data[3] = 0x2E;
        data[4] = 0x05;
        data[5] = command;
        data[6..10].copy_from_slice(&packet_number.to_le_bytes());
        data[10..13].copy_from_slice(&[0xFF, 0x5A, 0xA5]);
        self.queue_response(&data);
    }

    /// All captured sends as `(report_id, frame)`.
    pub fn sent(&self) -> Vec<(u8, [u8; FRAME_SIZE])> {
        self.lock().sent.clone()
    }

    /// Captured frame bytes only.
    pub fn sent_frames(&self) -> Vec<[u8; FRAME_SIZE]> {
        self.lock().sent.iter().map(|(_, f)| *f).collect()
    }

    /// Mode byte of every captured frame, in order.
    pub fn sent_modes(&self) -> Vec<u8> {
        self.lock().sent.iter().map(|(_, f)| f[5]).collect()
    }

    /// Clear captured sends.
    pub fn clear_sent(&self) {
        self.lock().sent.clear();
    }

    pub fn sent_count(&self) -> usize {
        self.lock().sent.len()
    }

    /// Number of queued responses not yet consumed.
    pub fn pending_responses(&self) -> usize {
        self.lock().responses.len()
    }

    pub fn is_open(&self) -> bool {
        self.lock().opened
    }

    /// Make the next `open()` calls fail.
    pub fn fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Fail every send attempt whose 0-based index is `index` or later.
    pub fn fail_sends_from(&self, index: usize) {
        self.lock().fail_sends_from = Some(index);
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.lock().connected = false;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportTransport for MockTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.fail_open {
            return Err(TransportError::OpenFailed("mock open failure".into()));
        }
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state.opened = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.lock().opened = false;
        Ok(())
    }

    fn send_report(&self, report_id: u8, data: &[u8; FRAME_SIZE]) -> Result<(), TransportError> {
        let mut state = self.lock();
        let attempt = state.send_attempts;
        state.send_attempts += 1;

        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        if state.fail_sends_from.is_some_and(|from| attempt >= from) {
            return Err(TransportError::SendFailed {
                report_id,
                message: "mock send failure".into(),
            });
        }

        state.sent.push((report_id, *data));
        Ok(())
    }

    fn receive_report(&self, report_id: u8) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        state
            .responses
            .pop_front()
            .ok_or(TransportError::ReceiveFailed {
                report_id,
                message: "no response queued".into(),
            })
    }

    fn is_connected(&self) -> bool {
        let state = self.lock();
        state.connected && state.opened
    }

    fn identity(&self) -> DeviceIdentity {
        self.lock().identity.clone()
    }
}
