//! nusb-based HID feature-report transport.
//!
//! Feature reports are exchanged with HID class control requests on the
//! device's HID interface:
//! - `SET_REPORT` (0x09), wValue = (Feature << 8) | report id
//! - `GET_REPORT` (0x01), same wValue
//!
//! Composite devices expose several HID interfaces. The one whose report
//! descriptor declares the session's Feature report id is claimed; if none
//! does, the first HID interface is used with a warning.
//!
//! Key nusb 0.2 API patterns:
//! - `list_devices().wait()` for device enumeration
//! - `device_info.open().wait()` to open device
//! - `device.control_in(..)` for the standard GET_DESCRIPTOR request
//! - `device.detach_and_claim_interface(n).wait()` to take the interface from the kernel HID driver
//! - `interface.control_out(..)` / `interface.control_in(..)` for class requests

use std::thread;
use std::time::{Duration, Instant};

use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use nusb::{Device, DeviceInfo, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::hid_descriptor::declares_feature_report;
use super::traits::{DeviceIdentity, ReportTransport, TransportError};
use crate::protocol::{DEFAULT_REPORT_ID, FRAME_SIZE};

const USB_CLASS_HID: u8 = 0x03;
const HID_GET_REPORT: u8 = 0x01;
const HID_SET_REPORT: u8 = 0x09;
const HID_REPORT_TYPE_FEATURE: u16 = 0x03;

const USB_REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const HID_DESCRIPTOR_TYPE_REPORT: u16 = 0x22;
const REPORT_DESCRIPTOR_MAX_LEN: u16 = 4096;

/// Default control transfer timeout for a single report exchange.
const DEFAULT_REPORT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Interval between enumeration polls in [`NusbTransport::wait_for_device`].
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// nusb-based feature-report transport.
pub struct NusbTransport {
    info: DeviceInfo,
    hid_interfaces: Vec<u8>,
    report_id: u8,
    interface_override: Option<u8>,
    interface_number: Option<u8>,
    interface: Option<Interface>,
    timeout: Duration,
}

impl NusbTransport {
    /// Locate a device with specific VID/PID. The device is not opened yet.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn find(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        Self::from_device_info(info)
    }

    /// Poll until a device with VID/PID appears or `timeout` elapses.
    ///
    /// Used after the IAP entry command, when the device drops off the bus
    /// and re-enumerates.
    pub fn wait_for_device(vid: u16, pid: u16, timeout: Duration) -> Result<Self, TransportError> {
        info!("Waiting for device...");
        let start = Instant::now();
        let mut poll_count = 0u64;

        loop {
            poll_count += 1;

            match Self::find(vid, pid) {
                Ok(t) => {
                    info!(
                        vid = %format!("{:04X}", vid),
                        pid = %format!("{:04X}", pid),
                        "Device found after {} polls",
                        poll_count
                    );
                    return Ok(t);
                }
                Err(e) if is_retryable(&e) => {
                    if start.elapsed() > timeout {
                        return Err(TransportError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                    debug!(error = %e, "Device not ready yet");
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn from_device_info(info: DeviceInfo) -> Result<Self, TransportError> {
        let vid = info.vendor_id();
        let pid = info.product_id();

        let hid_interfaces: Vec<u8> = info
            .interfaces()
            .filter(|iface| iface.class() == USB_CLASS_HID)
            .map(|iface| iface.interface_number())
            .collect();

        if hid_interfaces.is_empty() {
            return Err(TransportError::NoHidInterface { vid, pid });
        }

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            interfaces = ?hid_interfaces,
            "Found device"
        );

        Ok(Self {
            info,
            hid_interfaces,
            report_id: DEFAULT_REPORT_ID,
            interface_override: None,
            interface_number: None,
            interface: None,
            timeout: DEFAULT_REPORT_TIMEOUT,
        })
    }

    /// Feature report id used to pick the interface on `open`.
    pub fn with_report_id(mut self, report_id: u8) -> Self {
        self.report_id = report_id;
        self
    }

    /// Claim this interface instead of scanning report descriptors.
    pub fn with_interface(mut self, interface_number: u8) -> Self {
        self.interface_override = Some(interface_number);
        self
    }

    /// Override the per-report control transfer timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn interface(&self) -> Result<(&Interface, u8), TransportError> {
        match (&self.interface, self.interface_number) {
            (Some(iface), Some(number)) => Ok((iface, number)),
            _ => Err(TransportError::NotOpen),
        }
    }

    fn report_value(report_id: u8) -> u16 {
        (HID_REPORT_TYPE_FEATURE << 8) | report_id as u16
    }

    fn read_report_descriptor(&self, device: &Device, interface_number: u8) -> Option<Vec<u8>> {
        device
            .control_in(
                ControlIn {
                    control_type: ControlType::Standard,
                    recipient: Recipient::Interface,
                    request: USB_REQUEST_GET_DESCRIPTOR,
                    value: HID_DESCRIPTOR_TYPE_REPORT << 8,
                    index: interface_number as u16,
                    length: REPORT_DESCRIPTOR_MAX_LEN,
                },
                self.timeout,
            )
            .wait()
            .inspect_err(|e| {
                debug!(interface = interface_number, error = %e, "Report descriptor unavailable")
            })
            .ok()
    }

    /// Pick the interface to claim.
    fn select_interface(&self, device: &Device) -> Result<u8, TransportError> {
        if let Some(number) = self.interface_override {
            if !self.hid_interfaces.contains(&number) {
                return Err(TransportError::ClaimInterfaceFailed {
                    interface: number,
                    message: "not a HID interface".into(),
                });
            }
            info!(interface = number, "Using requested interface");
            return Ok(number);
        }

        let descriptors = self
            .hid_interfaces
            .iter()
            .map(|&n| (n, self.read_report_descriptor(device, n)));
        let first = self.hid_interfaces.first().copied();

        choose_interface(descriptors, self.report_id)
            .or(first)
            .ok_or(TransportError::NoHidInterface {
                vid: self.info.vendor_id(),
                pid: self.info.product_id(),
            })
    }
}

/// Errors that can clear up while a device is re-enumerating.
fn is_retryable(err: &TransportError) -> bool {
    matches!(
        err,
        TransportError::DeviceNotFound { .. }
            | TransportError::NoHidInterface { .. }
            | TransportError::OpenFailed(_)
    )
}

/// First interface whose report descriptor declares Feature `report_id`.
/// Falls back to the first interface, with a warning, when none does.
fn choose_interface<I>(descriptors: I, report_id: u8) -> Option<u8>
where
    I: IntoIterator<Item = (u8, Option<Vec<u8>>)>,
{
    let mut first = None;
    for (number, descriptor) in descriptors {
        first.get_or_insert(number);
        if descriptor.is_some_and(|d| declares_feature_report(&d, report_id)) {
            info!(interface = number, report_id, "Interface declares feature report");
            return Some(number);
        }
    }

    if let Some(number) = first {
        warn!(
            interface = number,
            report_id, "No interface declares the feature report, using the first HID interface"
        );
    }
    first
}

impl ReportTransport for NusbTransport {
    #[instrument(skip(self))]
    fn open(&mut self) -> Result<(), TransportError> {
        if self.interface.is_some() {
            return Ok(());
        }

        let device = self
            .info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let number = self.select_interface(&device)?;

        let interface = device
            .detach_and_claim_interface(number)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: number,
                message: e.to_string(),
            })?;

        info!(interface = number, "Device opened successfully");
        self.interface = Some(interface);
        self.interface_number = Some(number);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the interface releases it.
        if self.interface.take().is_some() {
            debug!("Interface released");
        }
        self.interface_number = None;
        Ok(())
    }

    #[instrument(skip(self, data))]
    fn send_report(&self, report_id: u8, data: &[u8; FRAME_SIZE]) -> Result<(), TransportError> {
        let (interface, number) = self.interface()?;

        // With report ids in use, the id leads the data stage.
        let mut buf = Vec::with_capacity(1 + FRAME_SIZE);
        buf.push(report_id);
        buf.extend_from_slice(data);

        interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: HID_SET_REPORT,
                    value: Self::report_value(report_id),
                    index: number as u16,
                    data: &buf,
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| TransportError::SendFailed {
                report_id,
                message: e.to_string(),
            })?;

        debug!(bytes_written = buf.len(), "Send complete");
        Ok(())
    }

    #[instrument(skip(self))]
    fn receive_report(&self, report_id: u8) -> Result<Vec<u8>, TransportError> {
        let (interface, number) = self.interface()?;

        let mut data = interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: HID_GET_REPORT,
                    value: Self::report_value(report_id),
                    index: number as u16,
                    length: (1 + FRAME_SIZE) as u16,
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| TransportError::ReceiveFailed {
                report_id,
                message: e.to_string(),
            })?;

        // Strip the leading report id so callers see frame bytes only.
        if data.first() == Some(&report_id) {
            data.remove(0);
        }

        debug!(bytes_read = data.len(), "Receive complete");
        Ok(data)
    }

    fn is_connected(&self) -> bool {
        // nusb doesn't provide a direct "is connected" check; an open
        // interface is the best signal available without I/O.
        self.interface.is_some()
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: self.info.vendor_id(),
            product_id: self.info.product_id(),
            product_name: self.info.product_string().map(str::to_owned),
        }
    }
}
