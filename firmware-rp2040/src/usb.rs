//! USB device plumbing: the composite HID interface the host sees, the
//! vendor monitor interface, and the channel-backed [`Transport`] the
//! core polls.
//!
//! All USB I/O happens in dedicated tasks; the main loop talks to them
//! exclusively through bounded channels, so [`ChannelTransport`] is
//! non-blocking by construction. Feature reports on the monitor
//! interface carry config commands; its output reports inject downstream
//! input reports (the wireless downstream link of the original hardware
//! is stubbed, so injection is the one downstream path this board
//! build has).

use defmt::warn;
use embassy_rp::peripherals::USB;
use embassy_rp::usb::Driver;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_usb::class::hid::{
    Config as HidConfig, HidReaderWriter, HidWriter, ReportId, RequestHandler, State,
};
use embassy_usb::control::OutResponse;
use embassy_usb::Builder;

use remapper_core::Transport;

/// The composite descriptor this device advertises: a keyboard on report
/// id 1 (8 modifier bits, 6-slot key array) and a mouse on report id 2
/// (3 buttons, relative X/Y).
pub const REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x06, // Usage (Keyboard)
    0xA1, 0x01, // Collection (Application)
    0x85, 0x01, //   Report ID (1)
    //
    // --- Modifier bits ---
    0x05, 0x07, //   Usage Page (Keyboard)
    0x19, 0xE0, //   Usage Minimum (LeftControl)
    0x29, 0xE7, //   Usage Maximum (Right GUI)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x01, //   Logical Maximum (1)
    0x75, 0x01, //   Report Size (1)
    0x95, 0x08, //   Report Count (8)
    0x81, 0x02, //   Input (Data, Variable, Absolute)
    //
    // --- Reserved byte ---
    0x75, 0x08, //   Report Size (8)
    0x95, 0x01, //   Report Count (1)
    0x81, 0x01, //   Input (Constant)
    //
    // --- Key array ---
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x65, //   Logical Maximum (101)
    0x05, 0x07, //   Usage Page (Keyboard)
    0x19, 0x00, //   Usage Minimum (0)
    0x29, 0x65, //   Usage Maximum (101)
    0x75, 0x08, //   Report Size (8)
    0x95, 0x06, //   Report Count (6)
    0x81, 0x00, //   Input (Data, Array)
    0xC0, // End Collection
    //
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x02, // Usage (Mouse)
    0xA1, 0x01, // Collection (Application)
    0x85, 0x02, //   Report ID (2)
    0x09, 0x01, //   Usage (Pointer)
    0xA1, 0x00, //   Collection (Physical)
    //
    // --- Buttons ---
    0x05, 0x09, //     Usage Page (Button)
    0x19, 0x01, //     Usage Minimum (1)
    0x29, 0x03, //     Usage Maximum (3)
    0x15, 0x00, //     Logical Minimum (0)
    0x25, 0x01, //     Logical Maximum (1)
    0x75, 0x01, //     Report Size (1)
    0x95, 0x03, //     Report Count (3)
    0x81, 0x02, //     Input (Data, Variable, Absolute)
    0x75, 0x05, //     Report Size (5)
    0x95, 0x01, //     Report Count (1)
    0x81, 0x01, //     Input (Constant)
    //
    // --- Relative X/Y ---
    0x05, 0x01, //     Usage Page (Generic Desktop)
    0x09, 0x30, //     Usage (X)
    0x09, 0x31, //     Usage (Y)
    0x15, 0x81, //     Logical Minimum (-127)
    0x25, 0x7F, //     Logical Maximum (127)
    0x75, 0x08, //     Report Size (8)
    0x95, 0x02, //     Report Count (2)
    0x81, 0x06, //     Input (Data, Variable, Relative)
    0xC0, //   End Collection
    0xC0, // End Collection
];

/// Monitor interface: a 63-byte vendor input report (raw input-state
/// dump), a 63-byte output report (downstream report injection), and a
/// 32-byte feature report (config commands).
pub const MONITOR_DESCRIPTOR: &[u8] = &[
    0x06, 0x60, 0xFF, // Usage Page (Vendor 0xFF60)
    0x09, 0x61, // Usage
    0xA1, 0x01, // Collection (Application)
    0x15, 0x00, //   Logical Minimum (0)
    0x26, 0xFF, 0x00, //   Logical Maximum (255)
    0x75, 0x08, //   Report Size (8)
    //
    0x09, 0x62, //   Usage (monitor dump)
    0x95, 0x3F, //   Report Count (63)
    0x81, 0x02, //   Input
    //
    0x09, 0x63, //   Usage (report injection)
    0x95, 0x3F, //   Report Count (63)
    0x91, 0x02, //   Output
    //
    0x09, 0x64, //   Usage (config command)
    0x95, 0x20, //   Report Count (32)
    0xB1, 0x02, //   Feature
    0xC0, // End Collection
];

/// Largest frame moved over the channels (one report id byte + payload).
pub const MAX_FRAME: usize = 64;

/// Config command frames are an opcode plus at most one rule record.
pub const MAX_COMMAND: usize = 32;

/// One report's bytes in flight between the main loop and a USB task.
#[derive(Clone, Copy)]
pub struct ReportFrame {
    pub len: u8,
    pub bytes: [u8; MAX_FRAME],
}

impl ReportFrame {
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        let mut frame = Self {
            len: 0,
            bytes: [0; MAX_FRAME],
        };
        let len = data.len().min(MAX_FRAME);
        frame.bytes[..len].copy_from_slice(&data[..len]);
        frame.len = len as u8;
        frame
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// A host config command frame.
#[derive(Clone, Copy)]
pub struct CommandFrame {
    pub len: u8,
    pub bytes: [u8; MAX_COMMAND],
}

impl CommandFrame {
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        let mut frame = Self {
            len: 0,
            bytes: [0; MAX_COMMAND],
        };
        let len = data.len().min(MAX_COMMAND);
        frame.bytes[..len].copy_from_slice(&data[..len]);
        frame.len = len as u8;
        frame
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// Assembled reports waiting for the main HID writer task.
pub static OUTGOING: Channel<CriticalSectionRawMutex, ReportFrame, 8> = Channel::new();
/// Monitor dumps waiting for the monitor writer task.
pub static MONITOR: Channel<CriticalSectionRawMutex, ReportFrame, 2> = Channel::new();
/// Injected downstream reports from the host, drained by the main loop.
pub static DOWNSTREAM: Channel<CriticalSectionRawMutex, ReportFrame, 4> = Channel::new();
/// Config command frames, drained by the main loop.
pub static COMMANDS: Channel<CriticalSectionRawMutex, CommandFrame, 4> = Channel::new();

/// The core's transport, backed entirely by `try_send`/`try_receive` on
/// the static channels so a poll can never block the main loop.
pub struct ChannelTransport;

impl Transport for ChannelTransport {
    fn read_report(&mut self, buf: &mut [u8]) -> Option<usize> {
        let frame = DOWNSTREAM.try_receive().ok()?;
        let data = frame.as_slice();
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Some(len)
    }

    fn send_report(&mut self, report_id: u8, payload: &[u8]) -> bool {
        let mut frame = ReportFrame {
            len: 0,
            bytes: [0; MAX_FRAME],
        };
        let len = payload.len().min(MAX_FRAME - 1);
        frame.bytes[0] = report_id;
        frame.bytes[1..1 + len].copy_from_slice(&payload[..len]);
        frame.len = (1 + len) as u8;
        OUTGOING.try_send(frame).is_ok()
    }

    fn send_monitor_report(&mut self, payload: &[u8]) -> bool {
        MONITOR.try_send(ReportFrame::from_slice(payload)).is_ok()
    }
}

/// Request handler on the monitor interface: feature reports are config
/// commands, output reports are injected downstream reports.
pub struct MonitorRequestHandler;

impl RequestHandler for MonitorRequestHandler {
    fn get_report(&mut self, _id: ReportId, _buf: &mut [u8]) -> Option<usize> {
        None
    }

    fn set_report(&mut self, id: ReportId, data: &[u8]) -> OutResponse {
        match id {
            ReportId::Feature(_) => {
                if COMMANDS.try_send(CommandFrame::from_slice(data)).is_err() {
                    warn!("command queue full, dropping frame");
                }
            }
            ReportId::Out(_) => {
                if DOWNSTREAM.try_send(ReportFrame::from_slice(data)).is_err() {
                    warn!("injection queue full, dropping report");
                }
            }
            ReportId::In(_) => {}
        }
        OutResponse::Accepted
    }

    fn set_idle_ms(&mut self, _id: Option<ReportId>, _duration_ms: u32) {}

    fn get_idle_ms(&mut self, _id: Option<ReportId>) -> Option<u32> {
        None
    }
}

/// Register both HID interfaces on the USB builder.
///
/// `monitor_handler` must be the monitor interface's request handler:
/// feature reports only ever arrive as SET_REPORT control transfers, and
/// the class rejects those when no handler is configured, which would cut
/// off the whole command surface.
///
/// Returns the writer for the composite interface and the
/// reader/writer pair for the monitor interface.
#[allow(clippy::type_complexity)]
pub fn configure_usb<'d>(
    builder: &mut Builder<'d, Driver<'d, USB>>,
    main_state: &'d mut State<'d>,
    monitor_state: &'d mut State<'d>,
    monitor_handler: &'d mut MonitorRequestHandler,
) -> (
    HidWriter<'d, Driver<'d, USB>, 16>,
    HidReaderWriter<'d, Driver<'d, USB>, 64, 64>,
) {
    let main_config = HidConfig {
        report_descriptor: REPORT_DESCRIPTOR,
        request_handler: None,
        poll_ms: 1,
        max_packet_size: 16,
        hid_subclass: embassy_usb::class::hid::HidSubclass::No,
        hid_boot_protocol: embassy_usb::class::hid::HidBootProtocol::None,
    };
    let main_writer = HidWriter::new(builder, main_state, main_config);

    let monitor_config = HidConfig {
        report_descriptor: MONITOR_DESCRIPTOR,
        request_handler: Some(monitor_handler),
        poll_ms: 8,
        max_packet_size: 64,
        hid_subclass: embassy_usb::class::hid::HidSubclass::No,
        hid_boot_protocol: embassy_usb::class::hid::HidBootProtocol::None,
    };
    let monitor = HidReaderWriter::new(builder, monitor_state, monitor_config);

    (main_writer, monitor)
}
