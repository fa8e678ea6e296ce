//! The remapper driver: one cooperative iteration at a time.
//!
//! [`Remapper`] owns both parsed descriptors, the input store, the
//! mapping engine, and the slot table, and wires them to a [`Transport`]
//! each [`Remapper::poll`] call. Nothing here blocks; a poll does a
//! bounded amount of work and returns, which is what lets the firmware
//! main loop also service GPIO, flash writes, and stats in between.
//!
//! Cross-context signaling is confined to [`TickFlag`]: the only thing an
//! interrupt-ish context (the tick task) may do is set it, and the main
//! loop drains it at most once per iteration.

use heapless::Vec;
use portable_atomic::{AtomicBool, Ordering};

use hid_proto::{
    ParseError, ReportDescriptor, ReportKind, Usage, MAX_REPORT_BYTES, MAX_REPORT_IDS,
};

use crate::assemble::{assemble, assemble_monitor};
use crate::config::{opcode, CommandEffect, Config, ConfigError};
use crate::mapping::{MappingEngine, OutputSlots, Stats};
use crate::state::InputState;

/// GPIO pins wired to buttons, inclusive.
pub const GPIO_FIRST_PIN: u8 = 2;
pub const GPIO_LAST_PIN: u8 = 9;

/// Largest downstream descriptor accepted over the command surface.
pub const MAX_DEVICE_DESCRIPTOR: usize = 512;

/// Flag bits of a descriptor-upload chunk frame:
/// `[opcode][flags][len][bytes...]`.
pub mod descriptor_chunk {
    /// First chunk; resets the staging buffer.
    pub const FIRST: u8 = 1 << 0;
    /// Last chunk; the staged bytes are parsed and attached.
    pub const LAST: u8 = 1 << 1;
}

/// Pending-tick flag shared between the tick source and the main loop.
///
/// The tick side only ever calls [`TickFlag::set`]; the main loop drains
/// with [`TickFlag::take`], a clear-and-test in one atomic swap so a tick
/// landing mid-drain is never lost, only deferred to the next iteration.
#[derive(Debug)]
pub struct TickFlag(AtomicBool);

impl TickFlag {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    #[inline]
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

impl Default for TickFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-blocking transport collaborator (USB plumbing lives behind this).
pub trait Transport {
    /// Poll for one new downstream input report. Returns the byte count
    /// copied into `buf`, or `None` when nothing is pending.
    fn read_report(&mut self, buf: &mut [u8]) -> Option<usize>;

    /// Hand one assembled report to the host side. Returns false when the
    /// endpoint is busy; the caller retries on a later poll.
    fn send_report(&mut self, report_id: u8, payload: &[u8]) -> bool;

    /// Best-effort monitor report. False when busy or disabled.
    fn send_monitor_report(&mut self, payload: &[u8]) -> bool;
}

/// Deferred work the main loop drains after each poll.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PendingWork {
    /// In-RAM config differs from flash.
    pub config_dirty: bool,
    /// Host asked for a flash flush.
    pub persist: bool,
    /// Host asked for bootloader re-entry.
    pub bootloader: bool,
}

/// Last payload sent per report id, for send suppression.
#[derive(Debug)]
struct CachedReport {
    report_id: u8,
    len: usize,
    bytes: [u8; MAX_REPORT_BYTES],
    valid: bool,
}

/// The core driver. Generic over nothing; the transport is passed per
/// poll so the firmware can keep it in a different task-local place.
#[derive(Debug)]
pub struct Remapper {
    own: ReportDescriptor,
    device: ReportDescriptor,
    inputs: InputState,
    engine: MappingEngine,
    slots: OutputSlots,
    cache: Vec<CachedReport, MAX_REPORT_IDS>,
    pending: PendingWork,
    gpio_last: Option<u32>,
    staged_descriptor: Vec<u8, MAX_DEVICE_DESCRIPTOR>,
}

impl Remapper {
    /// Build from the descriptor this device advertises and the config
    /// loaded from flash.
    pub fn new(own_descriptor: &[u8], config: Config) -> Result<Self, ParseError> {
        let own = ReportDescriptor::parse(own_descriptor)?;
        let mut cache = Vec::new();
        for report_id in own.report_ids(ReportKind::Input) {
            let _ = cache.push(CachedReport {
                report_id,
                len: 0,
                bytes: [0; MAX_REPORT_BYTES],
                valid: false,
            });
        }
        Ok(Self {
            own,
            device: ReportDescriptor::default(),
            inputs: InputState::new(),
            engine: MappingEngine::new(config),
            slots: OutputSlots::new(),
            cache,
            pending: PendingWork::default(),
            gpio_last: None,
            staged_descriptor: Vec::new(),
        })
    }

    /// Parse a newly attached downstream device's descriptor.
    ///
    /// On failure the previous device table is dropped anyway: a device
    /// we cannot parse contributes no mappings, but GPIO keeps working.
    pub fn attach_device(&mut self, descriptor: &[u8]) -> Result<(), ParseError> {
        self.inputs.clear_hid();
        match ReportDescriptor::parse(descriptor) {
            Ok(desc) => {
                self.device = desc;
                Ok(())
            }
            Err(e) => {
                self.device = ReportDescriptor::default();
                Err(e)
            }
        }
    }

    /// Drop the downstream device (detach).
    pub fn detach_device(&mut self) {
        self.device = ReportDescriptor::default();
        self.inputs.clear_hid();
    }

    /// Feed one raw downstream report (outside of poll, e.g. from tests).
    pub fn handle_report(&mut self, bytes: &[u8], now_us: u64) {
        self.inputs.decode_report(bytes, &self.device, now_us);
    }

    /// Sample the GPIO bank. `mask` is the raw pin-level bitmask; pins
    /// are pulled up, so a low level means pressed (inverted here, never
    /// downstream of the store).
    pub fn handle_gpio(&mut self, mask: u32, now_us: u64) {
        if self.gpio_last == Some(mask) {
            return;
        }
        self.gpio_last = Some(mask);
        for pin in GPIO_FIRST_PIN..=GPIO_LAST_PIN {
            let pressed = mask & (1 << pin) == 0;
            self.inputs.set(Usage::gpio(pin), i32::from(pressed), now_us);
        }
    }

    /// Apply one host config command (routed from the feature-report
    /// handler). Flash and reboot effects only raise pending flags.
    pub fn handle_command(&mut self, frame: &[u8]) -> Result<(), ConfigError> {
        // Descriptor upload mutates the driver, not the config.
        if frame.first() == Some(&opcode::SET_DESCRIPTOR) {
            return self.stage_descriptor_chunk(&frame[1..]);
        }
        let effect = self.engine.edit_config(|config| config.apply_command(frame))?;
        match effect {
            CommandEffect::Updated => self.pending.config_dirty = true,
            CommandEffect::Persist => self.pending.persist = true,
            CommandEffect::Bootloader => self.pending.bootloader = true,
        }
        Ok(())
    }

    /// One chunk of a downstream-descriptor upload. The descriptor rides
    /// in over several command frames (feature reports are small); the
    /// last chunk parses the staged bytes and attaches the device.
    fn stage_descriptor_chunk(&mut self, rest: &[u8]) -> Result<(), ConfigError> {
        let (&flags, rest) = rest.split_first().ok_or(ConfigError::ShortCommand)?;
        let (&len, rest) = rest.split_first().ok_or(ConfigError::ShortCommand)?;
        let chunk = rest.get(..len as usize).ok_or(ConfigError::ShortCommand)?;
        if flags & descriptor_chunk::FIRST != 0 {
            self.staged_descriptor.clear();
        }
        self.staged_descriptor
            .extend_from_slice(chunk)
            .map_err(|_| ConfigError::BadDescriptor)?;
        if flags & descriptor_chunk::LAST != 0 {
            let staged = core::mem::take(&mut self.staged_descriptor);
            self.attach_device(&staged)
                .map_err(|_| ConfigError::BadDescriptor)?;
        }
        Ok(())
    }

    /// One cooperative iteration.
    ///
    /// `tick_due` comes from [`TickFlag::take`], so it is true at most
    /// once per tick period. Reads at most one downstream report, runs a
    /// mapping pass when an event or tick warrants one, and pushes
    /// changed reports (plus the monitor report) to the transport.
    pub fn poll<T: Transport>(&mut self, tick_due: bool, now_us: u64, transport: &mut T) {
        let mut buf = [0u8; MAX_REPORT_BYTES];
        if let Some(n) = transport.read_report(&mut buf) {
            let n = n.min(buf.len());
            self.inputs.decode_report(&buf[..n], &self.device, now_us);
        }

        let event = self.inputs.take_event();
        if event || tick_due {
            self.engine
                .process(tick_due, &self.inputs, &self.device, &self.own, &mut self.slots);
            self.flush_reports(transport);
        }

        if self.engine.config().monitor_enabled && self.inputs.has_changes() {
            let len = assemble_monitor(&self.inputs, &mut buf);
            if transport.send_monitor_report(&buf[..len]) {
                self.inputs.clear_changes();
            }
        }
    }

    /// Assemble every advertised report and send the ones whose bytes
    /// changed since their last successful send. Relative slots are
    /// zeroed only after their report went out, so deltas accumulated
    /// across busy polls are carried, not lost.
    fn flush_reports<T: Transport>(&mut self, transport: &mut T) {
        let mut buf = [0u8; MAX_REPORT_BYTES];
        for cached in self.cache.iter_mut() {
            let len = assemble(&self.own, cached.report_id, &self.slots, &mut buf);
            if len == 0 {
                continue;
            }
            if cached.valid && cached.len == len && cached.bytes[..len] == buf[..len] {
                continue;
            }
            if transport.send_report(cached.report_id, &buf[..len]) {
                cached.bytes[..len].copy_from_slice(&buf[..len]);
                cached.len = len;
                cached.valid = true;
                // The cache keeps the bytes as sent; after a nonzero
                // delta the cleared slots assemble to a differing
                // all-zero report, which goes out once and then settles.
                self.slots.clear_relative(&self.own, cached.report_id);
            }
        }
    }

    /// Deferred-work flags, cleared on read.
    pub fn take_pending(&mut self) -> PendingWork {
        core::mem::take(&mut self.pending)
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        self.engine.config()
    }

    /// Serialize the current config into a flash image.
    pub fn serialize_config(&self, out: &mut [u8; crate::config::PERSISTED_CONFIG_SIZE]) {
        self.engine.config().serialize(out);
    }

    #[inline]
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.engine.stats()
    }

    #[inline]
    #[must_use]
    pub fn inputs(&self) -> &InputState {
        &self.inputs
    }
}
