//! Input state store: every physical input, HID-decoded or GPIO, keyed by
//! its usage.
//!
//! The store is the single namespace the mapping engine reads from. HID
//! fields land here through [`InputState::decode_report`], GPIO pins
//! through [`InputState::set`] with a [`Usage`] on the synthetic GPIO
//! page. Each entry keeps its current value and the timestamp of its last
//! change; any change also raises the event-pending flag the main loop
//! drains to trigger a mapping pass.

use heapless::{FnvIndexMap, Vec};
use hid_proto::{codec, ReportDescriptor, ReportKind, Usage};

/// Capacity of the store (must be a power of two for `FnvIndexMap`).
pub const MAX_ENTRIES: usize = 64;

/// Changed usages remembered between monitor report drains.
pub const MAX_PENDING_CHANGES: usize = 8;

const MAX_ARRAY_SELECTED: usize = 16;

/// One tracked input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Entry {
    /// Current logical value (GPIO entries are 0/1).
    pub value: i32,
    /// Timestamp of the last value change, microseconds.
    pub last_change_us: u64,
}

/// Usage-keyed value store with change tracking.
#[derive(Debug, Default)]
pub struct InputState {
    entries: FnvIndexMap<Usage, Entry, MAX_ENTRIES>,
    event_pending: bool,
    /// Usages changed since the last monitor drain, deduplicated. Once
    /// full, further changes are not recorded until the next drain (the
    /// monitor is best-effort).
    changed: Vec<Usage, MAX_PENDING_CHANGES>,
}

impl InputState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert one usage. Returns true when the stored value actually
    /// changed (first sight of a usage counts as a change).
    pub fn set(&mut self, usage: Usage, value: i32, now_us: u64) -> bool {
        match self.entries.get_mut(&usage) {
            Some(entry) => {
                if entry.value == value {
                    return false;
                }
                entry.value = value;
                entry.last_change_us = now_us;
            }
            None => {
                if self
                    .entries
                    .insert(
                        usage,
                        Entry {
                            value,
                            last_change_us: now_us,
                        },
                    )
                    .is_err()
                {
                    // Full store: degrade by ignoring new usages.
                    #[cfg(feature = "defmt")]
                    defmt::warn!("input state full, dropping usage {=u32:#x}", usage.raw());
                    return false;
                }
            }
        }
        self.event_pending = true;
        if !self.changed.contains(&usage) {
            let _ = self.changed.push(usage);
        }
        true
    }

    /// Current value of a usage, if it has ever been seen.
    #[inline]
    #[must_use]
    pub fn get(&self, usage: Usage) -> Option<i32> {
        self.entries.get(&usage).map(|e| e.value)
    }

    #[inline]
    #[must_use]
    pub fn entry(&self, usage: Usage) -> Option<&Entry> {
        self.entries.get(&usage)
    }

    /// Clear-and-test of the event-pending flag.
    pub fn take_event(&mut self) -> bool {
        core::mem::take(&mut self.event_pending)
    }

    #[inline]
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    /// Changed usages accumulated for the monitor report.
    #[inline]
    #[must_use]
    pub fn changes(&self) -> &[Usage] {
        &self.changed
    }

    /// Forget accumulated changes once a monitor report went out.
    pub fn clear_changes(&mut self) {
        self.changed.clear();
    }

    /// Drop every HID-sourced entry, keeping GPIO state. Called when the
    /// downstream device is replaced so stale usages cannot linger.
    pub fn clear_hid(&mut self) {
        let stale: Vec<Usage, MAX_ENTRIES> = self
            .entries
            .keys()
            .filter(|u| !u.is_gpio())
            .copied()
            .collect();
        for usage in stale {
            self.entries.remove(&usage);
        }
        self.changed.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Usage, &Entry)> {
        self.entries.iter()
    }

    /// Decode one downstream input report against its parsed descriptor
    /// and upsert every carried usage.
    ///
    /// The report id prefix byte is consumed here when the descriptor
    /// declares report ids. Reports for unknown ids, or shorter than their
    /// declared layout, are ignored wholesale; a device that lies about
    /// its own layout gets no partial decode.
    pub fn decode_report(&mut self, bytes: &[u8], desc: &ReportDescriptor, now_us: u64) {
        let (report_id, payload) = if desc.uses_report_ids {
            match bytes.split_first() {
                Some((&id, rest)) => (id, rest),
                None => return,
            }
        } else {
            (0, bytes)
        };
        let expected = desc.report_len(report_id, ReportKind::Input);
        if expected == 0 || payload.len() < expected {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "report id {=u8}: got {=usize} bytes, layout wants {=usize}",
                report_id,
                payload.len(),
                expected
            );
            return;
        }

        // Two passes keep the borrow on `desc` away from `self`.
        let mut sets: Vec<(Usage, i32), MAX_ENTRIES> = Vec::new();
        let mut clears: Vec<Usage, MAX_ENTRIES> = Vec::new();
        for field in desc.report_fields(report_id, ReportKind::Input) {
            if field.flags.is_constant() {
                continue;
            }
            if field.flags.is_array() {
                self.collect_array(field, payload, &mut sets, &mut clears);
            } else {
                collect_variable(field, payload, &mut sets);
            }
        }
        for usage in clears {
            self.set(usage, 0, now_us);
        }
        for (usage, value) in sets {
            self.set(usage, value, now_us);
        }
    }

    /// Array fields carry indices of the currently active usages; every
    /// usage of the field's set that is tracked but no longer selected
    /// must drop back to 0.
    fn collect_array(
        &self,
        field: &hid_proto::Field,
        payload: &[u8],
        sets: &mut Vec<(Usage, i32), MAX_ENTRIES>,
        clears: &mut Vec<Usage, MAX_ENTRIES>,
    ) {
        let mut selected: Vec<Usage, MAX_ARRAY_SELECTED> = Vec::new();
        for slot in 0..field.slots as usize {
            let Ok(value) = codec::extract(
                payload,
                field.slot_offset(slot),
                field.bit_width,
                field.is_signed(),
            ) else {
                continue;
            };
            if value < field.logical_min || value > field.logical_max {
                // Out-of-range array values (e.g. rollover codes) select
                // nothing.
                continue;
            }
            let index = (value - field.logical_min) as usize;
            if let Some(usage) = field.usages.at(index) {
                let _ = selected.push(usage);
            }
        }
        for (usage, entry) in self.entries.iter() {
            if entry.value != 0 && field.usages.contains(*usage) && !selected.contains(usage) {
                let _ = clears.push(*usage);
            }
        }
        for usage in selected {
            let _ = sets.push((usage, 1));
        }
    }
}

fn collect_variable(
    field: &hid_proto::Field,
    payload: &[u8],
    sets: &mut Vec<(Usage, i32), MAX_ENTRIES>,
) {
    for slot in 0..field.slots as usize {
        let Some(usage) = field.usages.at(slot) else {
            continue;
        };
        let Ok(value) = codec::extract(
            payload,
            field.slot_offset(slot),
            field.bit_width,
            field.is_signed(),
        ) else {
            continue;
        };
        let _ = sets.push((usage, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hid_proto::usage::pages;

    const MOUSE: &[u8] = &[
        0x05, 0x01, 0x09, 0x02, 0xA1, 0x01, // mouse collection
        0x05, 0x09, 0x19, 0x01, 0x29, 0x03, // buttons 1..3
        0x15, 0x00, 0x25, 0x01, 0x95, 0x03, 0x75, 0x01, 0x81, 0x02, //
        0x95, 0x01, 0x75, 0x05, 0x81, 0x01, // pad
        0x05, 0x01, 0x09, 0x30, 0x09, 0x31, // X, Y
        0x15, 0x81, 0x25, 0x7F, 0x75, 0x08, 0x95, 0x02, 0x81, 0x06, //
        0xC0,
    ];

    const KEY_ARRAY: &[u8] = &[
        0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, // keyboard collection
        0x05, 0x07, 0x19, 0x00, 0x29, 0x65, // usages 0..101
        0x15, 0x00, 0x25, 0x65, 0x75, 0x08, 0x95, 0x03, 0x81, 0x00, // 3-slot array
        0xC0,
    ];

    #[test]
    fn set_tracks_changes_and_events() {
        let mut state = InputState::new();
        let usage = Usage::new(pages::BUTTON, 1);

        assert!(state.set(usage, 1, 10));
        assert!(state.take_event());
        assert!(!state.take_event());

        // Same value again: no event.
        assert!(!state.set(usage, 1, 20));
        assert!(!state.take_event());
        assert_eq!(state.entry(usage).map(|e| e.last_change_us), Some(10));

        assert!(state.set(usage, 0, 30));
        assert_eq!(state.entry(usage).map(|e| e.last_change_us), Some(30));
    }

    #[test]
    fn decode_mouse_report() {
        let desc = ReportDescriptor::parse(MOUSE).unwrap();
        let mut state = InputState::new();
        // Button 1 + button 3, x = -2, y = 127.
        state.decode_report(&[0b101, 0xFE_u8, 0x7F], &desc, 0);

        assert_eq!(state.get(Usage::new(pages::BUTTON, 1)), Some(1));
        assert_eq!(state.get(Usage::new(pages::BUTTON, 2)), Some(0));
        assert_eq!(state.get(Usage::new(pages::BUTTON, 3)), Some(1));
        assert_eq!(state.get(Usage::new(pages::GENERIC_DESKTOP, 0x30)), Some(-2));
        assert_eq!(state.get(Usage::new(pages::GENERIC_DESKTOP, 0x31)), Some(127));
    }

    #[test]
    fn array_selection_and_release() {
        let desc = ReportDescriptor::parse(KEY_ARRAY).unwrap();
        let mut state = InputState::new();

        state.decode_report(&[0x04, 0x05, 0x00], &desc, 0);
        assert_eq!(state.get(Usage::new(pages::KEYBOARD, 4)), Some(1));
        assert_eq!(state.get(Usage::new(pages::KEYBOARD, 5)), Some(1));

        // 0x05 released, 0x06 pressed.
        state.decode_report(&[0x04, 0x06, 0x00], &desc, 1);
        assert_eq!(state.get(Usage::new(pages::KEYBOARD, 4)), Some(1));
        assert_eq!(state.get(Usage::new(pages::KEYBOARD, 5)), Some(0));
        assert_eq!(state.get(Usage::new(pages::KEYBOARD, 6)), Some(1));
    }

    #[test]
    fn short_report_is_ignored() {
        let desc = ReportDescriptor::parse(MOUSE).unwrap();
        let mut state = InputState::new();
        state.decode_report(&[0b1], &desc, 0);
        assert_eq!(state.get(Usage::new(pages::BUTTON, 1)), None);
        assert!(!state.take_event());
    }

    #[test]
    fn clear_hid_keeps_gpio() {
        let mut state = InputState::new();
        state.set(Usage::new(pages::BUTTON, 1), 1, 0);
        state.set(Usage::gpio(3), 1, 0);

        state.clear_hid();
        assert_eq!(state.get(Usage::new(pages::BUTTON, 1)), None);
        assert_eq!(state.get(Usage::gpio(3)), Some(1));
    }

    #[test]
    fn change_queue_dedups() {
        let mut state = InputState::new();
        let usage = Usage::gpio(2);
        state.set(usage, 1, 0);
        state.set(usage, 0, 1);
        assert_eq!(state.changes(), &[usage]);
        state.clear_changes();
        assert!(!state.has_changes());
    }
}
