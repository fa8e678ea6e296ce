//! Report assembly: output slot values into the byte layout of the
//! descriptor we advertise.
//!
//! Pure functions of the slot table (and, for the monitor report, the
//! input store): no state is kept here, so assembling twice without a
//! slot change yields identical bytes.

use hid_proto::{codec, Field, ReportDescriptor, ReportKind, MAX_REPORT_BYTES};

use crate::mapping::OutputSlots;
use crate::state::InputState;

/// Bytes of one monitor entry: packed usage (4) + value (4).
const MONITOR_ENTRY_LEN: usize = 8;

/// Pack the current slot values into the report with the given id.
///
/// The buffer is zeroed for the report's length first, so constant and
/// padding bits stay zero and slots never seen keep their resting value.
/// Returns the payload length in bytes (0 when the id declares no input
/// fields; the report id prefix byte, when used, is the transport's
/// concern).
#[must_use]
pub fn assemble(
    own: &ReportDescriptor,
    report_id: u8,
    slots: &OutputSlots,
    buf: &mut [u8; MAX_REPORT_BYTES],
) -> usize {
    let len = own.report_len(report_id, ReportKind::Input);
    if len == 0 {
        return 0;
    }
    buf[..len].fill(0);
    for field in own.report_fields(report_id, ReportKind::Input) {
        if field.flags.is_constant() {
            continue;
        }
        if field.flags.is_array() {
            fill_array(field, slots, buf);
        } else {
            fill_variable(field, slots, buf);
        }
    }
    len
}

fn fill_variable(field: &Field, slots: &OutputSlots, buf: &mut [u8]) {
    for slot in 0..field.slots as usize {
        let Some(usage) = field.usages.at(slot) else {
            continue;
        };
        let Some(value) = slots.get(usage) else {
            continue;
        };
        let clamped = value.clamp(field.logical_min, field.logical_max);
        // Offsets come from the same descriptor that sized the buffer, so
        // this cannot fail; a codec error would only mean a zero bit.
        let _ = codec::insert(buf, field.slot_offset(slot), field.bit_width, clamped);
    }
}

/// Array fields (e.g. the 6-slot keyboard key array) list the indices of
/// active usages. Active slots are packed first-come; overflow beyond the
/// field's slot count is dropped.
fn fill_array(field: &Field, slots: &OutputSlots, buf: &mut [u8]) {
    let mut next = 0usize;
    for (usage, value) in slots.iter() {
        if value == 0 || !field.usages.contains(usage) {
            continue;
        }
        if next >= field.slots as usize {
            break;
        }
        let Some(index) = field.usages.index_of(usage) else {
            continue;
        };
        let encoded = field.logical_min.saturating_add(index as i32);
        let _ = codec::insert(buf, field.slot_offset(next), field.bit_width, encoded);
        next += 1;
    }
}

/// Build the monitor report: a raw dump of recently changed input state,
/// bypassing the mapping rules entirely.
///
/// Layout: `[count u8]` then `count` entries of
/// `[usage raw u32 LE][value i32 LE]`. Entries that no longer exist in
/// the store (cleared by a device swap) are skipped.
#[must_use]
pub fn assemble_monitor(inputs: &InputState, buf: &mut [u8; MAX_REPORT_BYTES]) -> usize {
    let max_entries = (buf.len() - 1) / MONITOR_ENTRY_LEN;
    buf.fill(0);
    let mut count = 0usize;
    for &usage in inputs.changes() {
        if count >= max_entries {
            break;
        }
        let Some(entry) = inputs.entry(usage) else {
            continue;
        };
        let at = 1 + count * MONITOR_ENTRY_LEN;
        buf[at..at + 4].copy_from_slice(&usage.raw().to_le_bytes());
        buf[at + 4..at + 8].copy_from_slice(&entry.value.to_le_bytes());
        count += 1;
    }
    buf[0] = count as u8;
    1 + count * MONITOR_ENTRY_LEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use hid_proto::usage::pages;
    use hid_proto::Usage;

    /// Keyboard report id 1 (modifiers + 6-key array), mouse report id 2
    /// (3 buttons + relative X/Y).
    const OWN: &[u8] = &[
        0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, // keyboard collection
        0x85, 0x01, // Report ID 1
        0x05, 0x07, 0x19, 0xE0, 0x29, 0xE7, // modifiers
        0x15, 0x00, 0x25, 0x01, 0x75, 0x01, 0x95, 0x08, 0x81, 0x02, //
        0x75, 0x08, 0x95, 0x01, 0x81, 0x01, // reserved byte
        0x15, 0x00, 0x25, 0x65, 0x05, 0x07, // key array 0..101
        0x19, 0x00, 0x29, 0x65, 0x75, 0x08, 0x95, 0x06, 0x81, 0x00, //
        0xC0, //
        0x05, 0x01, 0x09, 0x02, 0xA1, 0x01, // mouse collection
        0x85, 0x02, // Report ID 2
        0x05, 0x09, 0x19, 0x01, 0x29, 0x03, //
        0x15, 0x00, 0x25, 0x01, 0x75, 0x01, 0x95, 0x03, 0x81, 0x02, //
        0x75, 0x05, 0x95, 0x01, 0x81, 0x01, //
        0x05, 0x01, 0x09, 0x30, 0x09, 0x31, //
        0x15, 0x81, 0x25, 0x7F, 0x75, 0x08, 0x95, 0x02, 0x81, 0x06, //
        0xC0,
    ];

    fn own() -> ReportDescriptor {
        ReportDescriptor::parse(OWN).unwrap()
    }

    #[test]
    fn keyboard_report_packs_modifiers_and_keys() {
        let own = own();
        let mut slots = OutputSlots::new();
        slots.set(Usage::new(pages::KEYBOARD, 0xE1), 1); // left shift
        slots.set(Usage::new(pages::KEYBOARD, 0x04), 1); // 'a'
        slots.set(Usage::new(pages::KEYBOARD, 0x05), 0); // 'b' released

        let mut buf = [0u8; MAX_REPORT_BYTES];
        let len = assemble(&own, 1, &slots, &mut buf);
        assert_eq!(len, 8);
        assert_eq!(buf[0], 0b10); // shift bit
        assert_eq!(buf[1], 0); // reserved
        assert_eq!(&buf[2..8], &[0x04, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn mouse_report_clamps_to_logical_range() {
        let own = own();
        let mut slots = OutputSlots::new();
        slots.set(Usage::new(pages::BUTTON, 1), 1);
        slots.set(Usage::new(pages::GENERIC_DESKTOP, 0x30), 300);
        slots.set(Usage::new(pages::GENERIC_DESKTOP, 0x31), -5);

        let mut buf = [0u8; MAX_REPORT_BYTES];
        let len = assemble(&own, 2, &slots, &mut buf);
        assert_eq!(len, 3);
        assert_eq!(buf[0], 0b1);
        assert_eq!(buf[1] as i8, 127); // clamped
        assert_eq!(buf[2] as i8, -5);
    }

    #[test]
    fn assembling_twice_is_identical() {
        let own = own();
        let mut slots = OutputSlots::new();
        slots.set(Usage::new(pages::KEYBOARD, 0x10), 1);

        let mut a = [0u8; MAX_REPORT_BYTES];
        let mut b = [0xAAu8; MAX_REPORT_BYTES];
        let la = assemble(&own, 1, &slots, &mut a);
        let lb = assemble(&own, 1, &slots, &mut b);
        assert_eq!(la, lb);
        assert_eq!(a[..la], b[..lb]);
    }

    #[test]
    fn unknown_report_id_is_empty() {
        let own = own();
        let slots = OutputSlots::new();
        let mut buf = [0u8; MAX_REPORT_BYTES];
        assert_eq!(assemble(&own, 9, &slots, &mut buf), 0);
    }

    #[test]
    fn monitor_dumps_changed_entries() {
        let mut inputs = InputState::new();
        inputs.set(Usage::gpio(3), 1, 5);
        inputs.set(Usage::new(pages::BUTTON, 1), -7, 6);

        let mut buf = [0u8; MAX_REPORT_BYTES];
        let len = assemble_monitor(&inputs, &mut buf);
        assert_eq!(len, 1 + 2 * 8);
        assert_eq!(buf[0], 2);
        assert_eq!(&buf[1..5], &0xFFF4_0003u32.to_le_bytes());
        assert_eq!(&buf[5..9], &1i32.to_le_bytes());
        assert_eq!(&buf[9..13], &0x0009_0001u32.to_le_bytes());
        assert_eq!(&buf[13..17], &(-7i32).to_le_bytes());
    }
}
