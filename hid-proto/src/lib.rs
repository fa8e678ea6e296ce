//! HID report descriptor parsing and report bit-field codec.
//!
//! This crate decodes the self-describing binary report descriptor a HID
//! device presents, into a flat table of fields with known bit positions.
//! It is used twice by the remapper:
//!
//! - on the descriptor of the *downstream* device, to learn where each
//!   usage lives inside its input reports, and
//! - on the descriptor *we* advertise to the host, to learn where the
//!   assembler must place each outgoing value.
//!
//! The downstream device is untrusted: every access into the descriptor
//! byte stream is bounds-checked, all tables have fixed capacities, and a
//! structurally broken descriptor yields [`ParseError`] instead of a panic.
//!
//! # Modules
//!
//! - [`items`]: tokenizer for the HID item stream (short/long items)
//! - [`descriptor`]: the global/local state machine producing [`Field`] tables
//! - [`codec`]: bit-level extraction/insertion into report byte buffers
//! - [`usage`]: the `(usage page, usage id)` key type shared with the core
//!
//! # Example
//!
//! ```
//! use hid_proto::{ReportDescriptor, Usage};
//!
//! // One byte of buttons, report id 1.
//! let desc = [
//!     0x05, 0x09, // Usage Page (Button)
//!     0x85, 0x01, // Report ID (1)
//!     0x19, 0x01, // Usage Minimum (1)
//!     0x29, 0x08, // Usage Maximum (8)
//!     0x15, 0x00, // Logical Minimum (0)
//!     0x25, 0x01, // Logical Maximum (1)
//!     0x75, 0x01, // Report Size (1)
//!     0x95, 0x08, // Report Count (8)
//!     0x81, 0x02, // Input (Data, Variable, Absolute)
//! ];
//! let parsed = ReportDescriptor::parse(&desc).unwrap();
//! let field = parsed
//!     .input_field(1, Usage::new(0x09, 0x01))
//!     .expect("button 1 present");
//! assert_eq!(field.bit_offset(), 0);
//! assert_eq!(field.bit_width(), 1);
//! ```
//!
//! # Features
//!
//! - **`std`**: Enable standard library support (for host testing)
//! - **`defmt`**: Enable defmt formatting (for embedded logging)
//!
//! # No-std Support
//!
//! This crate is `#![no_std]` by default and uses no heap allocations.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

pub mod codec;
pub mod descriptor;
pub mod items;
pub mod usage;

pub use codec::{extract, insert, CodecError};
pub use descriptor::{
    Field, FieldFlags, FieldRef, ParseError, ReportDescriptor, ReportKind, Usages, MAX_FIELDS,
    MAX_REPORT_BYTES, MAX_REPORT_IDS,
};
pub use items::{Item, ItemClass, Items};
pub use usage::{Usage, GPIO_USAGE_PAGE};

/// Log an item tag the parser has no handling for and move on.
#[inline]
pub(crate) fn warn_unknown_tag(tag: u8) {
    #[cfg(feature = "defmt")]
    defmt::warn!("skipping unhandled descriptor item tag {=u8:#x}", tag);
    #[cfg(not(feature = "defmt"))]
    let _ = tag;
}
