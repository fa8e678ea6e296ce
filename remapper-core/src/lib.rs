//! Platform-agnostic core of the HID input remapper.
//!
//! Everything between "bytes arrived from the downstream device / a GPIO
//! level changed" and "these report bytes go to the host" lives here,
//! with the USB stack, GPIO registers, flash, and timers abstracted
//! behind small traits and plain calls so the whole pipeline runs in
//! host tests.
//!
//! # Modules
//!
//! - [`state`]: usage-keyed input store with change/event tracking
//! - [`mapping`]: ordered mapping rules and the event/tick dual-trigger engine
//! - [`assemble`]: slot values into outgoing report bytes, plus the monitor dump
//! - [`config`]: rule-set model, flash image codec, host command surface
//! - [`remapper`]: the driver gluing the above to a [`Transport`]
//!
//! # Example
//!
//! ```
//! use remapper_core::{Config, MappingRule, Remapper, RuleKind};
//! use hid_proto::Usage;
//!
//! // Advertise one byte of buttons.
//! let own = [
//!     0x05, 0x09, 0x19, 0x01, 0x29, 0x08, 0x15, 0x00, 0x25, 0x01,
//!     0x75, 0x01, 0x95, 0x08, 0x81, 0x02,
//! ];
//! let mut config = Config::default();
//! config
//!     .rules
//!     .push(MappingRule {
//!         kind: RuleKind::GpioKey,
//!         source: Usage::gpio(2),
//!         target: Usage::new(0x09, 1),
//!     })
//!     .unwrap();
//! let mut remapper = Remapper::new(&own, config).unwrap();
//! remapper.handle_gpio(!(1 << 2), 0); // pin 2 low = pressed
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

pub mod assemble;
pub mod config;
pub mod mapping;
pub mod remapper;
pub mod state;

pub use assemble::{assemble, assemble_monitor};
pub use config::{
    CommandEffect, Config, ConfigError, CONFIG_VERSION, PERSISTED_CONFIG_SIZE, RULE_RECORD_LEN,
};
pub use mapping::{MappingEngine, MappingRule, OutputSlots, RuleKind, Stats, MAX_RULES};
pub use remapper::{PendingWork, Remapper, TickFlag, Transport, GPIO_FIRST_PIN, GPIO_LAST_PIN};
pub use state::{Entry, InputState};
