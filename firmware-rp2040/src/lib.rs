//! USB HID input remapper firmware for RP2040.
//!
//! This crate wires the platform-agnostic remapper core to the board: an
//! embassy-usb composite HID device (keyboard + mouse, plus a vendor
//! monitor interface), a GPIO button bank, the flash-backed config
//! region, and the 1 ms tick that rate-locks the mapping engine.

#![no_std]

// Re-export core types for convenience
pub use remapper_core::{
    Config, ConfigError, MappingRule, PendingWork, Remapper, RuleKind, Stats, TickFlag, Transport,
    GPIO_FIRST_PIN, GPIO_LAST_PIN, PERSISTED_CONFIG_SIZE,
};

pub mod buttons;
pub mod flash;
pub mod usb;

pub use buttons::ButtonBank;
pub use flash::ConfigFlash;
pub use usb::{configure_usb, ChannelTransport, MonitorRequestHandler, REPORT_DESCRIPTOR};
