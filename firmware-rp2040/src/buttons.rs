//! GPIO button bank: pins 2..=9, pulled up, active low.

use embassy_rp::gpio::Input;
use remapper_core::{GPIO_FIRST_PIN, GPIO_LAST_PIN};

/// Number of button pins.
pub const BUTTON_COUNT: usize = (GPIO_LAST_PIN - GPIO_FIRST_PIN + 1) as usize;

/// The wired buttons, sampled by level once per main-loop iteration.
/// Debouncing is left to the mapping layer's change detection plus the
/// pull-ups; the original hardware switches are clean enough at 1 kHz.
pub struct ButtonBank<'d> {
    pins: [Input<'d>; BUTTON_COUNT],
}

impl<'d> ButtonBank<'d> {
    /// `pins[i]` must be GPIO `GPIO_FIRST_PIN + i`, configured with
    /// pull-ups by the caller.
    pub fn new(pins: [Input<'d>; BUTTON_COUNT]) -> Self {
        Self { pins }
    }

    /// Raw level bitmask over the whole GPIO bank: bit N is pin N's
    /// level. Unwired bits read as high (released), matching the
    /// pulled-up idle state the core's active-low inversion expects.
    pub fn sample(&self) -> u32 {
        let mut mask = !0u32;
        for (i, pin) in self.pins.iter().enumerate() {
            if pin.is_low() {
                mask &= !(1 << (GPIO_FIRST_PIN as usize + i));
            }
        }
        mask
    }
}
