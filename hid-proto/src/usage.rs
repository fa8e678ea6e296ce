//! Usage keys: the HID namespace for "what does this field mean".

/// Reserved usage page for GPIO-sourced inputs.
///
/// GPIO pins are folded into the HID usage namespace so the mapping layer
/// addresses them exactly like decoded report fields: pin N becomes
/// `Usage::new(GPIO_USAGE_PAGE, N)`. The page sits in the vendor-defined
/// range so it can never collide with a real device's usages.
pub const GPIO_USAGE_PAGE: u16 = 0xFFF4;

/// A `(usage page, usage id)` pair identifying one logical signal.
///
/// This is the single addressing scheme shared by decoded downstream
/// fields, GPIO pins, and mapping-rule sources/targets. The packed `u32`
/// form (`page << 16 | id`) is used for storage and the wire encoding of
/// configs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Usage {
    pub page: u16,
    pub id: u16,
}

impl Usage {
    #[inline]
    #[must_use]
    pub const fn new(page: u16, id: u16) -> Self {
        Self { page, id }
    }

    /// Usage for a GPIO pin on the reserved synthetic page.
    #[inline]
    #[must_use]
    pub const fn gpio(pin: u8) -> Self {
        Self {
            page: GPIO_USAGE_PAGE,
            id: pin as u16,
        }
    }

    /// Unpack from the `page << 16 | id` form.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            page: (raw >> 16) as u16,
            id: raw as u16,
        }
    }

    /// Pack into the `page << 16 | id` form.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        (self.page as u32) << 16 | self.id as u32
    }

    #[inline]
    #[must_use]
    pub const fn is_gpio(self) -> bool {
        self.page == GPIO_USAGE_PAGE
    }
}

/// Common usage pages, named where the remapper cares about them.
pub mod pages {
    pub const GENERIC_DESKTOP: u16 = 0x01;
    pub const KEYBOARD: u16 = 0x07;
    pub const LED: u16 = 0x08;
    pub const BUTTON: u16 = 0x09;
    pub const CONSUMER: u16 = 0x0C;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_roundtrip() {
        let u = Usage::new(0x0009, 0x0030);
        assert_eq!(Usage::from_raw(u.raw()), u);
        assert_eq!(u.raw(), 0x0009_0030);
    }

    #[test]
    fn gpio_usages_live_on_reserved_page() {
        let u = Usage::gpio(3);
        assert!(u.is_gpio());
        assert_eq!(u.raw(), 0xFFF4_0003);
        assert!(!Usage::new(pages::BUTTON, 3).is_gpio());
    }
}
