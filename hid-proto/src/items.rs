//! Tokenizer for the HID report descriptor item stream.
//!
//! A descriptor is a sequence of *items*: a one-byte prefix encoding the
//! item class (main/global/local), a tag, and a payload size of 0, 1, 2 or
//! 4 bytes, followed by the payload. The obsolete long-item form (prefix
//! `0xFE`) carries its size and tag in the next two bytes; it is surfaced
//! so the descriptor parser can skip it.
//!
//! The tokenizer never reads past the end of the slice: a prefix whose
//! declared payload would overrun the buffer yields
//! [`ParseError::UnexpectedEnd`](crate::descriptor::ParseError).

use crate::descriptor::ParseError;

/// Item class from bits 3:2 of the prefix byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ItemClass {
    Main,
    Global,
    Local,
    /// Reserved class; also used for the long-item escape.
    Reserved,
}

/// One decoded item: class, tag and raw payload bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Item<'a> {
    pub class: ItemClass,
    pub tag: u8,
    pub data: &'a [u8],
}

impl Item<'_> {
    /// Payload as an unsigned little-endian value (zero when empty).
    #[inline]
    #[must_use]
    pub fn udata(&self) -> u32 {
        let mut value: u32 = 0;
        for (i, &b) in self.data.iter().enumerate().take(4) {
            value |= (b as u32) << (8 * i);
        }
        value
    }

    /// Payload as a signed value, sign-extended from its encoded width.
    ///
    /// Logical minimum/maximum are encoded in as few bytes as possible and
    /// interpreted as two's complement of that width. Short items only
    /// ever carry 0/1/2/4 bytes, but long items may surface any length;
    /// odd widths sign-extend too, and anything past 4 bytes is ignored.
    #[inline]
    #[must_use]
    pub fn sdata(&self) -> i32 {
        match self.data {
            [] => 0,
            &[b0] => b0 as i8 as i32,
            &[b0, b1] => i16::from_le_bytes([b0, b1]) as i32,
            &[b0, b1, b2] => (i32::from_le_bytes([b0, b1, b2, 0]) << 8) >> 8,
            &[b0, b1, b2, b3, ..] => i32::from_le_bytes([b0, b1, b2, b3]),
        }
    }
}

/// Iterator over the items of a descriptor byte slice.
///
/// Yields `Result` so truncation inside an item is distinguishable from
/// the end of the stream.
pub struct Items<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Items<'a> {
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Byte offset of the next unread item, for diagnostics.
    #[inline]
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for Items<'a> {
    type Item = Result<Item<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        let prefix = *self.bytes.get(self.pos)?;
        self.pos += 1;
        // On any truncation below the stream is consumed entirely so the
        // iterator fuses instead of resynchronizing on garbage.

        let mut size = match prefix & 0x03 {
            3 => 4,
            n => n as usize,
        };
        let class = match (prefix >> 2) & 0x03 {
            0 => ItemClass::Main,
            1 => ItemClass::Global,
            2 => ItemClass::Local,
            _ => ItemClass::Reserved,
        };
        let mut tag = prefix >> 4;

        // Long item: prefix 0xFE, then [size][tag][data...]
        if prefix == 0xFE {
            let Some(&long_size) = self.bytes.get(self.pos) else {
                self.pos = self.bytes.len();
                return Some(Err(ParseError::UnexpectedEnd));
            };
            let Some(&long_tag) = self.bytes.get(self.pos + 1) else {
                self.pos = self.bytes.len();
                return Some(Err(ParseError::UnexpectedEnd));
            };
            self.pos += 2;
            size = long_size as usize;
            tag = long_tag;
        }

        let Some(data) = self.bytes.get(self.pos..self.pos + size) else {
            self.pos = self.bytes.len();
            return Some(Err(ParseError::UnexpectedEnd));
        };
        self.pos += size;

        Some(Ok(Item { class, tag, data }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_short_items() {
        // Usage Page (Generic Desktop), Usage (Gamepad), Logical Maximum (255)
        let bytes = [0x05, 0x01, 0x09, 0x05, 0x26, 0xFF, 0x00];
        let mut items = Items::new(&bytes);

        let item = items.next().unwrap().unwrap();
        assert_eq!(item.class, ItemClass::Global);
        assert_eq!(item.tag, 0x0);
        assert_eq!(item.udata(), 0x01);

        let item = items.next().unwrap().unwrap();
        assert_eq!(item.class, ItemClass::Local);
        assert_eq!(item.udata(), 0x05);

        let item = items.next().unwrap().unwrap();
        assert_eq!(item.class, ItemClass::Global);
        assert_eq!(item.tag, 0x2);
        assert_eq!(item.sdata(), 255);

        assert!(items.next().is_none());
    }

    #[test]
    fn zero_size_item_has_empty_payload() {
        // End Collection
        let bytes = [0xC0];
        let item = Items::new(&bytes).next().unwrap().unwrap();
        assert_eq!(item.class, ItemClass::Main);
        assert_eq!(item.tag, 0xC);
        assert!(item.data.is_empty());
    }

    #[test]
    fn sign_extension_follows_encoded_width() {
        // Logical Minimum (-127) as a 1-byte item
        let bytes = [0x15, 0x81];
        let item = Items::new(&bytes).next().unwrap().unwrap();
        assert_eq!(item.sdata(), -127);

        // Same payload byte but 2-byte encoded: 0x0081 = 129
        let bytes = [0x16, 0x81, 0x00];
        let item = Items::new(&bytes).next().unwrap().unwrap();
        assert_eq!(item.sdata(), 129);
    }

    #[test]
    fn long_item_is_surfaced_with_its_tag() {
        let bytes = [0xFE, 0x02, 0x42, 0xAA, 0xBB, 0xC0];
        let mut items = Items::new(&bytes);

        let item = items.next().unwrap().unwrap();
        assert_eq!(item.class, ItemClass::Reserved);
        assert_eq!(item.tag, 0x42);
        assert_eq!(item.data, &[0xAA, 0xBB]);

        let item = items.next().unwrap().unwrap();
        assert_eq!(item.tag, 0xC);
    }

    #[test]
    fn long_item_payload_widths_decode() {
        // 3-byte long-item payload: 0x800000 is -8388608 as 24-bit signed.
        let bytes = [0xFE, 0x03, 0x11, 0x00, 0x00, 0x80];
        let item = Items::new(&bytes).next().unwrap().unwrap();
        assert_eq!(item.data.len(), 3);
        assert_eq!(item.sdata(), -0x80_0000);

        // 5-byte payload: only the first four bytes carry value.
        let bytes = [0xFE, 0x05, 0x11, 0x01, 0x00, 0x00, 0x00, 0xFF];
        let item = Items::new(&bytes).next().unwrap().unwrap();
        assert_eq!(item.sdata(), 1);
        assert_eq!(item.udata(), 1);
    }

    #[test]
    fn truncated_payload_is_an_error_not_a_panic() {
        // 2-byte item with only one payload byte present
        let bytes = [0x26, 0xFF];
        let mut items = Items::new(&bytes);
        assert_eq!(items.next().unwrap(), Err(ParseError::UnexpectedEnd));
    }

    #[test]
    fn truncated_long_item_header() {
        let bytes = [0xFE, 0x05];
        let mut items = Items::new(&bytes);
        assert_eq!(items.next().unwrap(), Err(ParseError::UnexpectedEnd));
    }

    #[test]
    fn every_prefix_length_terminates() {
        // Tokenizing any prefix of a real descriptor must end in Ok-items
        // then None, or a single UnexpectedEnd.
        let desc: &[u8] = &[
            0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, 0x85, 0x01, 0x05, 0x07, 0x19, 0xE0, 0x29, 0xE7,
            0x15, 0x00, 0x25, 0x01, 0x75, 0x01, 0x95, 0x08, 0x81, 0x02, 0xC0,
        ];
        for len in 0..=desc.len() {
            let mut items = Items::new(&desc[..len]);
            let mut saw_error = false;
            for item in &mut items {
                assert!(!saw_error, "items continued after an error");
                saw_error = item.is_err();
            }
        }
    }
}
