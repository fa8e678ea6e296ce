//! Bit-level report codec.
//!
//! HID report fields are packed little-endian and bit-aligned: bit 0 of a
//! field is the lowest-numbered bit of the lowest-numbered byte it
//! touches, and fields freely straddle byte boundaries. [`extract`] reads
//! a field out of a report buffer and [`insert`] writes one in, leaving
//! every surrounding bit untouched.

/// Codec failure on one field access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CodecError {
    /// The field extends past the end of the buffer.
    OutOfBounds,
    /// Width of zero or more than 32 bits.
    InvalidWidth,
}

#[inline]
fn check(len: usize, bit_offset: u16, bit_width: u8) -> Result<(), CodecError> {
    if bit_width == 0 || bit_width > 32 {
        return Err(CodecError::InvalidWidth);
    }
    let end = bit_offset as usize + bit_width as usize;
    if end > len * 8 {
        return Err(CodecError::OutOfBounds);
    }
    Ok(())
}

/// Read `bit_width` bits starting at `bit_offset`, sign-extending the
/// result when `signed`.
pub fn extract(bytes: &[u8], bit_offset: u16, bit_width: u8, signed: bool) -> Result<i32, CodecError> {
    check(bytes.len(), bit_offset, bit_width)?;
    let mut raw: u32 = 0;
    for i in 0..bit_width as usize {
        let pos = bit_offset as usize + i;
        let bit = (bytes[pos / 8] >> (pos % 8)) & 1;
        raw |= (bit as u32) << i;
    }
    if signed && bit_width < 32 && raw & (1 << (bit_width - 1)) != 0 {
        raw |= !0u32 << bit_width;
    }
    Ok(raw as i32)
}

/// Write the low `bit_width` bits of `value` at `bit_offset`. Bits of
/// `value` above the field width are discarded, which is also how
/// negative values land in their two's-complement encoding.
pub fn insert(bytes: &mut [u8], bit_offset: u16, bit_width: u8, value: i32) -> Result<(), CodecError> {
    check(bytes.len(), bit_offset, bit_width)?;
    let raw = value as u32;
    for i in 0..bit_width as usize {
        let pos = bit_offset as usize + i;
        let mask = 1u8 << (pos % 8);
        if raw >> i & 1 != 0 {
            bytes[pos / 8] |= mask;
        } else {
            bytes[pos / 8] &= !mask;
        }
    }
    Ok(())
}
