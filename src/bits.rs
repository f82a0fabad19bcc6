// SPDX-License-Identifier: MIT

//! Bit-shift primitives shared by every codec.
//!
//! HID reports are packed LSB-first: a field at bit offset `b` starts at bit
//! `b % 8` (counted from the least significant bit) of byte `b / 8`. Values
//! are always prepared at bit offset 0 in a scratch buffer and then shifted
//! into place, so a 3-bit field may share its byte with the fields around it.

/// A mask with the lowest `width` bits set, `width` in `0..=8`.
pub(crate) fn low_mask(width: usize) -> u8 {
    match width {
        0 => 0,
        8.. => 0xff,
        w => (1u8 << w) - 1,
    }
}

/// The number of bytes needed to hold `nbits` bits.
pub(crate) fn bytes_for(nbits: usize) -> usize {
    nbits.div_ceil(8)
}

/// Write the lowest `nbits` bits of `src` (LSB-first, offset 0) into `dst`
/// starting at `bit_offset`.
///
/// Every source byte is shifted left by `bit_offset % 8`, the destination
/// bits below the field are preserved and the carry `byte >> (8 - shift)`
/// is folded into the following byte. Bits of `dst` outside the field are
/// left untouched.
///
/// The caller guarantees `dst` holds at least `bit_offset + nbits` bits.
pub(crate) fn write_bits(dst: &mut [u8], bit_offset: usize, src: &[u8], nbits: usize) {
    let shift = bit_offset % 8;
    let mut index = bit_offset / 8;
    let mut remaining = nbits;

    for &byte in src {
        if remaining == 0 {
            break;
        }
        let width = remaining.min(8);
        let field = u16::from(low_mask(width)) << shift;
        let shifted = u16::from(byte & low_mask(width)) << shift;

        dst[index] = (dst[index] & !(field as u8)) | shifted as u8;
        let carry = (field >> 8) as u8;
        if carry != 0 {
            dst[index + 1] = (dst[index + 1] & !carry) | (shifted >> 8) as u8;
        }

        index += 1;
        remaining -= width;
    }
}

/// Read `nbits` bits starting at `bit_offset` from `src` into a fresh
/// buffer where they start at bit offset 0. Unused high bits of the last
/// byte are zero.
///
/// The caller guarantees `src` holds at least `bit_offset + nbits` bits.
pub(crate) fn read_bits(src: &[u8], bit_offset: usize, nbits: usize) -> Vec<u8> {
    let shift = bit_offset % 8;
    let start = bit_offset / 8;
    let mut out = vec![0u8; bytes_for(nbits)];

    for (i, byte) in out.iter_mut().enumerate() {
        let lo = src[start + i] >> shift;
        let hi = if shift == 0 {
            0
        } else {
            src.get(start + i + 1).map_or(0, |b| b << (8 - shift))
        };
        *byte = lo | hi;
    }

    if nbits % 8 != 0 {
        if let Some(last) = out.last_mut() {
            *last &= low_mask(nbits % 8);
        }
    }
    out
}

/// True if `src` holds at least `bit_offset + nbits` bits.
pub(crate) fn fits(src_len: usize, bit_offset: usize, nbits: usize) -> bool {
    bit_offset
        .checked_add(nbits)
        .is_some_and(|end| end <= src_len * 8)
}
