//! Variable-length integer helpers
//!
//! Two encodings live here:
//! - LEB128 `uvarint` (7 bits per byte, high bit set on every byte but the
//!   last) used throughout the segment file.
//! - An order-preserving "ascending" encoding used for metadata store keys,
//!   where byte-wise comparison of encoded values matches numeric order.

use std::io::{self, Write};

use crate::error::{Result, SedimentError};

/// Longest possible uvarint encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

/// Append the uvarint encoding of `value` to `output`
pub fn put_uvarint(output: &mut Vec<u8>, value: u64) {
    let mut v = value;
    while v >= 0x80 {
        output.push((v as u8) | 0x80);
        v >>= 7;
    }
    output.push(v as u8);
}

/// Write the uvarint encoding of `value`, returning the number of bytes written
pub fn write_uvarint<W: Write>(w: &mut W, value: u64) -> io::Result<usize> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let mut v = value;
    let mut n = 0;
    while v >= 0x80 {
        buf[n] = (v as u8) | 0x80;
        v >>= 7;
        n += 1;
    }
    buf[n] = v as u8;
    n += 1;
    w.write_all(&buf[..n])?;
    Ok(n)
}

/// Number of bytes `value` occupies as a uvarint
pub fn uvarint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Decode a uvarint starting at `*pos`, advancing `*pos` past it
pub fn read_uvarint(input: &[u8], pos: &mut usize) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;

    for i in 0..MAX_VARINT_LEN {
        let Some(&byte) = input.get(*pos) else {
            return Err(SedimentError::corrupt("unexpected end of uvarint"));
        };
        *pos += 1;

        if byte < 0x80 {
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(SedimentError::corrupt("uvarint overflows u64"));
            }
            return Ok(result | (byte as u64) << shift);
        }
        result |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }

    Err(SedimentError::corrupt("uvarint overflows u64"))
}

const INT_MIN: u8 = 0x80;
const INT_MAX: u8 = 0xfd;
const INT_ZERO: u8 = INT_MIN + 8;
const INT_SMALL: u64 = (INT_MAX - INT_ZERO - 8) as u64;

/// Append an order-preserving encoding of `value`
///
/// Values up to 109 take a single byte; larger values take a length byte
/// followed by their big-endian representation with leading zeros removed.
pub fn put_uvarint_ascending(output: &mut Vec<u8>, value: u64) {
    if value <= INT_SMALL {
        output.push(INT_ZERO + value as u8);
        return;
    }
    let n = 8 - (value.leading_zeros() / 8) as usize;
    output.push(INT_MAX - 8 + n as u8);
    output.extend_from_slice(&value.to_be_bytes()[8 - n..]);
}

/// Decode a value written by [`put_uvarint_ascending`], returning it and the
/// remaining bytes
pub fn read_uvarint_ascending(input: &[u8]) -> Result<(u64, &[u8])> {
    let Some((&first, rest)) = input.split_first() else {
        return Err(SedimentError::corrupt("empty ascending uvarint"));
    };
    if first < INT_ZERO || first > INT_MAX {
        return Err(SedimentError::corrupt(format!(
            "invalid ascending uvarint marker {first:#04x}"
        )));
    }
    if first as u64 <= INT_ZERO as u64 + INT_SMALL {
        return Ok(((first - INT_ZERO) as u64, rest));
    }
    let n = (first - (INT_MAX - 8)) as usize;
    if rest.len() < n {
        return Err(SedimentError::corrupt("truncated ascending uvarint"));
    }
    let mut buf = [0u8; 8];
    buf[8 - n..].copy_from_slice(&rest[..n]);
    Ok((u64::from_be_bytes(buf), &rest[n..]))
}
