#![forbid(unsafe_code)]
//! Fixed-width big-endian field access shared by the page formats.

use crate::types::{Result, TreeError};

/// Reads a big-endian `u16` at `off`, failing if the slice is too short.
pub fn get_u16(src: &[u8], off: usize) -> Result<u16> {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(field(src, off, 2)?);
    Ok(u16::from_be_bytes(raw))
}

/// Reads a big-endian `u32` at `off`, failing if the slice is too short.
pub fn get_u32(src: &[u8], off: usize) -> Result<u32> {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(field(src, off, 4)?);
    Ok(u32::from_be_bytes(raw))
}

/// Reads a big-endian `u64` at `off`, failing if the slice is too short.
pub fn get_u64(src: &[u8], off: usize) -> Result<u64> {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(field(src, off, 8)?);
    Ok(u64::from_be_bytes(raw))
}

/// Writes a big-endian `u16` at `off`.
pub fn put_u16(dst: &mut [u8], off: usize, v: u16) {
    dst[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

/// Writes a big-endian `u32` at `off`.
pub fn put_u32(dst: &mut [u8], off: usize, v: u32) {
    dst[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

/// Writes a big-endian `u64` at `off`.
pub fn put_u64(dst: &mut [u8], off: usize, v: u64) {
    dst[off..off + 8].copy_from_slice(&v.to_be_bytes());
}

fn field(src: &[u8], off: usize, len: usize) -> Result<&[u8]> {
    off.checked_add(len)
        .and_then(|end| src.get(off..end))
        .ok_or(TreeError::Corruption("field extends past end of buffer"))
}

pub mod ord {
    //! Order-preserving encoding for floating point keys.

    const SIGN_BIT: u64 = 1 << 63;

    /// Maps an `f64` to bits whose unsigned order matches `f64::total_cmp`.
    pub fn encode_f64_bits(v: f64) -> u64 {
        let bits = v.to_bits();
        if bits & SIGN_BIT != 0 {
            !bits
        } else {
            bits ^ SIGN_BIT
        }
    }

    /// Inverse of [`encode_f64_bits`].
    pub fn decode_f64_bits(encoded: u64) -> f64 {
        let bits = if encoded & SIGN_BIT != 0 {
            encoded ^ SIGN_BIT
        } else {
            !encoded
        };
        f64::from_bits(bits)
    }
}
