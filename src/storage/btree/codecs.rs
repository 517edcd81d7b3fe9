//! Reference [`Layout`] implementations.

use std::cmp::Ordering;

use super::Layout;
use crate::primitives::bytes::{get_u64, ord, put_u64};
use crate::types::{Result, TreeError};

const fn tag(bytes: &[u8; 8]) -> u64 {
    u64::from_be_bytes(*bytes)
}

fn exact<'a>(src: &'a [u8], len: usize, what: &'static str) -> Result<&'a [u8]> {
    if src.len() == len {
        Ok(src)
    } else {
        Err(TreeError::Corruption(what))
    }
}

/// Fixed-size `u64 -> u64` layout.
#[derive(Clone, Copy, Debug, Default)]
pub struct U64Layout;

impl Layout for U64Layout {
    type Key = u64;
    type Value = u64;

    fn identifier(&self) -> u64 {
        tag(b"gt.u64\0\0")
    }

    fn major_version(&self) -> u32 {
        1
    }

    fn minor_version(&self) -> u32 {
        0
    }

    fn compare(&self, a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }

    fn key_size(&self, _key: &u64) -> usize {
        8
    }

    fn value_size(&self, _value: &u64) -> usize {
        8
    }

    fn fixed_size(&self) -> bool {
        true
    }

    fn max_key_size(&self) -> usize {
        8
    }

    fn max_value_size(&self) -> usize {
        8
    }

    fn write_key(&self, key: &u64, dst: &mut [u8]) {
        put_u64(dst, 0, *key);
    }

    fn read_key(&self, src: &[u8]) -> Result<u64> {
        get_u64(exact(src, 8, "u64 key length mismatch")?, 0)
    }

    fn write_value(&self, value: &u64, dst: &mut [u8]) {
        put_u64(dst, 0, *value);
    }

    fn read_value(&self, src: &[u8]) -> Result<u64> {
        get_u64(exact(src, 8, "u64 value length mismatch")?, 0)
    }

    fn lowest_key(&self) -> u64 {
        0
    }

    fn highest_key(&self) -> u64 {
        u64::MAX
    }

    fn byte_comparable(&self) -> bool {
        true
    }
}

/// Key of a numeric schema index: the indexed number plus the owning entity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NumberKey {
    /// Indexed property value.
    pub value: f64,
    /// Entity carrying the value; breaks ties between equal values.
    pub entity_id: u64,
}

impl NumberKey {
    /// Builds a key.
    pub fn new(value: f64, entity_id: u64) -> Self {
        Self { value, entity_id }
    }
}

/// Fixed-size layout for numeric schema indexes: `(f64, entity) -> ()`.
///
/// Values are ordered by `f64::total_cmp`, so `-0.0 < 0.0` and NaNs sort at the
/// extremes. The sentinels are the NaN bit patterns at either end of that order.
#[derive(Clone, Copy, Debug, Default)]
pub struct NumberLayout;

const NUMBER_KEY_LEN: usize = 16;

impl Layout for NumberLayout {
    type Key = NumberKey;
    type Value = ();

    fn identifier(&self) -> u64 {
        tag(b"gt.num\0\0")
    }

    fn major_version(&self) -> u32 {
        0
    }

    fn minor_version(&self) -> u32 {
        1
    }

    fn compare(&self, a: &NumberKey, b: &NumberKey) -> Ordering {
        a.value
            .total_cmp(&b.value)
            .then(a.entity_id.cmp(&b.entity_id))
    }

    fn key_size(&self, _key: &NumberKey) -> usize {
        NUMBER_KEY_LEN
    }

    fn value_size(&self, _value: &()) -> usize {
        0
    }

    fn fixed_size(&self) -> bool {
        true
    }

    fn max_key_size(&self) -> usize {
        NUMBER_KEY_LEN
    }

    fn max_value_size(&self) -> usize {
        0
    }

    fn write_key(&self, key: &NumberKey, dst: &mut [u8]) {
        put_u64(dst, 0, ord::encode_f64_bits(key.value));
        put_u64(dst, 8, key.entity_id);
    }

    fn read_key(&self, src: &[u8]) -> Result<NumberKey> {
        let src = exact(src, NUMBER_KEY_LEN, "number key length mismatch")?;
        Ok(NumberKey {
            value: ord::decode_f64_bits(get_u64(src, 0)?),
            entity_id: get_u64(src, 8)?,
        })
    }

    fn write_value(&self, _value: &(), _dst: &mut [u8]) {}

    fn read_value(&self, src: &[u8]) -> Result<()> {
        exact(src, 0, "number value length mismatch").map(|_| ())
    }

    fn lowest_key(&self) -> NumberKey {
        NumberKey::new(f64::from_bits(u64::MAX), 0)
    }

    fn highest_key(&self) -> NumberKey {
        NumberKey::new(f64::from_bits(0x7fff_ffff_ffff_ffff), u64::MAX)
    }

    fn byte_comparable(&self) -> bool {
        true
    }
}

/// Variable-size byte-string layout, ordered lexicographically.
#[derive(Clone, Copy, Debug)]
pub struct BytesLayout {
    max_key: usize,
    max_value: usize,
}

impl BytesLayout {
    /// Creates a layout bounding key and value lengths.
    pub fn new(max_key: usize, max_value: usize) -> Result<Self> {
        if max_key == 0 || max_key > u16::MAX as usize || max_value > u16::MAX as usize {
            return Err(TreeError::Invalid("byte layout bounds out of range"));
        }
        Ok(Self { max_key, max_value })
    }
}

impl Layout for BytesLayout {
    type Key = Vec<u8>;
    type Value = Vec<u8>;

    fn identifier(&self) -> u64 {
        tag(b"gt.bytes")
    }

    fn major_version(&self) -> u32 {
        1
    }

    fn minor_version(&self) -> u32 {
        0
    }

    fn compare(&self, a: &Vec<u8>, b: &Vec<u8>) -> Ordering {
        a.cmp(b)
    }

    fn key_size(&self, key: &Vec<u8>) -> usize {
        key.len()
    }

    fn value_size(&self, value: &Vec<u8>) -> usize {
        value.len()
    }

    fn fixed_size(&self) -> bool {
        false
    }

    fn max_key_size(&self) -> usize {
        self.max_key
    }

    fn max_value_size(&self) -> usize {
        self.max_value
    }

    fn write_key(&self, key: &Vec<u8>, dst: &mut [u8]) {
        dst.copy_from_slice(key);
    }

    fn read_key(&self, src: &[u8]) -> Result<Vec<u8>> {
        if src.len() > self.max_key {
            return Err(TreeError::Corruption("byte key longer than layout maximum"));
        }
        Ok(src.to_vec())
    }

    fn write_value(&self, value: &Vec<u8>, dst: &mut [u8]) {
        dst.copy_from_slice(value);
    }

    fn read_value(&self, src: &[u8]) -> Result<Vec<u8>> {
        if src.len() > self.max_value {
            return Err(TreeError::Corruption(
                "byte value longer than layout maximum",
            ));
        }
        Ok(src.to_vec())
    }

    fn lowest_key(&self) -> Vec<u8> {
        Vec::new()
    }

    fn highest_key(&self) -> Vec<u8> {
        vec![0xFF; self.max_key]
    }

    fn byte_comparable(&self) -> bool {
        true
    }
}
