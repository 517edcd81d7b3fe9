use std::cmp::Ordering;
use std::fmt::Debug;

use crate::types::Result;

/// Codec and comparator for the keys and values of one index kind.
///
/// The tree engine is generic over this trait and never inspects key bytes itself:
/// every comparison goes through [`Layout::compare`] on decoded keys. Implementations
/// must satisfy `read_key(write_key(k)) == k` and `read_value(write_value(v)) == v`,
/// and `compare` must be a strict total order.
///
/// The identifier and versions are persisted in the store's meta page; reopening a
/// store with a layout that reports different values fails with
/// [`crate::TreeError::MetadataMismatch`].
pub trait Layout: Send + Sync + 'static {
    /// Logical key type.
    type Key: Clone + Debug + Send + Sync + 'static;
    /// Logical value type.
    type Value: Clone + Debug + Send + Sync + 'static;

    /// Stable identifier of the encoding.
    fn identifier(&self) -> u64;
    /// Major format version; incompatible changes bump it.
    fn major_version(&self) -> u32;
    /// Minor format version.
    fn minor_version(&self) -> u32;

    /// Total order over keys.
    fn compare(&self, a: &Self::Key, b: &Self::Key) -> Ordering;

    /// Encoded size of `key` in bytes.
    fn key_size(&self, key: &Self::Key) -> usize;
    /// Encoded size of `value` in bytes.
    fn value_size(&self, value: &Self::Value) -> usize;
    /// True when every key and every value encodes to the same size.
    fn fixed_size(&self) -> bool;
    /// Upper bound on [`Layout::key_size`].
    fn max_key_size(&self) -> usize;
    /// Upper bound on [`Layout::value_size`].
    fn max_value_size(&self) -> usize;

    /// Encodes `key` into `dst`, which is exactly `key_size(key)` bytes long.
    fn write_key(&self, key: &Self::Key, dst: &mut [u8]);
    /// Decodes a key from exactly the bytes `write_key` produced.
    fn read_key(&self, src: &[u8]) -> Result<Self::Key>;
    /// Encodes `value` into `dst`, which is exactly `value_size(value)` bytes long.
    fn write_value(&self, value: &Self::Value, dst: &mut [u8]);
    /// Decodes a value from exactly the bytes `write_value` produced.
    fn read_value(&self, src: &[u8]) -> Result<Self::Value>;

    /// Key ordered at or below every key the index can hold.
    fn lowest_key(&self) -> Self::Key;
    /// Key ordered at or above every key the index can hold.
    fn highest_key(&self) -> Self::Key;

    /// True when the unsigned byte order of encoded keys equals [`Layout::compare`].
    fn byte_comparable(&self) -> bool {
        false
    }
}
