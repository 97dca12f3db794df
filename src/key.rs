//! Key capabilities
//!
//! A buffer key needs two things:
//! - equality (`Eq`), for exact-key lookup in both tiers
//! - a stable, filesystem-safe name (`FileName`), for its spill file
//!
//! Names are lowercase hex so arbitrary key bytes map to legal,
//! collision-free file names.

use bytes::Bytes;

/// Projection of a key onto a file name
pub trait FileName {
    /// Deterministic, filesystem-safe name for this key
    fn file_name(&self) -> String;
}

/// Everything the buffer requires of a key type
pub trait BufferKey: Eq + Clone + Send + Sync + FileName + 'static {}

impl<T> BufferKey for T where T: Eq + Clone + Send + Sync + FileName + 'static {}

impl FileName for Vec<u8> {
    fn file_name(&self) -> String {
        hex::encode(self)
    }
}

impl FileName for Bytes {
    fn file_name(&self) -> String {
        hex::encode(self)
    }
}

impl<const N: usize> FileName for [u8; N] {
    fn file_name(&self) -> String {
        hex::encode(self)
    }
}

impl FileName for String {
    fn file_name(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl FileName for u64 {
    fn file_name(&self) -> String {
        hex::encode(self.to_be_bytes())
    }
}

impl FileName for u32 {
    fn file_name(&self) -> String {
        hex::encode(self.to_be_bytes())
    }
}
