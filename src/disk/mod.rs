//! Disk Tier Module
//!
//! Bounded store of values spilled to files in the backing directory.
//! The tier indexes lightweight descriptors; the bytes live in files.
//!
//! ## Responsibilities
//! - Write protocol: begin → wait for space → write file → complete
//! - Cancel in-flight writes of deleted keys
//! - Make space by popping the oldest completed entry (callback policy)
//! - Expose values still waiting for space via the in-flight map
//!
//! ## Directory Layout
//! ```text
//! {disk_directory}/
//!   ├── {hex(key)}.spill           (completed value + CRC32)
//!   └── {hex(key)}.{write_id}.tmp  (write in progress)
//! ```

pub mod file;
mod tier;

pub use tier::{DiskTier, WriteTicket};

use bytes::Bytes;

use crate::memory::StoringState;

/// Callback receiving each value popped from disk to make space
pub type PopFunctor<K> = Box<dyn Fn(K, Bytes) + Send + Sync>;

/// What the disk tier does when a write needs space that is not free
pub enum EvictionPolicy<K> {
    /// Wait until a caller's `delete` frees enough space
    CooperativeWait,

    /// Pop the oldest completed entry and hand it to the callback
    Callback(PopFunctor<K>),
}

impl<K> EvictionPolicy<K> {
    /// Build a callback policy from a closure
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(K, Bytes) + Send + Sync + 'static,
    {
        EvictionPolicy::Callback(Box::new(f))
    }
}

impl<K> Default for EvictionPolicy<K> {
    fn default() -> Self {
        EvictionPolicy::CooperativeWait
    }
}

impl<K> std::fmt::Debug for EvictionPolicy<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionPolicy::CooperativeWait => f.write_str("CooperativeWait"),
            EvictionPolicy::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Descriptor of one value resident (or being written) on disk
#[derive(Debug, Clone)]
pub struct DiskEntry<K> {
    pub key: K,
    pub state: StoringState,

    /// Payload bytes; reserved once space is granted, counted on completion
    pub size: u64,

    /// Write id, unique per `begin_write`
    pub(crate) id: u64,
}

impl<K> DiskEntry<K> {
    /// Cancelled descriptors only await their writer's cleanup
    pub fn is_live(&self) -> bool {
        self.state != StoringState::Cancelled
    }
}
