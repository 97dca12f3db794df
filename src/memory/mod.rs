//! Memory Tier Module
//!
//! Bounded, FIFO-ordered store of recently written values.
//!
//! ## Responsibilities
//! - Serve reads for values still resident in memory
//! - Track byte usage against the memory quota
//! - Evict only entries whose disk copy is durable
//! - Record each entry's progress towards disk
//!
//! ## Data Structure Choice
//! A `VecDeque` behind a parking_lot `Mutex` + `Condvar`:
//! - Insertion order is eviction order (oldest first)
//! - Entry count is bounded by the quota, so lookups scan linearly

mod tier;

pub use tier::{Admission, MemoryTier};

use bytes::Bytes;

/// Lifecycle of one value's disk copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoringState {
    /// Nobody has started writing this value to disk
    NotStarted,

    /// A disk write is in progress
    Started,

    /// The value is durable on disk
    Completed,

    /// The value was deleted while its disk write was in progress
    Cancelled,
}

/// One value resident in memory
#[derive(Debug, Clone)]
pub struct MemoryEntry<K> {
    pub key: K,
    pub value: Bytes,
    pub also_on_disk: StoringState,

    /// Insertion sequence number, unique per admission
    pub(crate) seq: u64,
}

impl<K> MemoryEntry<K> {
    /// Only entries with a durable disk copy may leave memory for space
    pub fn is_evictable(&self) -> bool {
        self.also_on_disk == StoringState::Completed
    }

    pub fn size(&self) -> u64 {
        self.value.len() as u64
    }
}
