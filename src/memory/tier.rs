//! MemoryTier implementation
//!
//! FIFO index of in-memory entries guarded by a Mutex/Condvar pair.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{BufferError, Result};
use crate::key::BufferKey;

use super::{MemoryEntry, StoringState};

/// Outcome of `MemoryTier::insert`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The value is in memory under `seq`. `replaced` is the disk state
    /// of an entry for the same key that this admission displaced.
    Admitted {
        seq: u64,
        replaced: Option<StoringState>,
    },

    /// The value is larger than the whole memory quota
    Oversized,
}

struct MemoryState<K> {
    /// Oldest first
    entries: VecDeque<MemoryEntry<K>>,
    current: u64,
    max: u64,
    next_seq: u64,
    stopped: bool,
}

impl<K: BufferKey> MemoryState<K> {
    fn position(&self, key: &K) -> Option<usize> {
        self.entries.iter().position(|entry| &entry.key == key)
    }

    fn position_seq(&self, seq: u64) -> Option<usize> {
        self.entries.iter().position(|entry| entry.seq == seq)
    }

    fn erase(&mut self, index: usize) -> Option<MemoryEntry<K>> {
        let entry = self.entries.remove(index)?;
        self.current -= entry.size();
        Some(entry)
    }

    /// Drop the oldest entry whose disk copy is durable
    fn evict_oldest_flushed(&mut self) -> Option<K> {
        let index = self.entries.iter().position(MemoryEntry::is_evictable)?;
        let entry = self.erase(index)?;
        debug!(bytes = entry.size(), "evicted flushed entry from memory");
        Some(entry.key)
    }
}

/// Bounded in-memory tier
///
/// ## Concurrency:
/// - All index mutation happens under `state`
/// - `space` is notified whenever bytes are freed, an entry becomes
///   evictable, the quota changes, or the tier stops
pub struct MemoryTier<K> {
    state: Mutex<MemoryState<K>>,
    space: Condvar,
}

impl<K: BufferKey> MemoryTier<K> {
    /// Create an empty tier with the given quota (in bytes)
    pub fn new(max_bytes: u64) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                entries: VecDeque::new(),
                current: 0,
                max: max_bytes,
                next_seq: 0,
                stopped: false,
            }),
            space: Condvar::new(),
        }
    }

    /// Look up a value by key
    pub fn find(&self, key: &K) -> Option<Bytes> {
        let state = self.state.lock();
        state
            .position(key)
            .map(|index| state.entries[index].value.clone())
    }

    /// Append a value as the newest entry
    ///
    /// Blocks while the tier is full and nothing is evictable. Returns
    /// `Oversized` (without inserting) if the value can never fit, and an
    /// error once the tier has been stopped. An entry for the same key
    /// admitted while this call waited is replaced, so a key is resident
    /// at most once.
    pub fn insert(&self, key: K, value: Bytes) -> Result<Admission> {
        let size = value.len() as u64;
        let mut state = self.state.lock();

        loop {
            if state.stopped {
                return Err(BufferError::stopped());
            }
            if size > state.max {
                return Ok(Admission::Oversized);
            }
            if state.current + size <= state.max {
                break;
            }
            if state.evict_oldest_flushed().is_none() {
                self.space.wait(&mut state);
            }
        }

        let replaced = state
            .position(&key)
            .and_then(|index| state.erase(index))
            .map(|entry| entry.also_on_disk);

        let seq = state.next_seq;
        state.next_seq += 1;
        state.current += size;
        state.entries.push_back(MemoryEntry {
            key,
            value,
            also_on_disk: StoringState::NotStarted,
            seq,
        });
        Ok(Admission::Admitted { seq, replaced })
    }

    /// Evict the oldest entry whose disk copy is `Completed`
    ///
    /// Returns the evicted key, or `None` if nothing is evictable yet.
    pub fn evict_oldest_flushed(&self) -> Option<K> {
        let evicted = self.state.lock().evict_oldest_flushed();
        if evicted.is_some() {
            self.space.notify_all();
        }
        evicted
    }

    /// Remove an entry, returning its prior disk state
    pub fn remove(&self, key: &K) -> Option<StoringState> {
        let removed = {
            let mut state = self.state.lock();
            state
                .position(key)
                .and_then(|index| state.erase(index))
                .map(|entry| entry.also_on_disk)
        };
        if removed.is_some() {
            self.space.notify_all();
        }
        removed
    }

    /// Remove every entry whose key matches, returning how many were removed
    pub fn remove_if<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let removed = {
            let mut state = self.state.lock();
            let before = state.entries.len();
            let mut freed = 0;
            state.entries.retain(|entry| {
                let matched = predicate(&entry.key);
                if matched {
                    freed += entry.size();
                }
                !matched
            });
            state.current -= freed;
            before - state.entries.len()
        };
        if removed > 0 {
            self.space.notify_all();
        }
        removed
    }

    /// Remove the entry admitted under `seq`, if it is still present
    pub(crate) fn remove_seq(&self, seq: u64) -> bool {
        let removed = {
            let mut state = self.state.lock();
            state
                .position_seq(seq)
                .and_then(|index| state.erase(index))
                .is_some()
        };
        if removed {
            self.space.notify_all();
        }
        removed
    }

    /// Remove `key` only if its disk copy is durable
    pub(crate) fn remove_flushed(&self, key: &K) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state.position(key) {
                Some(index) if state.entries[index].is_evictable() => state.erase(index).is_some(),
                _ => false,
            }
        };
        if removed {
            self.space.notify_all();
        }
        removed
    }

    /// Claim the entry admitted under `seq` for flushing
    ///
    /// Transitions `NotStarted -> Started` and runs `begin` with the key
    /// while the tier lock is still held, so a concurrent `remove` either
    /// happens before the claim or observes the disk write `begin` set up.
    /// `begin` must not block.
    pub(crate) fn claim<R>(&self, seq: u64, begin: impl FnOnce(&K) -> R) -> Option<(K, Bytes, R)> {
        let mut state = self.state.lock();
        let index = state.position_seq(seq)?;
        let entry = &mut state.entries[index];
        if entry.also_on_disk != StoringState::NotStarted {
            return None;
        }
        entry.also_on_disk = StoringState::Started;
        let started = begin(&entry.key);
        Some((entry.key.clone(), entry.value.clone(), started))
    }

    /// Mark the entry admitted under `seq` as durable on disk
    pub(crate) fn mark_completed(&self, seq: u64) -> bool {
        let marked = {
            let mut state = self.state.lock();
            match state.position_seq(seq) {
                Some(index) => {
                    state.entries[index].also_on_disk = StoringState::Completed;
                    true
                }
                None => false,
            }
        };
        if marked {
            self.space.notify_all();
        }
        marked
    }

    /// Disk state of `key`, if resident
    pub fn state_of(&self, key: &K) -> Option<StoringState> {
        let state = self.state.lock();
        state
            .position(key)
            .map(|index| state.entries[index].also_on_disk)
    }

    /// Change the quota and wake blocked inserters
    pub fn set_max(&self, max_bytes: u64) {
        self.state.lock().max = max_bytes;
        self.space.notify_all();
    }

    /// Wake blocked inserters so they re-check their predicate
    pub fn wake(&self) {
        self.space.notify_all();
    }

    /// Stop the tier: every current and future wait fails
    pub fn stop(&self) {
        self.state.lock().stopped = true;
        self.space.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Bytes currently held
    pub fn usage(&self) -> u64 {
        self.state.lock().current
    }

    pub fn max(&self) -> u64 {
        self.state.lock().max
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
