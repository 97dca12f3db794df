//! DiskTier implementation
//!
//! Descriptor index, byte accounting and the write protocol, guarded by
//! a Mutex/Condvar pair independent of the memory tier's.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{BufferError, Result};
use crate::fs::FileSystem;
use crate::key::BufferKey;
use crate::memory::StoringState;

use super::{file, DiskEntry, EvictionPolicy};

const SPILL_EXTENSION: &str = "spill";
const TEMP_EXTENSION: &str = "tmp";

/// Handle for one disk write, returned by `begin_write`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTicket {
    id: u64,
}

/// A value waiting for disk space, visible to readers
struct InFlight<K> {
    id: u64,
    key: K,
    value: Bytes,
}

struct DiskState<K> {
    /// Oldest first
    entries: VecDeque<DiskEntry<K>>,
    in_flight: Vec<InFlight<K>>,
    /// Bytes of completed entries
    current: u64,
    /// Bytes granted to writes not yet completed
    reserved: u64,
    max: u64,
    next_id: u64,
    stopped: bool,
}

impl<K: BufferKey> DiskState<K> {
    fn live_position(&self, key: &K) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.is_live() && &entry.key == key)
    }

    fn id_position(&self, id: u64) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    fn oldest_completed(&self) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.state == StoringState::Completed)
    }
}

/// Bounded on-disk tier
///
/// ## Concurrency:
/// - Descriptors, counters and the in-flight map live under `state`
/// - `changed` is notified on every descriptor transition, every freed
///   byte, quota change and stop
/// - Physical writes happen outside the lock on per-write temp files;
///   publication (rename) and removal happen under it
pub struct DiskTier<K> {
    state: Mutex<DiskState<K>>,
    changed: Condvar,
    directory: PathBuf,
    fs: Arc<dyn FileSystem>,
    policy: EvictionPolicy<K>,
}

impl<K: BufferKey> DiskTier<K> {
    /// Create an empty tier writing into `directory`
    pub fn new(
        directory: impl Into<PathBuf>,
        max_bytes: u64,
        fs: Arc<dyn FileSystem>,
        policy: EvictionPolicy<K>,
    ) -> Self {
        Self {
            state: Mutex::new(DiskState {
                entries: VecDeque::new(),
                in_flight: Vec::new(),
                current: 0,
                reserved: 0,
                max: max_bytes,
                next_id: 0,
                stopped: false,
            }),
            changed: Condvar::new(),
            directory: directory.into(),
            fs,
            policy,
        }
    }

    // =========================================================================
    // Write Protocol
    // =========================================================================

    /// Insert a `Started` descriptor for `key`
    ///
    /// Any live descriptor already present for the key is superseded: an
    /// in-progress write is cancelled, a completed one is removed. Never
    /// blocks.
    pub fn begin_write(&self, key: &K) -> Result<WriteTicket> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(BufferError::stopped());
        }

        let superseded = match state.live_position(key) {
            Some(index) => {
                self.retire(&mut state, index)?;
                true
            }
            None => false,
        };

        let id = state.next_id;
        state.next_id += 1;
        state.entries.push_back(DiskEntry {
            key: key.clone(),
            state: StoringState::Started,
            size: 0,
            id,
        });
        drop(state);

        if superseded {
            self.changed.notify_all();
        }
        Ok(WriteTicket { id })
    }

    /// Block until the write can be granted `value.len()` bytes
    ///
    /// Returns `Ok(true)` with the bytes reserved, or `Ok(false)` if the
    /// write was cancelled meanwhile (its descriptor is then erased).
    /// Under the callback policy the oldest completed entries are popped
    /// to make room; otherwise the value is published in the in-flight
    /// map while the writer waits for a `delete` elsewhere.
    pub fn wait_for_space(&self, ticket: WriteTicket, key: &K, value: &Bytes) -> Result<bool> {
        let size = value.len() as u64;
        let mut state = self.state.lock();
        let mut waiting = false;

        let outcome = loop {
            if state.stopped {
                break Err(BufferError::stopped());
            }
            let Some(index) = state.id_position(ticket.id) else {
                break Ok(false);
            };
            if state.entries[index].state == StoringState::Cancelled {
                break Ok(false);
            }
            if size > state.max {
                break Err(BufferError::CannotExceedLimit {
                    size,
                    limit: state.max,
                });
            }
            if state.current + state.reserved + size <= state.max {
                state.reserved += size;
                state.entries[index].size = size;
                break Ok(true);
            }

            if let EvictionPolicy::Callback(pop) = &self.policy {
                match self.pop_oldest(&mut state) {
                    Ok(Some((popped_key, popped_value))) => {
                        MutexGuard::unlocked(&mut state, || pop(popped_key, popped_value));
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => break Err(e),
                }
            }

            if !waiting {
                state.in_flight.push(InFlight {
                    id: ticket.id,
                    key: key.clone(),
                    value: value.clone(),
                });
                waiting = true;
                // Readers blocked on this descriptor can now be served
                self.changed.notify_all();
            }
            self.changed.wait(&mut state);
        };

        if waiting {
            state.in_flight.retain(|pending| pending.id != ticket.id);
        }
        if !matches!(outcome, Ok(true)) {
            if let Some(index) = state.id_position(ticket.id) {
                state.entries.remove(index);
            }
            drop(state);
            self.changed.notify_all();
        }
        outcome
    }

    /// Write the framed value to the ticket's temp file (no lock held)
    pub fn write(&self, ticket: WriteTicket, key: &K, value: &[u8]) -> Result<()> {
        self.fs
            .write(&self.temp_path(key, ticket), &file::encode(value))?;
        Ok(())
    }

    /// Publish a written value and count its bytes
    ///
    /// Returns `Ok(false)` if the write was cancelled after space was
    /// granted; the temp file is discarded and the reservation released.
    pub fn complete_write(&self, ticket: WriteTicket, key: &K) -> Result<bool> {
        let mut state = self.state.lock();

        let Some(index) = state.id_position(ticket.id) else {
            drop(state);
            self.discard_temp(key, ticket);
            return Ok(false);
        };

        let size = state.entries[index].size;
        state.reserved -= size;

        if state.entries[index].state == StoringState::Cancelled {
            state.entries.remove(index);
            drop(state);
            self.discard_temp(key, ticket);
            debug!(bytes = size, "discarded cancelled disk write");
            self.changed.notify_all();
            return Ok(false);
        }

        if let Err(e) = self.fs.rename(&self.temp_path(key, ticket), &self.file_path(key)) {
            state.entries.remove(index);
            drop(state);
            self.discard_temp(key, ticket);
            self.changed.notify_all();
            return Err(e.into());
        }

        state.entries[index].state = StoringState::Completed;
        state.current += size;
        drop(state);

        debug!(bytes = size, "completed disk write");
        self.changed.notify_all();
        Ok(true)
    }

    /// Drop a granted write whose file could not be written
    pub fn abandon(&self, ticket: WriteTicket, key: &K) {
        {
            let mut state = self.state.lock();
            if let Some(index) = state.id_position(ticket.id) {
                if let Some(entry) = state.entries.remove(index) {
                    state.reserved -= entry.size;
                }
            }
        }
        self.discard_temp(key, ticket);
        self.changed.notify_all();
    }

    /// Run the rest of the write protocol for a ticket from `begin_write`
    ///
    /// wait_for_space → write → complete_write. Returns `Ok(false)` if
    /// the write was cancelled at any point.
    pub fn write_value(&self, ticket: WriteTicket, key: &K, value: &Bytes) -> Result<bool> {
        if !self.wait_for_space(ticket, key, value)? {
            return Ok(false);
        }
        if let Err(e) = self.write(ticket, key, value) {
            self.abandon(ticket, key);
            return Err(e);
        }
        self.complete_write(ticket, key)
    }

    // =========================================================================
    // Reads and Removal
    // =========================================================================

    /// Read a value by key
    ///
    /// Blocks while the value is being written, unless it is still
    /// waiting for space and can be served from the in-flight map.
    pub fn get(&self, key: &K) -> Result<Bytes> {
        let mut state = self.state.lock();
        let mut vanished = None;

        loop {
            if state.stopped {
                return Err(BufferError::stopped());
            }
            let Some(index) = state.live_position(key) else {
                return Err(BufferError::NoSuchElement);
            };
            let DiskEntry { id, state: storing, .. } = state.entries[index];

            match storing {
                StoringState::Started => {
                    if let Some(pending) = state.in_flight.iter().find(|pending| pending.id == id) {
                        return Ok(pending.value.clone());
                    }
                    self.changed.wait(&mut state);
                }
                StoringState::Completed => {
                    let path = self.file_path(key);
                    let raw = MutexGuard::unlocked(&mut state, || self.fs.read(&path));
                    match raw {
                        Ok(raw) => return Ok(file::decode(raw)?),
                        // Removed or replaced while unlocked: look again once
                        Err(e) if e.kind() == io::ErrorKind::NotFound && vanished != Some(id) => {
                            vanished = Some(id);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                StoringState::NotStarted | StoringState::Cancelled => {
                    return Err(BufferError::NoSuchElement);
                }
            }
        }
    }

    /// Cancel an in-progress write of `key`, or remove its completed file
    ///
    /// Returns whether a live descriptor was found.
    pub fn cancel_or_remove(&self, key: &K) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(index) = state.live_position(key) else {
            return Ok(false);
        };
        self.retire(&mut state, index)?;
        drop(state);

        self.changed.notify_all();
        Ok(true)
    }

    /// `cancel_or_remove` every live descriptor whose key matches
    pub fn remove_if<F>(&self, mut predicate: F) -> Result<usize>
    where
        F: FnMut(&K) -> bool,
    {
        let mut state = self.state.lock();
        let mut removed = 0;
        let mut index = 0;
        let mut outcome = Ok(());

        while index < state.entries.len() {
            let entry = &state.entries[index];
            if !(entry.is_live() && predicate(&entry.key)) {
                index += 1;
                continue;
            }
            let started = entry.state == StoringState::Started;
            if let Err(e) = self.retire(&mut state, index) {
                outcome = Err(e);
                break;
            }
            removed += 1;
            if started {
                index += 1;
            }
        }
        drop(state);

        if removed > 0 {
            self.changed.notify_all();
        }
        outcome.map(|()| removed)
    }

    /// Key of the earliest-inserted completed descriptor
    pub fn oldest_completed(&self) -> Option<K> {
        let state = self.state.lock();
        state
            .oldest_completed()
            .map(|index| state.entries[index].key.clone())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Cancel (Started) or remove (Completed) the descriptor at `index`
    fn retire(&self, state: &mut DiskState<K>, index: usize) -> Result<()> {
        let storing = state.entries[index].state;
        match storing {
            StoringState::Started => {
                state.entries[index].state = StoringState::Cancelled;
                debug!("cancelled in-progress disk write");
                Ok(())
            }
            StoringState::Completed => self.remove_completed(state, index),
            StoringState::NotStarted | StoringState::Cancelled => Ok(()),
        }
    }

    /// Remove a completed descriptor's file and uncount its bytes
    fn remove_completed(&self, state: &mut DiskState<K>, index: usize) -> Result<()> {
        let path = self.file_path(&state.entries[index].key);
        match self.fs.remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "spill file already gone");
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(entry) = state.entries.remove(index) {
            state.current -= entry.size;
        }
        Ok(())
    }

    /// Pop the oldest completed entry, returning its key and value
    fn pop_oldest(&self, state: &mut DiskState<K>) -> Result<Option<(K, Bytes)>> {
        let Some(index) = state.oldest_completed() else {
            return Ok(None);
        };
        let key = state.entries[index].key.clone();
        let value = file::decode(self.fs.read(&self.file_path(&key))?)?;
        self.remove_completed(state, index)?;
        debug!(bytes = value.len(), "popped oldest completed entry from disk");
        Ok(Some((key, value)))
    }

    fn discard_temp(&self, key: &K, ticket: WriteTicket) {
        let path = self.temp_path(key, ticket);
        if let Err(e) = self.fs.remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove temp file");
            }
        }
    }

    fn temp_path(&self, key: &K, ticket: WriteTicket) -> PathBuf {
        self.directory.join(format!(
            "{}.{}.{}",
            key.file_name(),
            ticket.id,
            TEMP_EXTENSION
        ))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Path of the completed spill file for `key`
    pub fn file_path(&self, key: &K) -> PathBuf {
        self.directory
            .join(format!("{}.{}", key.file_name(), SPILL_EXTENSION))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// State of the live descriptor for `key`, if any
    pub fn state_of(&self, key: &K) -> Option<StoringState> {
        let state = self.state.lock();
        state
            .live_position(key)
            .map(|index| state.entries[index].state)
    }

    /// Number of values currently published in the in-flight map
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Change the quota and wake blocked writers
    pub fn set_max(&self, max_bytes: u64) {
        self.state.lock().max = max_bytes;
        self.changed.notify_all();
    }

    /// Wake blocked writers and readers so they re-check their predicate
    pub fn wake(&self) {
        self.changed.notify_all();
    }

    /// Stop the tier: every current and future wait fails
    pub fn stop(&self) {
        self.state.lock().stopped = true;
        self.changed.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Bytes of completed entries
    pub fn usage(&self) -> u64 {
        self.state.lock().current
    }

    pub fn max(&self) -> u64 {
        self.state.lock().max
    }

    /// Number of live descriptors
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.is_live())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
