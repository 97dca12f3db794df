//! DataBuffer Module
//!
//! The façade that owns both tiers, the mover thread and the backing
//! directory.
//!
//! ## Responsibilities
//! - Admit values to memory, or straight to disk when too large
//! - Serve reads from memory first, then disk
//! - Delete from both tiers, cancelling in-flight writes
//! - Enforce `max_memory_usage <= max_disk_usage` on every resize
//! - Surface mover failures and tear everything down on close

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{check_limits, Config};
use crate::disk::{DiskTier, EvictionPolicy};
use crate::error::{BufferError, Result};
use crate::fs::{FileSystem, LocalFileSystem};
use crate::key::BufferKey;
use crate::memory::{Admission, MemoryTier, StoringState};
use crate::mover::Mover;

const PROBE_FILENAME: &str = ".databuffer-probe";
const PROBE_CONTENTS: &[u8] = b"probe";
const TEMP_PREFIX: &str = "databuffer-";

/// The two tiers plus the mover's failure slot, shared with the mover
pub(crate) struct Tiers<K> {
    pub memory: Arc<MemoryTier<K>>,
    pub disk: DiskTier<K>,
    failure: Mutex<Option<BufferError>>,
}

impl<K: BufferKey> Tiers<K> {
    /// Stop both tiers, waking every waiter
    pub fn halt(&self) {
        self.memory.stop();
        self.disk.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.memory.is_stopped() || self.disk.is_stopped()
    }

    /// Record a fatal error and stop
    pub fn fail(&self, e: BufferError) {
        error!(error = %e, "data buffer stopped on fatal error");
        self.failure.lock().get_or_insert(e);
        self.halt();
    }

    pub fn take_failure(&self) -> Option<BufferError> {
        self.failure.lock().take()
    }
}

/// Point-in-time usage figures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub memory_usage: u64,
    pub max_memory_usage: u64,
    pub memory_entries: usize,
    pub disk_usage: u64,
    pub max_disk_usage: u64,
    pub disk_entries: usize,
}

/// Bounded, tiered key/value buffer
///
/// ## Concurrency Model
///
/// - Any number of caller threads plus one mover thread
/// - Each tier has its own Mutex/Condvar; no blocking wait ever holds
///   both locks
/// - `limits` serializes the two resize operations so the cross-tier
///   invariant is checked and applied atomically
///
/// ## Failure Model
///
/// A fatal error (value above the disk quota, unexpected filesystem
/// failure) stops the buffer permanently. The first call afterwards
/// re-raises the mover's error; later calls fail with `FilesystemIo`.
pub struct DataBuffer<K: BufferKey> {
    tiers: Arc<Tiers<K>>,
    mover: Mover,
    fs: Arc<dyn FileSystem>,
    limits: Mutex<()>,
    owns_directory: bool,
    closed: bool,
}

impl<K: BufferKey> DataBuffer<K> {
    /// Open a buffer that waits for deletes when the disk is full
    pub fn open(config: Config) -> Result<Self> {
        Self::with_policy(config, EvictionPolicy::CooperativeWait)
    }

    /// Open a buffer with an explicit disk eviction policy
    pub fn with_policy(config: Config, policy: EvictionPolicy<K>) -> Result<Self> {
        Self::with_file_system(config, policy, Arc::new(LocalFileSystem))
    }

    /// Open a buffer over a custom filesystem
    ///
    /// On startup:
    /// 1. Validate quotas
    /// 2. Resolve (or generate) the backing directory
    /// 3. Create it and run a write/remove self-test
    /// 4. Start the mover thread
    pub fn with_file_system(
        config: Config,
        policy: EvictionPolicy<K>,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Self> {
        // Step 1: Quotas
        config.validate()?;

        // Step 2: Directory
        let (directory, generated) = match &config.disk_directory {
            Some(path) => (path.clone(), false),
            None => (generate_directory()?, true),
        };
        let owns_directory = config.owns_directory.unwrap_or(generated);

        // Step 3: Self-test
        prepare_directory(fs.as_ref(), &directory)?;

        // Step 4: Tiers and mover
        let memory = Arc::new(MemoryTier::new(config.max_memory_usage));
        let policy = match policy {
            EvictionPolicy::CooperativeWait => EvictionPolicy::CooperativeWait,
            EvictionPolicy::Callback(pop) => {
                // A popped value leaves the buffer entirely
                let memory = Arc::clone(&memory);
                EvictionPolicy::callback(move |key: K, value| {
                    memory.remove_flushed(&key);
                    pop(key, value);
                })
            }
        };
        let disk = DiskTier::new(
            directory.clone(),
            config.max_disk_usage,
            Arc::clone(&fs),
            policy,
        );
        let tiers = Arc::new(Tiers {
            memory,
            disk,
            failure: Mutex::new(None),
        });
        let mover = Mover::spawn(Arc::clone(&tiers))
            .map_err(|e| BufferError::Uninitialised(format!("cannot start mover: {}", e)))?;

        info!(
            directory = %directory.display(),
            max_memory_usage = config.max_memory_usage,
            max_disk_usage = config.max_disk_usage,
            owns_directory,
            "data buffer opened"
        );

        Ok(Self {
            tiers,
            mover,
            fs,
            limits: Mutex::new(()),
            owns_directory,
            closed: false,
        })
    }

    // =========================================================================
    // Public Operations
    // =========================================================================

    /// Store a value, replacing any previous value for the key
    ///
    /// Values that fit the memory quota return as soon as they are
    /// admitted to memory (possibly after waiting for a flushed entry to
    /// evict). Larger values are written to disk before returning.
    pub fn store(&self, key: K, value: impl Into<Bytes>) -> Result<()> {
        self.ensure_running()?;

        let value = value.into();
        if value.is_empty() {
            return Err(BufferError::InvalidArgument(
                "values must not be empty".to_string(),
            ));
        }

        match self.delete(&key) {
            Ok(()) | Err(BufferError::NoSuchElement) => {}
            Err(e) => return Err(e),
        }

        if value.len() as u64 <= self.tiers.memory.max() {
            let admission = self
                .tiers
                .memory
                .insert(key.clone(), value.clone())
                .map_err(|e| self.surface(e))?;

            if let Admission::Admitted { seq, replaced } = admission {
                // A concurrent store of the same key was admitted while we
                // waited; its disk copy must go with it
                let cleanup = match replaced {
                    Some(state) if state != StoringState::NotStarted => {
                        self.tiers.disk.cancel_or_remove(&key).map(|_| ())
                    }
                    _ => Ok(()),
                };
                debug!(seq, bytes = value.len(), "admitted value to memory");
                self.mover.notify(seq);
                return cleanup.map_err(|e| self.surface(e));
            }
        }

        self.store_on_disk(&key, &value)
    }

    /// Get a value by key
    ///
    /// Search order:
    /// 1. Memory tier
    /// 2. Disk tier (waiting out an in-progress write if needed)
    pub fn get(&self, key: &K) -> Result<Bytes> {
        self.ensure_running()?;

        if let Some(value) = self.tiers.memory.find(key) {
            return Ok(value);
        }
        self.tiers.disk.get(key).map_err(|e| self.surface(e))
    }

    /// Delete a key from both tiers
    ///
    /// An in-progress disk write of the key is cancelled rather than
    /// waited for. Fails with `NoSuchElement` if neither tier has the key.
    pub fn delete(&self, key: &K) -> Result<()> {
        self.ensure_running()?;

        let in_memory = self.tiers.memory.remove(key);
        let on_disk = self
            .tiers
            .disk
            .cancel_or_remove(key)
            .map_err(|e| self.surface(e))?;

        if in_memory.is_none() && !on_disk {
            return Err(BufferError::NoSuchElement);
        }
        Ok(())
    }

    /// Delete every key matching `predicate` from both tiers
    ///
    /// Same per-key semantics as `delete` (files removed, in-progress
    /// writes cancelled); matching nothing is not an error.
    pub fn delete_if<F>(&self, predicate: F) -> Result<()>
    where
        F: Fn(&K) -> bool,
    {
        self.ensure_running()?;

        let in_memory = self.tiers.memory.remove_if(&predicate);
        let on_disk = self
            .tiers
            .disk
            .remove_if(&predicate)
            .map_err(|e| self.surface(e))?;

        debug!(in_memory, on_disk, "bulk delete");
        Ok(())
    }

    /// Change the memory quota (must stay <= the disk quota)
    pub fn set_max_memory_usage(&self, bytes: u64) -> Result<()> {
        self.ensure_running()?;

        let _guard = self.limits.lock();
        check_limits(bytes, self.tiers.disk.max())?;
        self.tiers.memory.set_max(bytes);
        self.tiers.disk.wake();
        Ok(())
    }

    /// Change the disk quota (must stay >= the memory quota)
    pub fn set_max_disk_usage(&self, bytes: u64) -> Result<()> {
        self.ensure_running()?;

        let _guard = self.limits.lock();
        check_limits(self.tiers.memory.max(), bytes)?;
        self.tiers.disk.set_max(bytes);
        self.tiers.memory.wake();
        Ok(())
    }

    /// Shut down: stop both tiers, join the mover, remove the directory
    /// if owned. Returns the mover's error if it failed unreported.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    /// Write protocol for values larger than the memory quota
    fn store_on_disk(&self, key: &K, value: &Bytes) -> Result<()> {
        let disk = &self.tiers.disk;
        let outcome = disk
            .begin_write(key)
            .and_then(|ticket| disk.write_value(ticket, key, value));

        match outcome {
            Ok(true) => {
                debug!(bytes = value.len(), "stored value directly on disk");
                Ok(())
            }
            // Deleted or superseded while waiting
            Ok(false) => Ok(()),
            Err(e) if self.tiers.is_stopped() => Err(self.surface(e)),
            Err(e) => {
                error!(error = %e, "direct disk store failed, stopping data buffer");
                self.tiers.halt();
                Err(e)
            }
        }
    }

    /// Fail fast once the buffer has stopped
    fn ensure_running(&self) -> Result<()> {
        if self.tiers.is_stopped() {
            return Err(self.tiers.take_failure().unwrap_or_else(BufferError::stopped));
        }
        Ok(())
    }

    /// Prefer the mover's recorded failure over a generic stop error
    fn surface(&self, e: BufferError) -> BufferError {
        if matches!(e, BufferError::NoSuchElement) || !self.tiers.is_stopped() {
            return e;
        }
        self.tiers.take_failure().unwrap_or(e)
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.tiers.halt();
        let joined = self.mover.join();
        let failure = self.tiers.take_failure();

        let directory = self.tiers.disk.directory();
        let removed = if self.owns_directory {
            match self.fs.remove_dir_all(directory) {
                Ok(()) => {
                    info!(directory = %directory.display(), "removed data buffer directory");
                    Ok(())
                }
                Err(e) => Err(BufferError::from(e)),
            }
        } else {
            Ok(())
        };

        match failure {
            Some(e) => Err(e),
            None => joined.and(removed),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// False once the buffer has stopped (closed or failed)
    pub fn is_running(&self) -> bool {
        !self.tiers.is_stopped()
    }

    /// Backing directory of the disk tier
    pub fn disk_directory(&self) -> &Path {
        self.tiers.disk.directory()
    }

    /// Path of the spill file for `key` (whether or not it exists)
    pub fn spill_path(&self, key: &K) -> PathBuf {
        self.tiers.disk.file_path(key)
    }

    pub fn memory_usage(&self) -> u64 {
        self.tiers.memory.usage()
    }

    pub fn disk_usage(&self) -> u64 {
        self.tiers.disk.usage()
    }

    pub fn max_memory_usage(&self) -> u64 {
        self.tiers.memory.max()
    }

    pub fn max_disk_usage(&self) -> u64 {
        self.tiers.disk.max()
    }

    /// Usage snapshot (each figure is read under its own tier's lock)
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            memory_usage: self.tiers.memory.usage(),
            max_memory_usage: self.tiers.memory.max(),
            memory_entries: self.tiers.memory.len(),
            disk_usage: self.tiers.disk.usage(),
            max_disk_usage: self.tiers.disk.max(),
            disk_entries: self.tiers.disk.len(),
        }
    }

    /// Disk progress of `key`'s memory copy, if resident in memory
    pub fn memory_state(&self, key: &K) -> Option<StoringState> {
        self.tiers.memory.state_of(key)
    }

    /// State of `key`'s disk descriptor, if any
    pub fn disk_state(&self, key: &K) -> Option<StoringState> {
        self.tiers.disk.state_of(key)
    }
}

impl<K: BufferKey> Drop for DataBuffer<K> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "error while shutting down data buffer");
        }
    }
}

/// Create a uniquely named temporary directory
fn generate_directory() -> Result<PathBuf> {
    tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempdir()
        .map(|dir| dir.keep())
        .map_err(|e| BufferError::Uninitialised(format!("cannot create temp directory: {}", e)))
}

/// Create the directory and check it is writable
fn prepare_directory(fs: &dyn FileSystem, directory: &Path) -> Result<()> {
    let uninitialised = |what: &str, e: std::io::Error| {
        BufferError::Uninitialised(format!("{} {}: {}", what, directory.display(), e))
    };

    if !fs.exists(directory) {
        fs.create_dir_all(directory)
            .map_err(|e| uninitialised("cannot create", e))?;
    }

    let probe = directory.join(PROBE_FILENAME);
    fs.write(&probe, PROBE_CONTENTS)
        .map_err(|e| uninitialised("cannot write to", e))?;
    let size = fs
        .file_size(&probe)
        .map_err(|e| uninitialised("cannot stat probe in", e))?;
    fs.remove_file(&probe)
        .map_err(|e| uninitialised("cannot remove probe from", e))?;

    if size != PROBE_CONTENTS.len() as u64 {
        return Err(BufferError::Uninitialised(format!(
            "short probe write in {}",
            directory.display()
        )));
    }
    Ok(())
}
