//! Configuration for DataBuffer
//!
//! Quotas and backing directory settings, built with a builder.

use std::path::PathBuf;

use crate::error::{BufferError, Result};

/// Main configuration for a DataBuffer instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Quotas
    // -------------------------------------------------------------------------
    /// Max bytes held in the memory tier
    pub max_memory_usage: u64,

    /// Max bytes held in the disk tier (must be >= max_memory_usage)
    pub max_disk_usage: u64,

    // -------------------------------------------------------------------------
    // Backing Directory
    // -------------------------------------------------------------------------
    /// Directory for spill files. When `None`, a uniquely named temporary
    /// directory is created.
    pub disk_directory: Option<PathBuf>,

    /// Remove the directory tree on shutdown.
    /// When `None`: true iff the directory was auto-generated.
    pub owns_directory: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_memory_usage: 64 * 1024 * 1024, // 64 MB
            max_disk_usage: 1024 * 1024 * 1024, // 1 GB
            disk_directory: None,
            owns_directory: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the cross-tier invariant `max_memory_usage <= max_disk_usage`
    pub fn validate(&self) -> Result<()> {
        check_limits(self.max_memory_usage, self.max_disk_usage)
    }
}

/// Shared by construction and both resize paths
pub(crate) fn check_limits(max_memory_usage: u64, max_disk_usage: u64) -> Result<()> {
    if max_memory_usage > max_disk_usage {
        return Err(BufferError::InvalidArgument(format!(
            "max memory usage ({}) must be <= max disk usage ({})",
            max_memory_usage, max_disk_usage
        )));
    }
    Ok(())
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the memory quota (in bytes)
    pub fn max_memory_usage(mut self, bytes: u64) -> Self {
        self.config.max_memory_usage = bytes;
        self
    }

    /// Set the disk quota (in bytes)
    pub fn max_disk_usage(mut self, bytes: u64) -> Self {
        self.config.max_disk_usage = bytes;
        self
    }

    /// Use an explicit backing directory
    pub fn disk_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.disk_directory = Some(path.into());
        self
    }

    /// Override whether the directory is removed on shutdown
    pub fn owns_directory(mut self, owns: bool) -> Self {
        self.config.owns_directory = Some(owns);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
