//! # DataBuffer
//!
//! A bounded, tiered key/value buffer with:
//! - A memory tier holding recent values up to a byte quota
//! - A disk tier that values spill to in the background
//! - Reads that never see stale or partial data, wherever the value is
//! - Cancellation of in-flight disk writes on delete
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        DataBuffer                            │
//! │            store / get / delete / delete_if / resize         │
//! └─────────────┬─────────────────────────────────┬─────────────┘
//!               │ fits in memory                  │ too large
//!               ▼                                 │
//!        ┌─────────────┐   Flush(seq)      ┌──────┴──────┐
//!        │ MemoryTier  │ ────────────────► │    Mover    │
//!        │(Mutex+Cvar) │ ◄──── Completed ─ │  (thread)   │
//!        └─────────────┘                   └──────┬──────┘
//!                                                 │ write protocol
//!                                                 ▼
//!                                          ┌─────────────┐
//!                                          │  DiskTier   │
//!                                          │(Mutex+Cvar) │
//!                                          └──────┬──────┘
//!                                                 ▼
//!                                           spill files
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use databuffer::{Config, DataBuffer};
//!
//! let config = Config::builder()
//!     .max_memory_usage(1024)
//!     .max_disk_usage(1024 * 1024)
//!     .build();
//! let buffer: DataBuffer<String> = DataBuffer::open(config)?;
//!
//! buffer.store("greeting".to_string(), &b"hello"[..])?;
//! assert_eq!(&buffer.get(&"greeting".to_string())?[..], b"hello");
//! # Ok::<(), databuffer::BufferError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod key;
pub mod fs;
pub mod memory;
pub mod disk;
mod mover;
pub mod buffer;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{BufferError, Result};
pub use config::Config;
pub use key::{BufferKey, FileName};
pub use fs::{FileSystem, LocalFileSystem};
pub use memory::StoringState;
pub use disk::{EvictionPolicy, PopFunctor};
pub use buffer::{BufferStats, DataBuffer};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of DataBuffer
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
