//! Background Mover
//!
//! One dedicated thread that drains memory entries into the disk tier.
//!
//! Every admission to the memory tier queues a `Flush(seq)` message. The
//! mover claims the entry (`NotStarted -> Started`), runs the disk write
//! protocol without holding the memory lock, then marks the entry
//! `Completed` so it becomes evictable.
//!
//! A failure stops both tiers and is recorded for the next public call
//! to re-raise. The thread is joined when the buffer shuts down.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::debug;

use crate::buffer::Tiers;
use crate::error::{BufferError, Result};
use crate::key::BufferKey;

const THREAD_NAME: &str = "databuffer-mover";

/// Messages consumed by the mover thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MoverMessage {
    /// A memory entry was admitted under this sequence number
    Flush(u64),

    /// Exit the loop
    Shutdown,
}

/// Handle to the running mover thread
pub(crate) struct Mover {
    sender: Sender<MoverMessage>,
    handle: Option<JoinHandle<()>>,
}

impl Mover {
    /// Start the mover thread over the given tiers
    pub fn spawn<K: BufferKey>(tiers: Arc<Tiers<K>>) -> io::Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run(&tiers, receiver))?;

        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Queue a newly admitted memory entry for flushing
    pub fn notify(&self, seq: u64) {
        // A closed channel means the mover already exited; the entry stays
        // in memory and the next public call reports the stop.
        let _ = self.sender.send(MoverMessage::Flush(seq));
    }

    /// Ask the thread to exit and wait for it
    pub fn join(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let _ = self.sender.send(MoverMessage::Shutdown);
        handle.join().map_err(|_| {
            BufferError::FilesystemIo(io::Error::new(
                io::ErrorKind::Other,
                "background mover panicked",
            ))
        })
    }
}

fn run<K: BufferKey>(tiers: &Tiers<K>, receiver: Receiver<MoverMessage>) {
    debug!("mover started");

    for message in receiver.iter() {
        let MoverMessage::Flush(seq) = message else {
            break;
        };
        if let Err(e) = flush(tiers, seq) {
            if tiers.is_stopped() {
                // Shutdown (or a fatal error elsewhere) unblocked us
                break;
            }
            tiers.fail(e);
            break;
        }
    }

    debug!("mover stopped");
}

/// Copy one memory entry to disk
fn flush<K: BufferKey>(tiers: &Tiers<K>, seq: u64) -> Result<()> {
    // Gone already (deleted) or claimed by an earlier message
    let Some((key, value, ticket)) = tiers
        .memory
        .claim(seq, |key| tiers.disk.begin_write(key))
    else {
        return Ok(());
    };

    if tiers.disk.write_value(ticket?, &key, &value)? {
        tiers.memory.mark_completed(seq);
        debug!(seq, bytes = value.len(), "flushed entry to disk");
    } else if tiers.memory.remove_seq(seq) {
        // The disk copy was superseded by a newer direct store of the key
        debug!(seq, "dropped superseded memory entry");
    }
    Ok(())
}
