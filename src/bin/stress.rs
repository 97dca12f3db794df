//! DataBuffer Stress Binary
//!
//! Hammers a buffer with concurrent store/get/delete traffic and reports
//! what happened.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;
use databuffer::{BufferError, Config, DataBuffer, EvictionPolicy};
use tracing_subscriber::{fmt, EnvFilter};

/// DataBuffer stress tool
#[derive(Parser, Debug)]
#[command(name = "databuffer-stress")]
#[command(about = "Concurrent load generator for the tiered data buffer")]
#[command(version)]
struct Args {
    /// Backing directory (a temporary one is created if omitted)
    #[arg(short, long)]
    dir: Option<String>,

    /// Memory quota in KB
    #[arg(short, long, default_value = "256")]
    memory_kb: u64,

    /// Disk quota in KB
    #[arg(short = 'D', long, default_value = "4096")]
    disk_kb: u64,

    /// Number of worker threads
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Operations per worker thread
    #[arg(short, long, default_value = "10000")]
    ops: u64,

    /// Distinct keys per worker thread
    #[arg(short, long, default_value = "256")]
    keys: u64,

    /// Value size in bytes
    #[arg(short, long, default_value = "1024")]
    value_size: usize,

    /// Pop the oldest disk entries instead of waiting for deletes
    #[arg(long)]
    pop: bool,
}

#[derive(Default)]
struct Counters {
    stores: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    deletes: AtomicU64,
    pops: AtomicU64,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,databuffer=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("DataBuffer stress v{}", databuffer::VERSION);
    tracing::info!(
        "Quotas: memory={} KB disk={} KB, {} threads x {} ops",
        args.memory_kb,
        args.disk_kb,
        args.threads,
        args.ops
    );

    let mut builder = Config::builder()
        .max_memory_usage(args.memory_kb * 1024)
        .max_disk_usage(args.disk_kb * 1024);
    if let Some(dir) = &args.dir {
        builder = builder.disk_directory(dir);
    }
    let config = builder.build();

    let counters = Arc::new(Counters::default());
    let policy = if args.pop {
        let counters = Arc::clone(&counters);
        EvictionPolicy::callback(move |_key: u64, _value| {
            counters.pops.fetch_add(1, Ordering::Relaxed);
        })
    } else {
        EvictionPolicy::CooperativeWait
    };

    let buffer = match DataBuffer::with_policy(config, policy) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            tracing::error!("Failed to open buffer: {}", e);
            std::process::exit(1);
        }
    };

    let started = Instant::now();
    let workers: Vec<_> = (0..args.threads as u64)
        .map(|worker| {
            let buffer = Arc::clone(&buffer);
            let counters = Arc::clone(&counters);
            let (ops, keys, value_size) = (args.ops, args.keys, args.value_size);
            thread::spawn(move || run_worker(&buffer, &counters, worker, ops, keys, value_size))
        })
        .collect();

    let mut failed = false;
    for worker in workers {
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("Worker failed: {}", e);
                failed = true;
            }
            Err(_) => {
                tracing::error!("Worker panicked");
                failed = true;
            }
        }
    }
    let elapsed = started.elapsed();

    let stats = buffer.stats();
    tracing::info!(
        "Done in {:.2?}: stores={} hits={} misses={} deletes={} pops={}",
        elapsed,
        counters.stores.load(Ordering::Relaxed),
        counters.hits.load(Ordering::Relaxed),
        counters.misses.load(Ordering::Relaxed),
        counters.deletes.load(Ordering::Relaxed),
        counters.pops.load(Ordering::Relaxed)
    );
    tracing::info!("Final usage: {:?}", stats);

    let buffer = match Arc::try_unwrap(buffer) {
        Ok(b) => b,
        Err(_) => {
            tracing::error!("Buffer still shared at exit");
            std::process::exit(1);
        }
    };
    if let Err(e) = buffer.close() {
        tracing::error!("Close failed: {}", e);
        failed = true;
    }

    if failed {
        std::process::exit(1);
    }
}

/// Store, read back and periodically delete keys owned by this worker
///
/// Keys are partitioned per worker so deletes never race another
/// worker's stores.
fn run_worker(
    buffer: &DataBuffer<u64>,
    counters: &Counters,
    worker: u64,
    ops: u64,
    keys: u64,
    value_size: usize,
) -> databuffer::Result<()> {
    for op in 0..ops {
        let key = worker * keys + op % keys;
        let fill = (key % 251) as u8 + 1;

        match op % 4 {
            0 | 1 => {
                buffer.store(key, vec![fill; value_size])?;
                counters.stores.fetch_add(1, Ordering::Relaxed);
            }
            2 => match buffer.get(&key) {
                Ok(value) => {
                    if value.iter().any(|&b| b != fill) {
                        return Err(BufferError::InvalidArgument(format!(
                            "corrupt value for key {}",
                            key
                        )));
                    }
                    counters.hits.fetch_add(1, Ordering::Relaxed);
                }
                Err(BufferError::NoSuchElement) => {
                    counters.misses.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            },
            _ => match buffer.delete(&key) {
                Ok(()) => {
                    counters.deletes.fetch_add(1, Ordering::Relaxed);
                }
                Err(BufferError::NoSuchElement) => {}
                Err(e) => return Err(e),
            },
        }
    }
    Ok(())
}
