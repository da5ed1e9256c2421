//! # Batched Writer
//!
//! This module implements the micro-batching write strategy for the ingress
//! path. A batched writer wraps a single storage partition and coalesces
//! many single-key writes into one atomic batch commit, amortizing the cost
//! of fsync:
//!
//! ```text
//! Without batching:                With batching:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ set1 → commit → fsync    │     │ set1 ┐                   │
//! │ set2 → commit → fsync    │     │ set2 ├─ one batch        │
//! │ set3 → commit → fsync    │     │ set3 ┘                   │
//! │ 100 fsyncs               │     │ commit → 1 fsync         │
//! └──────────────────────────┘     └──────────────────────────┘
//! ```
//!
//! ## Contract
//!
//! Each accepted [`set`](BatchedWriter::set) is paired with a completion
//! callback that is invoked **exactly once**, from the flusher, with the
//! commit outcome. Between `set` returning and the callback firing, the
//! value is in flight, not durable. Within one writer, callbacks fire in
//! submission order.
//!
//! ## Flush Triggers
//!
//! The single flusher task owns the pending batch and commits it when:
//!
//! - the entry-count or byte threshold is reached, or
//! - the flush window (armed on the first write of a new batch) expires, or
//! - an explicit [`flush`](BatchedWriter::flush) or
//!   [`close`](BatchedWriter::close) arrives.
//!
//! Commit errors are not retried here: every callback of the failed batch
//! fires with the same [`Error::Commit`], the batch is discarded, and a
//! fresh one begins. The caller decides whether to surface the failure to
//! the producer (by withholding the acknowledgement) or to the operator
//! (via the write-error hook).
//!
//! The flusher runs on its own OS thread with a small current-thread
//! runtime, so the fsync on the commit path never stalls the ingress
//! workers' executor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fjall::{Keyspace, PartitionHandle, PersistMode};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, trace};

use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Default flush window in milliseconds.
///
/// A batch that has not reached a size threshold is committed this long
/// after its first write. Shorter = lower ack latency, longer = better
/// coalescing.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 15;

/// Default maximum entries per batch.
pub const DEFAULT_MAX_BATCH_ENTRIES: usize = 1000;

/// Default maximum bytes (keys + values) per batch.
pub const DEFAULT_MAX_BATCH_BYTES: usize = 4 * 1024 * 1024;

/// Size of the hand-off channel into the flusher.
const HANDOFF_CHANNEL_SIZE: usize = 64;

/// Stand-in for "wait forever" while the pending batch is empty.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Configuration for a [`BatchedWriter`].
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum time between the first unflushed write and its commit.
    pub flush_interval: Duration,

    /// Commit once this many writes have accumulated.
    pub max_batch_entries: usize,

    /// Commit once the accumulated keys + values reach this many bytes.
    /// A single write larger than this is rejected with
    /// [`Error::Oversized`].
    pub max_batch_bytes: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            max_batch_entries: DEFAULT_MAX_BATCH_ENTRIES,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
        }
    }
}

// =============================================================================
// Request Types
// =============================================================================

/// Completion callback paired with each write.
///
/// Invoked exactly once with `Ok(())` after the batch containing the write
/// has been durably committed, or with [`Error::Commit`] if it failed.
pub type CommitCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

enum WriterRequest {
    Write {
        key: Vec<u8>,
        value: Vec<u8>,
        callback: CommitCallback,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
    Shutdown,
}

struct PendingWrite {
    key: Vec<u8>,
    value: Vec<u8>,
    callback: CommitCallback,
}

// =============================================================================
// Batched Writer
// =============================================================================

/// A single-flusher transactor that coalesces writes into batch commits.
///
/// Each ingress worker owns its own writer; workers never share a batch.
pub struct BatchedWriter {
    tx: mpsc::Sender<WriterRequest>,
    closed: AtomicBool,
    done_rx: watch::Receiver<bool>,
    committed_batches: Arc<AtomicU64>,
    max_batch_bytes: usize,
}

impl BatchedWriter {
    /// Spawns the flusher and returns the writer handle.
    pub fn new(
        keyspace: Keyspace,
        partition: PartitionHandle,
        config: WriterConfig,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(HANDOFF_CHANNEL_SIZE);
        let (done_tx, done_rx) = watch::channel(false);
        let committed_batches = Arc::new(AtomicU64::new(0));
        let max_batch_bytes = config.max_batch_bytes;

        let flusher = Flusher {
            keyspace,
            partition,
            config,
            committed_batches: Arc::clone(&committed_batches),
        };

        std::thread::Builder::new()
            .name("requeue-batched-writer".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        error!(%err, "failed to build the flusher runtime");
                        let _ = done_tx.send(true);
                        return;
                    }
                };
                rt.block_on(run_flusher(flusher, rx));
                let _ = done_tx.send(true);
            })?;

        Ok(Self {
            tx,
            closed: AtomicBool::new(false),
            done_rx,
            committed_batches,
            max_batch_bytes,
        })
    }

    /// Enqueues a write.
    ///
    /// Fails with [`Error::Closed`] after [`close`](Self::close) and with
    /// [`Error::Oversized`] when the single entry exceeds the batch byte
    /// capacity. On `Ok(())`, the callback is guaranteed to eventually
    /// fire; until it does, the value is in flight, not durable.
    pub async fn set(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        callback: CommitCallback,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let size = key.len() + value.len();
        if size > self.max_batch_bytes {
            return Err(Error::Oversized {
                size,
                max: self.max_batch_bytes,
            });
        }

        self.tx
            .send(WriterRequest::Write {
                key,
                value,
                callback,
            })
            .await
            .map_err(|_| Error::Closed)
    }

    /// Forces a commit of any buffered writes. Returns after every callback
    /// accumulated so far has fired.
    pub async fn flush(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriterRequest::Flush { done: done_tx })
            .await
            .map_err(|_| Error::Closed)?;
        done_rx.await.map_err(|_| Error::Closed)
    }

    /// Closes the writer: stops intake, flushes the pending batch, and
    /// waits until all callbacks have fired. Idempotent and safe to call
    /// concurrently; every caller returns only once the flusher has
    /// finished.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // First closer delivers the shutdown request. Writes racing
            // past the closed check are drained by the flusher before it
            // exits, so their callbacks still fire.
            let _ = self.tx.send(WriterRequest::Shutdown).await;
        }
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Number of batch commits performed so far.
    pub fn committed_batches(&self) -> u64 {
        self.committed_batches.load(Ordering::Acquire)
    }
}

// =============================================================================
// Flusher
// =============================================================================

struct Flusher {
    keyspace: Keyspace,
    partition: PartitionHandle,
    config: WriterConfig,
    committed_batches: Arc<AtomicU64>,
}

async fn run_flusher(flusher: Flusher, mut rx: mpsc::Receiver<WriterRequest>) {
    let mut pending: Vec<PendingWrite> = Vec::new();
    let mut pending_bytes = 0usize;
    let mut batch_start: Option<Instant> = None;

    loop {
        let wait = if pending.is_empty() {
            IDLE_WAIT
        } else {
            // Remaining time in the flush window armed by the first write.
            let elapsed = batch_start.map(|s| s.elapsed()).unwrap_or_default();
            flusher.config.flush_interval.saturating_sub(elapsed)
        };

        match timeout(wait, rx.recv()).await {
            Ok(Some(WriterRequest::Write {
                key,
                value,
                callback,
            })) => {
                if pending.is_empty() {
                    batch_start = Some(Instant::now());
                }
                pending_bytes += key.len() + value.len();
                pending.push(PendingWrite {
                    key,
                    value,
                    callback,
                });

                if pending.len() >= flusher.config.max_batch_entries
                    || pending_bytes >= flusher.config.max_batch_bytes
                {
                    flusher.commit(std::mem::take(&mut pending));
                    pending_bytes = 0;
                    batch_start = None;
                }
            }
            Ok(Some(WriterRequest::Flush { done })) => {
                flusher.commit(std::mem::take(&mut pending));
                pending_bytes = 0;
                batch_start = None;
                let _ = done.send(());
            }
            Ok(Some(WriterRequest::Shutdown)) => {
                // Stop intake but drain writes already handed off, so every
                // accepted set still gets its callback.
                rx.close();
            }
            Ok(None) => {
                flusher.commit(std::mem::take(&mut pending));
                break;
            }
            Err(_) => {
                // Flush window expired with a partial batch.
                flusher.commit(std::mem::take(&mut pending));
                pending_bytes = 0;
                batch_start = None;
            }
        }
    }

    debug!("batched writer flusher stopped");
}

impl Flusher {
    /// Commits one batch and fires its callbacks in submission order.
    fn commit(&self, writes: Vec<PendingWrite>) {
        if writes.is_empty() {
            return;
        }

        let count = writes.len();
        let mut batch = self.keyspace.batch();
        let mut callbacks = Vec::with_capacity(count);
        for write in writes {
            batch.insert(&self.partition, write.key, write.value);
            callbacks.push(write.callback);
        }

        let outcome = batch
            .commit()
            .and_then(|()| self.keyspace.persist(PersistMode::SyncAll));

        match outcome {
            Ok(()) => {
                self.committed_batches.fetch_add(1, Ordering::AcqRel);
                trace!(entries = count, "committed batch");
                for callback in callbacks {
                    callback(Ok(()));
                }
            }
            Err(err) => {
                // The failed batch is discarded, never retried; every
                // caller learns the same outcome.
                error!(%err, entries = count, "batch commit failed");
                let reason = err.to_string();
                for callback in callbacks {
                    callback(Err(Error::Commit(reason.clone())));
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
