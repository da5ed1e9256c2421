//! # Closer Primitive
//!
//! A small reusable stop-signal for groups of background tasks. It replaces
//! ad-hoc combinations of join handles and done channels with one object:
//!
//! - a count of running tasks (`add_running` / `done`),
//! - a one-shot broadcast signal the tasks observe (`signal` /
//!   `has_been_closed`),
//! - and a wait that resolves once the count returns to zero (`wait`).
//!
//! The connection supervisor composes its phased shutdown out of these:
//! each phase is a `Closer`, and `signal_and_wait` on one phase must return
//! before the next phase is signaled.
//!
//! ```text
//! supervisor                         worker i
//! ──────────                         ────────
//! closer.add_running(n)
//! spawn n workers ────────────────▶  loop {
//!                                      select! {
//!                                        msg  = rx.recv()   => work,
//! closer.signal() ─────────────────▶     _ = closer.has_been_closed() => break,
//!                                      }
//!                                    }
//! closer.wait().await ◀──────────────closer.done()
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};

// =============================================================================
// Closer
// =============================================================================

/// A countdown-and-signal handle, cheap to clone and share across tasks.
#[derive(Clone)]
pub struct Closer {
    inner: Arc<Inner>,
}

struct Inner {
    running: AtomicUsize,
    signal_tx: watch::Sender<bool>,
    signal_rx: watch::Receiver<bool>,
    idle: Notify,
}

impl Closer {
    /// Creates a closer tracking `initial` already-running tasks.
    pub fn new(initial: usize) -> Self {
        let (signal_tx, signal_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                running: AtomicUsize::new(initial),
                signal_tx,
                signal_rx,
                idle: Notify::new(),
            }),
        }
    }

    /// Registers `n` additional running tasks.
    pub fn add_running(&self, n: usize) {
        self.inner.running.fetch_add(n, Ordering::AcqRel);
    }

    /// Marks one task as finished. Every task registered through
    /// [`add_running`](Self::add_running) must call this exactly once.
    pub fn done(&self) {
        let previous = self.inner.running.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous >= 1, "done() without a matching add_running()");
        if previous == 1 {
            self.inner.idle.notify_waiters();
        }
    }

    /// Fires the one-shot stop signal. Idempotent.
    pub fn signal(&self) {
        let _ = self.inner.signal_tx.send(true);
    }

    /// Whether the stop signal has fired.
    pub fn is_signaled(&self) -> bool {
        *self.inner.signal_rx.borrow()
    }

    /// Resolves once the stop signal has fired. Tasks typically poll this
    /// inside a `select!` alongside their work source.
    pub async fn has_been_closed(&self) {
        let mut rx = self.inner.signal_rx.clone();
        // The sender lives inside Inner, so the channel cannot close early.
        let _ = rx.wait_for(|signaled| *signaled).await;
    }

    /// Resolves once the running count reaches zero.
    pub async fn wait(&self) {
        loop {
            // Register interest before checking, so a concurrent done()
            // between the check and the await cannot be missed.
            let idle = self.inner.idle.notified();
            if self.inner.running.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Fires the stop signal, then waits for all running tasks to finish.
    pub async fn signal_and_wait(&self) {
        self.signal();
        self.wait().await;
    }
}

impl std::fmt::Debug for Closer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Closer")
            .field("running", &self.inner.running.load(Ordering::Acquire))
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
