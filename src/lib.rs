//! # Requeue - Durable Message Requeue Service
//!
//! Requeue sits between a NATS pub/sub bus and an embedded ordered
//! key-value store. Producers publish messages on subjects matching a
//! configured wildcard; the service persists each message with its delay
//! and retry policy, and a replay component later re-emits it onto its
//! original subject. The design target is low end-to-end overhead at high
//! ingest rates while guaranteeing that **every acknowledged message has
//! been committed to durable storage**.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          NATS                                   │
//! │        subject "requeue.>"  /  queue group "requeue-workers"    │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ subscription forwarder
//!                               ▼
//!                 ┌───────────────────────────┐
//!                 │  dispatch channel          │   rendezvous: a slow
//!                 │  (unbuffered, MPMC)        │   pool slows the bus
//!                 └─────┬───────┬───────┬─────┘
//!                       ▼       ▼       ▼
//!                 ┌─────────┐ ┌─────────┐ ...  N ingress workers
//!                 │ worker 0│ │ worker 1│
//!                 │ writer 0│ │ writer 1│      one batched writer each
//!                 └────┬────┘ └────┬────┘
//!                      │ batch     │ batch
//!                      ▼ commit    ▼ commit
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 fjall keyspace ("queues" partition)             │
//! │     _q._m.<queue>.<sortable id>  →  envelope bytes              │
//! │     _q._s.<queue>.<property>     →  per-queue state             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each commit fires, per message, a completion callback that publishes an
//! empty reply on the bus: the producer's acknowledgement. No commit, no
//! ack; the absent reply is the producer-visible failure signal.
//!
//! ## Core Invariants
//!
//! 1. **Ack after commit**: a producer sees its acknowledgement only after
//!    the message's batch has been durably committed.
//! 2. **Ordered callbacks**: within one batched writer, callbacks fire in
//!    submission order.
//! 3. **Ordered shutdown**: drain the bus, then stop the workers (flushing
//!    their writers), then close storage. Nothing accepted is lost.
//! 4. **Exclusive data path**: one instance per storage directory, enforced
//!    by an advisory directory lock for the whole lifetime.
//!
//! ## Module Organization
//!
//! - [`error`]: the crate-wide error enum and `Result` alias
//! - [`message`]: the requeue envelope codec (zero-copy views, in-place
//!   retry mutation)
//! - [`id`]: fixed-width sortable message identifiers
//! - [`key`]: the hierarchical queue key scheme and range helpers
//! - [`closer`]: the countdown-and-signal shutdown primitive
//! - [`writer`]: the micro-batching writer (flush window, thresholds,
//!   ordered callbacks)
//! - [`storage`]: directory lock, pid file, and keyspace lifecycle
//! - [`service`]: options and the connection supervisor
//! - [`stats`]: the per-queue depth publisher
//!
//! ## Example
//!
//! ```rust,no_run
//! #[tokio::main]
//! async fn main() -> requeue::Result<()> {
//!     let conn = requeue::Options::new("/var/lib/requeue")
//!         .nats_servers("nats://127.0.0.1:4222")
//!         .connect()
//!         .await?;
//!
//!     // Runs until close() is called or the process receives an
//!     // interrupt/terminate signal.
//!     conn.has_been_closed().await;
//!     Ok(())
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod closer;
pub mod error;
pub mod id;
pub mod key;
pub mod message;
pub mod service;
pub mod stats;
pub mod storage;
pub mod writer;

mod ingress;

// =============================================================================
// Re-exports
// =============================================================================

pub use closer::Closer;
pub use error::{Error, Result};
pub use id::MessageId;
pub use key::{KeySuffix, QueueKey};
pub use message::{BackoffStrategy, MessageView, RequeueMessage, DEFAULT_QUEUE};
pub use service::{
    connect, Conn, ConnectErrorHook, Options, WriteErrorHook, DEFAULT_NATS_CLIENT_NAME,
    DEFAULT_NATS_QUEUE_GROUP, DEFAULT_NATS_SERVERS, DEFAULT_NATS_SUBJECT, DEFAULT_NUM_WORKERS,
};
pub use stats::{QueueStats, StatsOptions, StatsPublisher, StatsSnapshot};
pub use storage::Storage;
pub use writer::{BatchedWriter, CommitCallback, WriterConfig};
