//! # Error Handling
//!
//! This module defines the error types used throughout the requeue service.
//! We use a single error enum ([`Error`]) to represent all failure modes,
//! which keeps function signatures simple for library users.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Startup (fatal) | `Config`, `DirectoryLocked`, `Connect`, `Subscribe` | Abort construction, roll back partial state |
//! | Runtime (surfaced) | `Commit`, `Oversized`, `InvalidMessage` | Write-error hook; the producer sees no ack |
//! | Termination race | `Closed` | Normal during shutdown |
//! | Wrapped | `Storage`, `Io` | Log and investigate |
//!
//! Runtime errors never abort the process: the bus client reconnects on its
//! own, and a message that could not be committed is simply never
//! acknowledged, which is the producer-visible failure signal.

use std::path::PathBuf;

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in requeue operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration supplied to [`Options`](crate::Options).
    ///
    /// Fatal at startup; surfaced to the caller of the constructor.
    #[error("configuration error: {0}")]
    Config(String),

    /// Another process holds the lock on the storage directory.
    ///
    /// Each service instance owns its data path exclusively. The advisory
    /// directory lock is released when the owning instance closes (or
    /// crashes, since `flock` locks die with the process).
    #[error("cannot acquire directory lock on {path:?}: another process is using this data path")]
    DirectoryLocked {
        /// The contested data directory.
        path: PathBuf,
    },

    /// The initial connection to the bus failed.
    ///
    /// Fatal at startup when retry-on-failure is disabled. After startup,
    /// disconnects are handled by the client's own reconnect loop and never
    /// produce this error.
    #[error("nats connect error: {0}")]
    Connect(#[from] async_nats::ConnectError),

    /// The queue-group subscription could not be established.
    #[error("nats subscribe error: {0}")]
    Subscribe(String),

    /// The bus connection closed terminally after startup.
    ///
    /// Fired through the connect-error hook; the supervisor shuts down in
    /// response, flushing whatever the workers still hold.
    #[error("nats connection lost: {0}")]
    ConnectionLost(String),

    /// The storage engine reported an error.
    #[error("storage error: {0}")]
    Storage(#[from] fjall::Error),

    /// An I/O error outside the storage engine (directory lock, pid file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A byte buffer does not hold a valid requeue envelope.
    ///
    /// Raised when viewing a buffer whose magic, version, or section
    /// lengths do not check out. Messages that fail to parse are dropped
    /// without acknowledgement.
    #[error("invalid requeue message: {0}")]
    InvalidMessage(String),

    /// A single write exceeds the batch transaction's capacity.
    ///
    /// Returned from [`BatchedWriter::set`](crate::writer::BatchedWriter::set)
    /// before the write is enqueued; the message is dropped and the
    /// write-error hook is invoked.
    #[error("write of {size} bytes exceeds the batch capacity of {max} bytes")]
    Oversized {
        /// Combined key + value size of the rejected write.
        size: usize,
        /// The writer's configured byte capacity.
        max: usize,
    },

    /// A batch transaction failed to commit.
    ///
    /// Every callback in the failed batch receives this error with the same
    /// underlying failure text. The batch is discarded, not retried.
    #[error("commit failed: {0}")]
    Commit(String),

    /// Operation attempted on a closed component.
    ///
    /// Treated as a normal termination race, not a fault.
    #[error("component is closed")]
    Closed,
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
