//! # Storage Layer
//!
//! Owns the data directory and the embedded key-value store. Two concerns
//! live here:
//!
//! 1. **Directory lock.** Each service instance owns its data path
//!    exclusively for its whole lifetime: an advisory `flock` on the
//!    directory plus a pid file inside it. The pid file is not part of the
//!    locking mechanism, it is operator convenience. Read-only openers take
//!    a shared lock and write no pid file.
//!
//! 2. **Keyspace lifecycle.** All queue data lives in one partition of an
//!    LSM keyspace; the batched writers commit into it and
//!    [`Storage::close`] persists it with a final fsync before the lock is
//!    released.
//!
//! Release order matters: the pid file is removed **before** the directory
//! handle is closed, so an observer never sees a pid file without a live
//! lock behind it.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::key::{self, QueueKey};

// =============================================================================
// Constants
// =============================================================================

/// Name of the pid file written inside a locked data directory.
pub const PID_FILE_NAME: &str = "requeue.pid";

/// Name of the partition holding all queue data.
const PARTITION_NAME: &str = "queues";

// =============================================================================
// Directory Lock Guard
// =============================================================================

/// Holds an advisory lock on a directory and a pid file inside it.
#[derive(Debug)]
pub struct DirectoryLockGuard {
    /// Handle on the directory itself, which we have flocked. `None` once
    /// released.
    file: Option<File>,
    /// Absolute path of our pid file.
    pid_path: PathBuf,
    /// Shared lock for a read-only open; no pid file is written.
    read_only: bool,
}

impl DirectoryLockGuard {
    /// Locks `dir` (exclusively, or shared when `read_only`) and writes the
    /// pid file. Fails with [`Error::DirectoryLocked`] when another process
    /// holds a conflicting lock; in that case the other instance's pid file
    /// is left untouched.
    pub fn acquire(dir: &Path, pid_file: &str, read_only: bool) -> Result<Self> {
        // Absolute path, so release still works after a chdir.
        let pid_path = dir.canonicalize()?.join(pid_file);

        let file = File::open(dir)?;
        let locked = if read_only {
            fs2::FileExt::try_lock_shared(&file)
        } else {
            fs2::FileExt::try_lock_exclusive(&file)
        };
        if locked.is_err() {
            return Err(Error::DirectoryLocked {
                path: dir.to_path_buf(),
            });
        }

        if !read_only {
            // Overwriting a stale pid file is fine: holding the flock means
            // no other read-write instance is alive.
            fs::write(&pid_path, format!("{}\n", process::id()))?;
        }

        Ok(Self {
            file: Some(file),
            pid_path,
            read_only,
        })
    }

    /// Removes the pid file, then releases the lock by closing the
    /// directory handle. Idempotent.
    pub fn release(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        if !self.read_only {
            // The pid file must go before the lock does.
            match fs::remove_file(&self.pid_path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        // Dropping the handle releases the flock.
        self.file = None;
        Ok(())
    }

    /// Absolute path of the pid file.
    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }
}

impl Drop for DirectoryLockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(%err, "problem releasing directory lock");
        }
    }
}

// =============================================================================
// Storage
// =============================================================================

/// The durable store backing the service: a locked data directory plus the
/// keyspace partition all queue keys live in.
///
/// Cheap to share behind an `Arc`; the keyspace and partition handles are
/// internally reference-counted and safe for concurrent batch commits.
pub struct Storage {
    keyspace: Keyspace,
    queues: PartitionHandle,
    guard: Mutex<Option<DirectoryLockGuard>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Opens (creating if missing) the data directory at `path`, acquires
    /// the exclusive directory lock, and opens the keyspace.
    pub fn open(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;
        let guard = DirectoryLockGuard::acquire(path, PID_FILE_NAME, false)?;

        let keyspace = fjall::Config::new(path).open()?;
        let queues =
            keyspace.open_partition(PARTITION_NAME, PartitionCreateOptions::default())?;

        debug!(path = %path.display(), "opened storage");
        Ok(Self {
            keyspace,
            queues,
            guard: Mutex::new(Some(guard)),
        })
    }

    /// The keyspace handle, for constructing batched writers.
    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// The partition holding all queue keys.
    pub fn partition(&self) -> &PartitionHandle {
        &self.queues
    }

    /// Number of stored messages in `queue`.
    pub fn message_count(&self, queue: &str) -> Result<u64> {
        let first = QueueKey::first_message(queue).bytes();
        let last = QueueKey::last_message(queue).bytes();
        let mut count = 0u64;
        for item in self.queues.range(first..=last) {
            let _ = item?;
            count += 1;
        }
        Ok(count)
    }

    /// Per-queue message counts across every queue in the store.
    ///
    /// A full scan of the messages bucket; intended for the stats cadence,
    /// not the hot path.
    pub fn queue_depths(&self) -> Result<BTreeMap<String, u64>> {
        let mut depths = BTreeMap::new();
        for item in self.queues.prefix(key::messages_bucket_prefix()) {
            let (k, _) = item?;
            let parsed = QueueKey::parse(&k);
            *depths.entry(parsed.name().to_string()).or_insert(0) += 1;
        }
        Ok(depths)
    }

    /// Persists everything with a final fsync, then releases the directory
    /// lock (pid file first). Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut slot = self
            .guard
            .lock()
            .expect("storage guard lock poisoned");
        if let Some(mut guard) = slot.take() {
            self.keyspace.persist(PersistMode::SyncAll)?;
            guard.release()?;
            debug!("closed storage");
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::MessageId;

    #[test]
    fn test_open_writes_pid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let pid_path = dir.path().join(PID_FILE_NAME);
        let contents = fs::read_to_string(&pid_path).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), process::id());

        storage.close().unwrap();
        assert!(!pid_path.exists(), "close must remove the pid file");
    }

    #[test]
    fn test_second_exclusive_acquire_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let _guard = DirectoryLockGuard::acquire(dir.path(), PID_FILE_NAME, false).unwrap();

        let err = DirectoryLockGuard::acquire(dir.path(), PID_FILE_NAME, false).unwrap_err();
        assert!(matches!(err, Error::DirectoryLocked { .. }));

        // The loser must not have touched the winner's pid file.
        let contents = fs::read_to_string(dir.path().join(PID_FILE_NAME)).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), process::id());
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempfile::TempDir::new().unwrap();
        let _a = DirectoryLockGuard::acquire(dir.path(), PID_FILE_NAME, true).unwrap();
        let _b = DirectoryLockGuard::acquire(dir.path(), PID_FILE_NAME, true).unwrap();

        // But an exclusive lock is refused while readers hold it.
        let err = DirectoryLockGuard::acquire(dir.path(), PID_FILE_NAME, false).unwrap_err();
        assert!(matches!(err, Error::DirectoryLocked { .. }));
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut guard = DirectoryLockGuard::acquire(dir.path(), PID_FILE_NAME, false).unwrap();
        guard.release().unwrap();
        guard.release().unwrap();

        // Lock is free again.
        let _second = DirectoryLockGuard::acquire(dir.path(), PID_FILE_NAME, false).unwrap();
    }

    #[test]
    fn test_queue_depths_counts_per_queue() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        for queue in ["high", "high", "high", "low"] {
            let key = QueueKey::for_message(queue, MessageId::new());
            storage.queues.insert(key.bytes(), b"envelope".as_slice()).unwrap();
        }
        // State keys must not count as messages.
        let checkpoint = QueueKey::for_state("high", key::CHECKPOINT_PROPERTY);
        storage.queues.insert(checkpoint.bytes(), b"pos".as_slice()).unwrap();

        let depths = storage.queue_depths().unwrap();
        assert_eq!(depths.get("high"), Some(&3));
        assert_eq!(depths.get("low"), Some(&1));
        assert_eq!(depths.len(), 2);

        assert_eq!(storage.message_count("high").unwrap(), 3);
        assert_eq!(storage.message_count("empty").unwrap(), 0);

        storage.close().unwrap();
    }
}
