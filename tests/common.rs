#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use requeue::writer::{CommitCallback, WriterConfig};
use requeue::Storage;

/// Opens a fresh storage directory; the TempDir must outlive the storage.
pub fn open_temp_storage() -> (tempfile::TempDir, Storage) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let storage = Storage::open(dir.path()).expect("open storage");
    (dir, storage)
}

/// A writer config whose window fires quickly, for latency-sensitive tests.
pub fn short_window_config() -> WriterConfig {
    WriterConfig {
        flush_interval: Duration::from_millis(5),
        ..WriterConfig::default()
    }
}

/// Records callback invocations (sequence number, success) in order.
#[derive(Clone, Default)]
pub struct CallbackLog {
    entries: Arc<Mutex<Vec<(u64, bool)>>>,
}

impl CallbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self, seq: u64) -> CommitCallback {
        let entries = Arc::clone(&self.entries);
        Box::new(move |result| {
            entries.lock().unwrap().push((seq, result.is_ok()));
        })
    }

    pub fn entries(&self) -> Vec<(u64, bool)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Polls `f` until it returns `Some` or the timeout elapses.
pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
