//! # Per-Queue Stats Publisher
//!
//! A background ticker that snapshots per-queue message depths from the
//! store and publishes them on the bus, so operators can watch backlog
//! without touching the data directory.
//!
//! Stats are observability, not control flow: a failed scan or publish is
//! logged and the next tick tries again.

use std::sync::Arc;
use std::time::Duration;

use async_nats::Client;
use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

use crate::closer::Closer;
use crate::storage::Storage;

// =============================================================================
// Configuration
// =============================================================================

/// Default interval between stats publications.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Subject prefix under which stats are published; the instance id is the
/// final token.
pub const STATS_SUBJECT_PREFIX: &str = "requeue.stats";

/// Options for a [`StatsPublisher`].
#[derive(Debug, Clone)]
pub struct StatsOptions {
    /// On this interval, queue depths are snapshotted and published.
    pub publish_interval: Duration,
}

impl Default for StatsOptions {
    fn default() -> Self {
        Self {
            publish_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Depth of a single queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    /// The queue name.
    pub queue: String,
    /// Number of stored messages.
    pub messages: u64,
}

/// The JSON document published on every tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// The publishing service instance.
    pub instance_id: String,
    /// Per-queue depths, sorted by queue name.
    pub queues: Vec<QueueStats>,
}

// =============================================================================
// Stats Publisher
// =============================================================================

/// Publishes per-queue depth snapshots on a fixed interval.
pub struct StatsPublisher {
    closer: Closer,
}

impl StatsPublisher {
    /// Starts the background ticker.
    pub fn new(
        client: Client,
        storage: Arc<Storage>,
        instance_id: String,
        options: StatsOptions,
    ) -> Self {
        let closer = Closer::new(0);
        closer.add_running(1);

        let ticker_closer = closer.clone();
        tokio::spawn(async move {
            let period = options.publish_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        publish(&client, &storage, &instance_id).await;
                    }
                    _ = ticker_closer.has_been_closed() => break,
                }
            }
            debug!("stats publisher stopped");
            ticker_closer.done();
        });

        Self { closer }
    }

    /// Stops the ticker and waits for it to finish.
    pub async fn close(&self) {
        self.closer.signal_and_wait().await;
    }
}

async fn publish(client: &Client, storage: &Arc<Storage>, instance_id: &str) {
    // The depth scan walks the whole messages bucket; keep it off the
    // async workers.
    let scan_storage = Arc::clone(storage);
    let depths = match tokio::task::spawn_blocking(move || scan_storage.queue_depths()).await {
        Ok(Ok(depths)) => depths,
        Ok(Err(err)) => {
            warn!(%err, "problem scanning queue depths");
            return;
        }
        Err(err) => {
            warn!(%err, "queue depth scan panicked");
            return;
        }
    };

    let snapshot = StatsSnapshot {
        instance_id: instance_id.to_string(),
        queues: depths
            .into_iter()
            .map(|(queue, messages)| QueueStats { queue, messages })
            .collect(),
    };

    let payload = match serde_json::to_vec(&snapshot) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(%err, "problem encoding stats snapshot");
            return;
        }
    };

    let subject = format!("{}.{}", STATS_SUBJECT_PREFIX, instance_id);
    debug!(%subject, queues = snapshot.queues.len(), "publishing stats");
    if let Err(err) = client.publish(subject, payload.into()).await {
        warn!(%err, "problem publishing stats");
    }
}

// =============================================================================
// Tests
// =============================================================================
