//! End-to-End Ingress Tests
//!
//! These drive the whole pipeline through a real bus: producer -> NATS ->
//! dispatch -> worker -> batched writer -> store -> ack. They need a local
//! `nats-server` on the default port and are ignored by default:
//!
//! ```text
//! nats-server &
//! cargo test --test ingress_test -- --ignored
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use requeue::{MessageView, Options, QueueKey, RequeueMessage, Storage};

fn test_envelope(subject: &str, queue: &str) -> Vec<u8> {
    RequeueMessage {
        retries: 3,
        delay: 5_000_000_000,
        original_subject: subject.to_string(),
        queue_name: queue.to_string(),
        original_payload: b"my awesome message".to_vec(),
        ..RequeueMessage::default()
    }
    .encode()
    .unwrap()
}

#[tokio::test]
#[ignore = "requires a running nats-server on localhost:4222"]
async fn test_commit_then_ack() {
    let dir = tempfile::TempDir::new().unwrap();
    let subject_root = format!("rq{}", std::process::id());

    let conn = Options::new(dir.path())
        .nats_subject(format!("{}.>", subject_root))
        .nats_queue_group(format!("{}-workers", subject_root))
        .stats_enabled(false)
        .connect()
        .await
        .unwrap();

    let producer = async_nats::connect("nats://127.0.0.1:4222").await.unwrap();
    let envelope = test_envelope("foo.bar", "default");

    // request() completes only when the service replies, and the service
    // replies only after commit.
    let reply = tokio::time::timeout(
        Duration::from_secs(5),
        producer.request(format!("{}.foo", subject_root), envelope.clone().into()),
    )
    .await
    .expect("ack must arrive")
    .expect("request must succeed");
    assert!(reply.payload.is_empty(), "the ack is an empty reply");

    conn.close().await;
    conn.has_been_closed().await;

    // Exactly one message, stored verbatim under the default queue.
    let storage = Storage::open(dir.path()).unwrap();
    assert_eq!(storage.message_count("default").unwrap(), 1);

    let first = QueueKey::first_message("default").bytes();
    let last = QueueKey::last_message("default").bytes();
    for item in storage.partition().range(first..=last) {
        let (key, value) = item.unwrap();
        let parsed = QueueKey::parse(&key);
        assert_eq!(parsed.name(), "default");
        assert_eq!(&*value, envelope.as_slice());

        // Data-model invariant: the stored envelope's queue equals the
        // key's queue segment.
        let view = MessageView::parse(&value).unwrap();
        assert_eq!(view.queue_name(), parsed.name());
    }
    storage.close().unwrap();
}

#[tokio::test]
#[ignore = "requires a running nats-server on localhost:4222"]
async fn test_envelope_queue_routes_the_key() {
    let dir = tempfile::TempDir::new().unwrap();
    let subject_root = format!("rqq{}", std::process::id());

    let conn = Options::new(dir.path())
        .nats_subject(format!("{}.>", subject_root))
        .nats_queue_group(format!("{}-workers", subject_root))
        .stats_enabled(false)
        .connect()
        .await
        .unwrap();

    let producer = async_nats::connect("nats://127.0.0.1:4222").await.unwrap();
    for queue in ["high", "low", "high"] {
        let envelope = test_envelope("foo.bar", queue);
        tokio::time::timeout(
            Duration::from_secs(5),
            producer.request(format!("{}.foo", subject_root), envelope.into()),
        )
        .await
        .expect("ack must arrive")
        .expect("request must succeed");
    }

    conn.close().await;

    let storage = Storage::open(dir.path()).unwrap();
    assert_eq!(storage.message_count("high").unwrap(), 2);
    assert_eq!(storage.message_count("low").unwrap(), 1);
    assert_eq!(storage.message_count("default").unwrap(), 0);
    storage.close().unwrap();
}

#[tokio::test]
#[ignore = "requires a running nats-server on localhost:4222"]
async fn test_burst_is_coalesced_and_fully_acked() {
    const MESSAGES: u64 = 500;

    let dir = tempfile::TempDir::new().unwrap();
    let subject_root = format!("rqb{}", std::process::id());

    let conn = Options::new(dir.path())
        .nats_subject(format!("{}.>", subject_root))
        .nats_queue_group(format!("{}-workers", subject_root))
        .stats_enabled(false)
        .connect()
        .await
        .unwrap();

    let producer = async_nats::connect("nats://127.0.0.1:4222").await.unwrap();
    let acked = Arc::new(AtomicU64::new(0));

    let requests = (0..MESSAGES).map(|i| {
        let producer = producer.clone();
        let acked = Arc::clone(&acked);
        let subject = format!("{}.burst.{}", subject_root, i % 7);
        let envelope = test_envelope(&subject, "default");
        async move {
            let reply = tokio::time::timeout(
                Duration::from_secs(10),
                producer.request(subject, envelope.into()),
            )
            .await
            .expect("ack must arrive")
            .expect("request must succeed");
            assert!(reply.payload.is_empty());
            acked.fetch_add(1, Ordering::Relaxed);
        }
    });
    join_all(requests).await;

    assert_eq!(acked.load(Ordering::Relaxed), MESSAGES);
    conn.close().await;

    let storage = Storage::open(dir.path()).unwrap();
    assert_eq!(storage.message_count("default").unwrap(), MESSAGES);
    storage.close().unwrap();
}

#[tokio::test]
#[ignore = "requires a running nats-server on localhost:4222"]
async fn test_close_is_idempotent_and_ordered() {
    let dir = tempfile::TempDir::new().unwrap();
    let subject_root = format!("rqc{}", std::process::id());

    let conn = Options::new(dir.path())
        .nats_subject(format!("{}.>", subject_root))
        .nats_queue_group(format!("{}-workers", subject_root))
        .stats_enabled(false)
        .connect()
        .await
        .unwrap();

    // Concurrent closers all return, exactly one runs the phases.
    let closers: Vec<_> = (0..3)
        .map(|_| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.close().await })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap();
    }
    conn.has_been_closed().await;

    // Storage was released last: the directory is immediately reusable.
    let storage = Storage::open(dir.path()).unwrap();
    storage.close().unwrap();
}
