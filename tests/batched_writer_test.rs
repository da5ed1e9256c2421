//! Batch Coalescing and Durability Tests
//!
//! Exercises the batched writer against a real store:
//! - many back-to-back writes coalesce into few commits
//! - callbacks fire exactly once, in submission order
//! - everything acknowledged before close is present after reopening

mod common;

use std::sync::Arc;
use std::time::Duration;

use requeue::writer::{BatchedWriter, WriterConfig};
use requeue::{MessageId, QueueKey, RequeueMessage, Storage};

fn writer_for(storage: &Storage, config: WriterConfig) -> BatchedWriter {
    BatchedWriter::new(
        storage.keyspace().clone(),
        storage.partition().clone(),
        config,
    )
    .expect("spawn batched writer")
}

#[tokio::test]
async fn test_back_to_back_writes_coalesce() {
    let (_dir, storage) = common::open_temp_storage();
    let config = WriterConfig {
        flush_interval: Duration::from_millis(50),
        max_batch_entries: 100,
        ..WriterConfig::default()
    };
    let writer = writer_for(&storage, config);

    let log = common::CallbackLog::new();
    for seq in 0..1000u64 {
        let key = QueueKey::for_message("default", MessageId::new());
        writer
            .set(key.bytes(), b"envelope".to_vec(), log.callback(seq))
            .await
            .unwrap();
    }
    writer.close().await;

    // Every callback fired exactly once, in submission order.
    let entries = log.entries();
    assert_eq!(entries.len(), 1000);
    for (i, (seq, ok)) in entries.iter().enumerate() {
        assert_eq!(*seq, i as u64);
        assert!(*ok);
    }

    // 1000 writes at <= 100 per batch is at least 10 commits, and
    // coalescing must keep it well below one commit per write.
    let commits = writer.committed_batches();
    assert!(commits >= 10, "expected >= 10 commits, got {}", commits);
    assert!(commits <= 50, "expected coalescing, got {} commits", commits);

    assert_eq!(storage.message_count("default").unwrap(), 1000);
    storage.close().unwrap();
}

#[tokio::test]
async fn test_concurrent_producers_share_batches() {
    let (_dir, storage) = common::open_temp_storage();
    let config = WriterConfig {
        flush_interval: Duration::from_millis(50),
        ..WriterConfig::default()
    };
    let writer = Arc::new(writer_for(&storage, config));

    let mut handles = Vec::new();
    for task in 0..10 {
        let writer = Arc::clone(&writer);
        let log = common::CallbackLog::new();
        handles.push(tokio::spawn(async move {
            for seq in 0..20u64 {
                let key = QueueKey::for_message("default", MessageId::new());
                writer
                    .set(
                        key.bytes(),
                        format!("task-{}-{}", task, seq).into_bytes(),
                        log.callback(seq),
                    )
                    .await
                    .unwrap();
            }
            log
        }));
    }

    let mut logs = Vec::new();
    for handle in handles {
        logs.push(handle.await.unwrap());
    }
    writer.close().await;

    for log in logs {
        let entries = log.entries();
        assert_eq!(entries.len(), 20);
        // Per-producer submission order is preserved even when batches mix
        // writes from many tasks.
        for (i, (seq, ok)) in entries.iter().enumerate() {
            assert_eq!(*seq, i as u64);
            assert!(*ok);
        }
    }

    assert_eq!(storage.message_count("default").unwrap(), 200);
    // 200 concurrent writes inside a 50ms window should land in a handful
    // of batches.
    assert!(writer.committed_batches() <= 20);
    storage.close().unwrap();
}

#[tokio::test]
async fn test_acknowledged_writes_survive_reopen() {
    let dir = tempfile::TempDir::new().unwrap();

    let envelope = RequeueMessage {
        retries: 3,
        original_subject: "foo.bar".to_string(),
        original_payload: b"durable payload".to_vec(),
        ..RequeueMessage::default()
    }
    .encode()
    .unwrap();

    let mut keys = Vec::new();
    {
        let storage = Storage::open(dir.path()).unwrap();
        let writer = writer_for(&storage, common::short_window_config());

        let log = common::CallbackLog::new();
        for seq in 0..50u64 {
            let key = QueueKey::for_message("default", MessageId::new());
            keys.push(key.bytes());
            writer
                .set(key.bytes(), envelope.clone(), log.callback(seq))
                .await
                .unwrap();
        }
        writer.close().await;
        assert_eq!(log.len(), 50, "close must fire every pending callback");
        storage.close().unwrap();
    }

    // A fresh instance over the same directory sees exactly the
    // acknowledged messages, byte for byte.
    let storage = Storage::open(dir.path()).unwrap();
    assert_eq!(storage.message_count("default").unwrap(), 50);
    for key in keys {
        let value = storage
            .partition()
            .get(&key)
            .unwrap()
            .expect("acknowledged key must be present after reopen");
        assert_eq!(&*value, envelope.as_slice());
    }
    storage.close().unwrap();
}

#[tokio::test]
async fn test_writers_do_not_share_batches() {
    let (_dir, storage) = common::open_temp_storage();
    let config = WriterConfig {
        flush_interval: Duration::from_millis(20),
        ..WriterConfig::default()
    };
    let writer_a = writer_for(&storage, config.clone());
    let writer_b = writer_for(&storage, config);

    let log = common::CallbackLog::new();
    for seq in 0..10u64 {
        let writer = if seq % 2 == 0 { &writer_a } else { &writer_b };
        let key = QueueKey::for_message("default", MessageId::new());
        writer
            .set(key.bytes(), b"x".to_vec(), log.callback(seq))
            .await
            .unwrap();
    }

    writer_a.close().await;
    writer_b.close().await;

    assert_eq!(log.len(), 10);
    assert!(writer_a.committed_batches() >= 1);
    assert!(writer_b.committed_batches() >= 1);
    assert_eq!(storage.message_count("default").unwrap(), 10);
    storage.close().unwrap();
}
