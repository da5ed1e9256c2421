//! # Ingress Worker Pool
//!
//! A fixed set of workers turns bus messages into keyed storage writes:
//!
//! ```text
//! bus ──▶ dispatch channel ──▶ worker i ──▶ batched writer i ──▶ store
//!         (rendezvous)                        │
//!                                             └─ commit ─▶ ack(reply)
//! ```
//!
//! All workers share one rendezvous dispatch channel, so a slow worker
//! directly slows bus consumption; the bus client's own pending buffer
//! absorbs short bursts. Each worker owns its **own** batched writer;
//! workers never share a batch.
//!
//! The acknowledgement is the commit callback: an empty reply published to
//! the message's reply subject once the write is durable. A message whose
//! write fails is never acknowledged (the producer's request times out and
//! it may retry), and the operator-supplied write-error hook is invoked.

use std::sync::Arc;

use async_nats::Client;
use bytes::Bytes;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::closer::Closer;
use crate::error::{Error, Result};
use crate::id::MessageId;
use crate::key::{self, QueueKey};
use crate::message::MessageView;
use crate::service::WriteErrorHook;
use crate::storage::Storage;
use crate::writer::{BatchedWriter, CommitCallback, WriterConfig};

// =============================================================================
// Worker Pool
// =============================================================================

/// Shared context handed to every worker.
pub(crate) struct WorkerContext {
    pub client: Client,
    pub storage: Arc<Storage>,
    pub writer_config: WriterConfig,
    pub write_error_hook: Option<WriteErrorHook>,
}

/// Spawns `count` workers consuming from `dispatch`.
///
/// Each worker gets its own [`BatchedWriter`]; writer construction failures
/// are fatal at startup. The `closer` completes only after every spawned
/// worker has closed its writer and returned.
pub(crate) fn spawn_workers(
    count: usize,
    context: Arc<WorkerContext>,
    dispatch: flume::Receiver<async_nats::Message>,
    closer: Closer,
) -> Result<()> {
    for worker_id in 0..count {
        let writer = BatchedWriter::new(
            context.storage.keyspace().clone(),
            context.storage.partition().clone(),
            context.writer_config.clone(),
        )?;
        closer.add_running(1);
        tokio::spawn(run_worker(
            worker_id,
            writer,
            Arc::clone(&context),
            dispatch.clone(),
            closer.clone(),
        ));
    }
    Ok(())
}

async fn run_worker(
    worker_id: usize,
    writer: BatchedWriter,
    context: Arc<WorkerContext>,
    dispatch: flume::Receiver<async_nats::Message>,
    closer: Closer,
) {
    debug!(worker_id, "ingress worker started");

    loop {
        tokio::select! {
            received = dispatch.recv_async() => match received {
                Ok(msg) => process_ingress_message(&context, &writer, msg).await,
                // The forwarder dropped the channel; nothing more will come.
                Err(_) => break,
            },
            _ = closer.has_been_closed() => break,
        }
    }

    // Flushes the pending batch and fires the remaining callbacks.
    writer.close().await;
    debug!(worker_id, "ingress worker stopped");
    closer.done();
}

// =============================================================================
// Per-Message Path
// =============================================================================

async fn process_ingress_message(
    context: &WorkerContext,
    writer: &BatchedWriter,
    msg: async_nats::Message,
) {
    // Route by the envelope's queue name; the envelope bytes themselves are
    // stored verbatim.
    let queue = {
        let view = match MessageView::parse(&msg.payload) {
            Ok(view) => view,
            Err(err) => {
                warn!(subject = %msg.subject, %err, "dropping undecodable message");
                invoke_write_error_hook(context, &msg, &err);
                return;
            }
        };
        let queue = view.queue_name();
        if !key::is_valid_queue_name(queue) {
            let err = Error::InvalidMessage(format!("invalid queue name {:?}", queue));
            warn!(subject = %msg.subject, %err, "dropping message");
            invoke_write_error_hook(context, &msg, &err);
            return;
        }
        queue.to_string()
    };

    debug!(subject = %msg.subject, queue = %queue, bytes = msg.payload.len(), "received a message");

    let queue_key = QueueKey::for_message(queue, MessageId::new());
    let callback = ack_callback(context, &msg);
    let value = msg.payload.to_vec();

    if let Err(err) = writer.set(queue_key.bytes(), value, callback).await {
        error!(subject = %msg.subject, %err, "problem handing message to the batched writer");
        invoke_write_error_hook(context, &msg, &err);
    }
}

/// Builds the commit callback for one message: reply with an empty body on
/// success, invoke the write-error hook (and stay silent toward the
/// producer) on failure.
///
/// The callback runs on the writer's flusher thread, so the reply is
/// published from a task spawned back onto the service runtime.
fn ack_callback(context: &WorkerContext, msg: &async_nats::Message) -> CommitCallback {
    let runtime = Handle::current();
    let client = context.client.clone();
    let hook = context.write_error_hook.clone();
    let msg = msg.clone();

    Box::new(move |result| match result {
        Ok(()) => {
            debug!(subject = %msg.subject, "committed message");
            match msg.reply.clone() {
                Some(reply) => {
                    runtime.spawn(async move {
                        // Best-effort: during shutdown the connection may
                        // already be draining.
                        if let Err(err) = client.publish(reply, Bytes::new()).await {
                            debug!(subject = %msg.subject, %err, "problem sending ack");
                        }
                    });
                }
                None => debug!(subject = %msg.subject, "message carries no reply subject"),
            }
        }
        Err(err) => {
            error!(subject = %msg.subject, %err, "problem committing message");
            if let Some(hook) = &hook {
                hook(&msg, &err);
            }
        }
    })
}

fn invoke_write_error_hook(context: &WorkerContext, msg: &async_nats::Message, err: &Error) {
    if let Some(hook) = &context.write_error_hook {
        hook(msg, err);
    }
}
