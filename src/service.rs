//! # Connection Supervisor
//!
//! Owns the lifetimes of the bus connection, the storage handle, and the
//! ingress worker pool, and enforces a strict shutdown order:
//!
//! ```text
//! startup:    storage ──▶ nats ──▶ subscribe ──▶ workers ──▶ watchers
//!
//! shutdown:   1. drain the bus        (no new messages; in-flight ones
//!                                      finish crossing the dispatch channel)
//!             2. stop the workers     (each closes its batched writer,
//!                                      which flushes and fires callbacks)
//!             3. close storage        (final persist, release the lock)
//! ```
//!
//! Closing storage first would make the remaining callbacks fail; stopping
//! workers before the bus has drained would lose messages the subscription
//! already received. Draining first, then stopping workers, then closing
//! storage guarantees that every acknowledged message was committed.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::{Client, Subscriber};
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::closer::Closer;
use crate::error::{Error, Result};
use crate::id::MessageId;
use crate::ingress::{self, WorkerContext};
use crate::stats::{StatsOptions, StatsPublisher};
use crate::storage::Storage;
use crate::writer::WriterConfig;

// =============================================================================
// Defaults
// =============================================================================

/// Default NATS server URL.
pub const DEFAULT_NATS_SERVERS: &str = "nats://127.0.0.1:4222";

/// Default name assigned to the NATS client connection.
pub const DEFAULT_NATS_CLIENT_NAME: &str = "requeue-nats";

/// By default the client keeps retrying the initial connect, so a service
/// that starts before its bus does still comes up.
pub const DEFAULT_NATS_RETRY_ON_FAILURE: bool = true;

/// Default subject the service subscribes to. `requeue.>` matches
/// `requeue.foo`, `requeue.foo.bar`, and any deeper tail.
pub const DEFAULT_NATS_SUBJECT: &str = "requeue.>";

/// Default queue group. Messages are distributed among the group's
/// subscribers, so multiple service instances split the load.
pub const DEFAULT_NATS_QUEUE_GROUP: &str = "requeue-workers";

/// Default number of ingress workers (one batched writer each).
pub const DEFAULT_NUM_WORKERS: usize = 4;

// =============================================================================
// Hooks
// =============================================================================

/// Invoked when a message could not be durably written (commit failure,
/// oversized write, undecodable envelope). The producer receives no
/// acknowledgement for such a message.
pub type WriteErrorHook = Arc<dyn Fn(&async_nats::Message, &Error) + Send + Sync>;

/// Invoked when the bus connection is terminally lost after startup; the
/// supervisor shuts itself down right after.
pub type ConnectErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

// =============================================================================
// Options
// =============================================================================

/// Configuration for a service connection, builder style.
///
/// ```no_run
/// # async fn example() -> requeue::Result<()> {
/// let conn = requeue::Options::new("/var/lib/requeue")
///     .nats_servers("nats://10.0.0.5:4222")
///     .num_workers(8)
///     .connect()
///     .await?;
/// conn.has_been_closed().await;
/// # Ok(())
/// # }
/// ```
pub struct Options {
    nats_servers: String,
    nats_client_name: String,
    retry_on_failure: bool,
    nats_subject: String,
    nats_queue_group: String,
    nats_options: Option<Box<dyn FnOnce(async_nats::ConnectOptions) -> async_nats::ConnectOptions + Send>>,
    data_path: PathBuf,
    write_error_hook: Option<WriteErrorHook>,
    connect_error_hook: Option<ConnectErrorHook>,
    num_workers: usize,
    writer_config: WriterConfig,
    stats_enabled: bool,
    stats_interval: Duration,
    close_signal: Option<BoxFuture<'static, ()>>,
}

impl Options {
    /// Creates options with the given storage data path and defaults for
    /// everything else.
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            nats_servers: DEFAULT_NATS_SERVERS.to_string(),
            nats_client_name: DEFAULT_NATS_CLIENT_NAME.to_string(),
            retry_on_failure: DEFAULT_NATS_RETRY_ON_FAILURE,
            nats_subject: DEFAULT_NATS_SUBJECT.to_string(),
            nats_queue_group: DEFAULT_NATS_QUEUE_GROUP.to_string(),
            nats_options: None,
            data_path: data_path.into(),
            write_error_hook: None,
            connect_error_hook: None,
            num_workers: DEFAULT_NUM_WORKERS,
            writer_config: WriterConfig::default(),
            stats_enabled: true,
            stats_interval: StatsOptions::default().publish_interval,
            close_signal: None,
        }
    }

    /// NATS server URLs (comma separated).
    pub fn nats_servers(mut self, servers: impl Into<String>) -> Self {
        self.nats_servers = servers.into();
        self
    }

    /// Name assigned to the NATS client connection.
    pub fn nats_client_name(mut self, name: impl Into<String>) -> Self {
        self.nats_client_name = name.into();
        self
    }

    /// Whether to keep retrying the initial connect in the background.
    /// When off, a failed first connect is fatal.
    pub fn retry_on_failure(mut self, retry: bool) -> Self {
        self.retry_on_failure = retry;
        self
    }

    /// Subject to subscribe to for incoming messages.
    pub fn nats_subject(mut self, subject: impl Into<String>) -> Self {
        self.nats_subject = subject.into();
        self
    }

    /// Queue group for the subscription.
    pub fn nats_queue_group(mut self, group: impl Into<String>) -> Self {
        self.nats_queue_group = group.into();
        self
    }

    /// Additional options applied to the NATS connection (credentials,
    /// TLS, timeouts) on top of what the service configures itself.
    pub fn nats_options(
        mut self,
        apply: impl FnOnce(async_nats::ConnectOptions) -> async_nats::ConnectOptions + Send + 'static,
    ) -> Self {
        self.nats_options = Some(Box::new(apply));
        self
    }

    /// Hook invoked when a message cannot be durably written.
    pub fn write_error_hook(
        mut self,
        hook: impl Fn(&async_nats::Message, &Error) + Send + Sync + 'static,
    ) -> Self {
        self.write_error_hook = Some(Arc::new(hook));
        self
    }

    /// Hook invoked when the bus connection is terminally lost.
    pub fn connect_error_hook(
        mut self,
        hook: impl Fn(&Error) + Send + Sync + 'static,
    ) -> Self {
        self.connect_error_hook = Some(Arc::new(hook));
        self
    }

    /// Number of ingress workers.
    pub fn num_workers(mut self, workers: usize) -> Self {
        self.num_workers = workers;
        self
    }

    /// Batched writer tuning (flush window and batch capacity).
    pub fn writer_config(mut self, config: WriterConfig) -> Self {
        self.writer_config = config;
        self
    }

    /// Enables or disables the per-queue stats publisher.
    pub fn stats_enabled(mut self, enabled: bool) -> Self {
        self.stats_enabled = enabled;
        self
    }

    /// Interval between stats publications.
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// A future whose completion triggers the same graceful shutdown as
    /// [`Conn::close`] (the embedder's cancellation signal).
    pub fn close_on(mut self, signal: impl Future<Output = ()> + Send + 'static) -> Self {
        self.close_signal = Some(Box::pin(signal));
        self
    }

    /// Connects to the bus, opens storage, and starts the service.
    pub async fn connect(self) -> Result<Conn> {
        Conn::connect(self).await
    }

    fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(Error::Config("num_workers must be at least 1".to_string()));
        }
        if self.data_path.as_os_str().is_empty() {
            return Err(Error::Config("data_path must not be empty".to_string()));
        }
        if self.nats_subject.is_empty() {
            return Err(Error::Config("nats_subject must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Connects a requeue service with the given options.
///
/// Equivalent to `options.connect()`.
pub async fn connect(options: Options) -> Result<Conn> {
    Conn::connect(options).await
}

// =============================================================================
// Conn
// =============================================================================

struct Closers {
    bus: Closer,
    workers: Closer,
}

struct ConnInner {
    client: Client,
    storage: Arc<Storage>,
    closers: Closers,
    stats: Option<StatsPublisher>,
    connect_error_hook: Option<ConnectErrorHook>,
    instance_id: String,
    close_started: AtomicBool,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

/// A running service connection.
///
/// Cheap to clone; all clones drive the same underlying service. Dropping
/// the last clone does **not** shut the service down; call
/// [`close`](Conn::close) (or send the process an interrupt).
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl Conn {
    async fn connect(mut options: Options) -> Result<Self> {
        options.validate()?;

        // 1. Storage first: the directory lock decides whether this
        //    instance may run at all.
        let storage = Arc::new(Storage::open(&options.data_path)?);

        // Terminal bus failures are reported through this channel by the
        // client's event callback and by the forwarder.
        let (fatal_tx, fatal_rx) = watch::channel::<Option<String>>(None);

        // 2. Bus connection.
        let client = match connect_nats(&mut options, fatal_tx.clone()).await {
            Ok(client) => client,
            Err(err) => {
                let _ = storage.close();
                return Err(err);
            }
        };

        // 3. Queue-group subscription feeding the rendezvous dispatch
        //    channel; a slow worker pool directly slows bus consumption.
        let subscriber = match client
            .queue_subscribe(options.nats_subject.clone(), options.nats_queue_group.clone())
            .await
        {
            Ok(subscriber) => subscriber,
            Err(err) => {
                let _ = storage.close();
                return Err(Error::Subscribe(err.to_string()));
            }
        };
        info!(
            subject = %options.nats_subject,
            queue_group = %options.nats_queue_group,
            "listening"
        );

        let (dispatch_tx, dispatch_rx) = flume::bounded::<async_nats::Message>(0);

        let closers = Closers {
            bus: Closer::new(0),
            workers: Closer::new(0),
        };

        closers.bus.add_running(1);
        tokio::spawn(run_forwarder(
            subscriber,
            dispatch_tx,
            closers.bus.clone(),
            fatal_tx,
        ));

        let instance_id = MessageId::new().to_string();
        let stats = if options.stats_enabled {
            Some(StatsPublisher::new(
                client.clone(),
                Arc::clone(&storage),
                instance_id.clone(),
                StatsOptions {
                    publish_interval: options.stats_interval,
                },
            ))
        } else {
            None
        };

        let (closed_tx, closed_rx) = watch::channel(false);
        let conn = Conn {
            inner: Arc::new(ConnInner {
                client: client.clone(),
                storage: Arc::clone(&storage),
                closers,
                stats,
                connect_error_hook: options.connect_error_hook.clone(),
                instance_id,
                close_started: AtomicBool::new(false),
                closed_tx,
                closed_rx,
            }),
        };

        // 4. Ingress workers, one batched writer each.
        let context = Arc::new(WorkerContext {
            client,
            storage,
            writer_config: options.writer_config.clone(),
            write_error_hook: options.write_error_hook.clone(),
        });
        if let Err(err) = ingress::spawn_workers(
            options.num_workers,
            context,
            dispatch_rx,
            conn.inner.closers.workers.clone(),
        ) {
            conn.close().await;
            return Err(err);
        }

        // 5. Watchers: process signals, embedder cancellation, terminal bus
        //    failures.
        spawn_signal_watcher(conn.clone());
        if let Some(signal) = options.close_signal {
            let watcher = conn.clone();
            tokio::spawn(async move {
                signal.await;
                debug!("close signal fired");
                watcher.close().await;
            });
        }
        spawn_fatal_watcher(conn.clone(), fatal_rx);

        Ok(conn)
    }

    /// The underlying bus client.
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Identifier of this service instance, used in the stats subject.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Gracefully shuts the service down, in order: drain the bus, stop
    /// the workers (flushing their writers), close storage.
    ///
    /// Idempotent and safe to call from any task; every caller returns
    /// once shutdown has completed.
    pub async fn close(&self) {
        if self.inner.close_started.swap(true, Ordering::SeqCst) {
            self.has_been_closed().await;
            return;
        }

        info!("requeue: closing");

        // Phase 1: drain the bus. The forwarder finishes pushing what the
        // subscription already delivered into the dispatch channel.
        self.inner.closers.bus.signal_and_wait().await;
        if let Err(err) = self.inner.client.drain().await {
            warn!(%err, "problem draining nats connection");
        }

        // Phase 2: stop the workers. Closing each batched writer flushes
        // its pending batch; remaining acknowledgements ride the draining
        // connection best-effort.
        self.inner.closers.workers.signal_and_wait().await;

        // The stats ticker reads storage; stop it before storage goes away.
        if let Some(stats) = &self.inner.stats {
            stats.close().await;
        }

        // Phase 3: close storage, only after all workers have returned.
        if let Err(err) = self.inner.storage.close() {
            error!(%err, "problem closing storage");
        }

        info!("requeue: closed");
        let _ = self.inner.closed_tx.send(true);
    }

    /// Resolves once [`close`](Conn::close) has completed, however it was
    /// triggered.
    pub async fn has_been_closed(&self) {
        let mut rx = self.inner.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

// =============================================================================
// Bus Plumbing
// =============================================================================

async fn connect_nats(
    options: &mut Options,
    fatal_tx: watch::Sender<Option<String>>,
) -> Result<Client> {
    let mut nats_options = async_nats::ConnectOptions::new()
        .name(&options.nats_client_name)
        .event_callback(move |event| {
            let fatal_tx = fatal_tx.clone();
            async move {
                match event {
                    async_nats::Event::Connected => info!("nats: connected"),
                    async_nats::Event::Disconnected => warn!("nats: disconnected"),
                    async_nats::Event::SlowConsumer(sid) => {
                        warn!(sid, "nats: slow consumer, subscription is falling behind");
                    }
                    async_nats::Event::ServerError(err) => warn!(%err, "nats: server error"),
                    async_nats::Event::ClientError(async_nats::ClientError::MaxReconnects) => {
                        error!("nats: reconnect budget exhausted");
                        let _ = fatal_tx.send(Some("max reconnects reached".to_string()));
                    }
                    async_nats::Event::ClientError(err) => error!(%err, "nats: client error"),
                    other => debug!(event = ?other, "nats: event"),
                }
            }
        });
    if options.retry_on_failure {
        nats_options = nats_options.retry_on_initial_connect();
    }
    if let Some(apply) = options.nats_options.take() {
        nats_options = apply(nats_options);
    }

    let client = nats_options.connect(options.nats_servers.as_str()).await?;
    Ok(client)
}

async fn run_forwarder(
    mut subscriber: Subscriber,
    dispatch_tx: flume::Sender<async_nats::Message>,
    bus_closer: Closer,
    fatal_tx: watch::Sender<Option<String>>,
) {
    loop {
        tokio::select! {
            delivered = subscriber.next() => match delivered {
                Some(msg) => {
                    // Rendezvous hand-off: parks here until a worker is free,
                    // which is the back-pressure onto the bus client.
                    if dispatch_tx.send_async(msg).await.is_err() {
                        break;
                    }
                }
                None => {
                    // The subscription ended without us asking: the
                    // connection is terminally gone.
                    let _ = fatal_tx.send(Some("subscription ended".to_string()));
                    break;
                }
            },
            _ = bus_closer.has_been_closed() => {
                if let Err(err) = subscriber.unsubscribe().await {
                    warn!(%err, "problem unsubscribing");
                }
                // Forward what the client already handed us, then stop.
                while let Some(msg) = subscriber.next().await {
                    if dispatch_tx.send_async(msg).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    debug!("subscription forwarder stopped");
    bus_closer.done();
}

fn spawn_fatal_watcher(conn: Conn, mut fatal_rx: watch::Receiver<Option<String>>) {
    tokio::spawn(async move {
        if fatal_rx.wait_for(|reason| reason.is_some()).await.is_err() {
            return;
        }
        let reason = fatal_rx.borrow().clone().unwrap_or_default();
        let err = Error::ConnectionLost(reason);
        error!(%err, "nats connection closed");
        if let Some(hook) = &conn.inner.connect_error_hook {
            hook(&err);
        }
        conn.close().await;
    });
}

/// Interrupt and terminate both trigger the same graceful shutdown as
/// [`Conn::close`], so scaling down never drops accepted messages.
fn spawn_signal_watcher(conn: Conn) {
    tokio::spawn(async move {
        wait_for_stop_signal().await;
        conn.close().await;
    });
}

#[cfg(unix)]
async fn wait_for_stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            warn!(%err, "problem installing the terminate handler");
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received interrupt");
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt"),
        _ = terminate.recv() => info!("received terminate"),
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received interrupt");
    }
}
