//! A transparent proxy between RESP clients and a sharded back-end
//! cluster. Clients connect as if to a single server; the proxy routes
//! every command to the shard owning its key slot and relays request and
//! reply bytes verbatim.

use cluster_map::Topology;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod client;
mod conn;
pub mod listener;
pub mod logging;
mod pool;
mod request;
mod worker;

pub use listener::Listeners;

/// When a new client may share the worker's backend connections, and when
/// it gets a private pool of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum MultiplexingMode {
    /// Always multiplex onto the worker's shared pool.
    Never,
    /// Multiplex until the shared queues grow too long, then demote every
    /// client on the worker to a private pool.
    Auto,
    /// Give every client a private pool immediately.
    Always,
}

impl std::fmt::Display for MultiplexingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MultiplexingMode::Never => "never",
            MultiplexingMode::Auto => "auto",
            MultiplexingMode::Always => "always",
        })
    }
}

/// Shared queue length at which `auto` multiplexing demotes a worker's
/// clients to private pools.
pub const DEMOTE_QUEUE_LEN: usize = 5;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub max_clients: u64,
    pub threads: usize,
    /// Keep-alive probe time for client sockets; `None` disables it.
    pub tcp_keepalive: Option<Duration>,
    pub multiplexing: MultiplexingMode,
    /// Secret for the backend `AUTH` handshake.
    pub auth: Option<String>,
    pub dump_queries: bool,
    pub dump_buffer: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_clients: 10_000_000,
            threads: 8,
            tcp_keepalive: Some(Duration::from_secs(300)),
            multiplexing: MultiplexingMode::Auto,
            auth: None,
            dump_queries: false,
            dump_buffer: false,
        }
    }
}

/// Process-wide shared state.
pub struct App {
    pub cfg: ProxyConfig,
    pub topology: Arc<Topology>,
    /// Currently connected clients, for the `--max-clients` cap.
    pub connected: AtomicU64,
    /// Monotonic client id source; `id % threads` pins the worker.
    pub next_client_id: AtomicU64,
}

/// A bound, running proxy: workers are started and listeners are ready;
/// `serve()` runs the accept loop until `cancel` fires.
pub struct Proxy {
    app: Arc<App>,
    workers: worker::WorkerPool,
    listeners: Vec<tokio::net::TcpListener>,
    cancel: CancellationToken,
}

impl Proxy {
    /// Spawn the worker threads and adopt the already-bound listeners.
    /// Must run inside a tokio runtime (the listeners register with it).
    pub fn start(
        cfg: ProxyConfig,
        topology: Topology,
        listeners: Listeners,
        cancel: CancellationToken,
    ) -> anyhow::Result<Proxy> {
        let app = Arc::new(App {
            cfg,
            topology: Arc::new(topology),
            connected: AtomicU64::new(0),
            next_client_id: AtomicU64::new(0),
        });
        let workers = worker::WorkerPool::spawn(&app, cancel.clone())?;
        let listeners = listeners
            .into_tokio()
            .map_err(|err| anyhow::anyhow!("failed to register listeners: {err}"))?;
        Ok(Proxy {
            app,
            workers,
            listeners,
            cancel,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.listeners[0]
            .local_addr()
            .expect("listener has a local address")
    }

    /// Accept clients and hand them off to their workers until cancelled.
    pub async fn serve(self) -> anyhow::Result<()> {
        let Proxy {
            app,
            workers,
            listeners,
            cancel,
        } = self;
        let mut accepts = Vec::new();
        for listener in listeners {
            let app = app.clone();
            let workers = workers.clone_senders();
            let cancel = cancel.clone();
            accepts.push(tokio::spawn(async move {
                accept_loop(listener, app, workers, cancel).await;
            }));
        }
        for accept in accepts {
            let _ = accept.await;
        }
        workers.join();
        Ok(())
    }
}

async fn accept_loop(
    listener: tokio::net::TcpListener,
    app: Arc<App>,
    workers: Vec<tokio::sync::mpsc::UnboundedSender<worker::WorkerMessage>>,
    cancel: CancellationToken,
) {
    use std::sync::atomic::Ordering;
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(%err, "accepting client connection");
                    continue;
                }
            },
            _ = cancel.cancelled() => return,
        };
        if app.connected.load(Ordering::Relaxed) >= app.cfg.max_clients {
            metrics::counter!("proxy_rejected_connections").increment(1);
            tracing::warn!(%peer, "rejecting connection: max clients reached");
            continue;
        }
        if let Err(err) = listener::set_client_socket_options(&stream, &app.cfg) {
            tracing::debug!(%err, %peer, "failed to set client socket options");
        }
        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(%err, %peer, "failed to detach client socket");
                continue;
            }
        };
        let id = app.next_client_id.fetch_add(1, Ordering::Relaxed);
        app.connected.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("proxy_connected_clients").increment(1);
        let target = (id % app.cfg.threads as u64) as usize;
        tracing::debug!(client = id, %peer, worker = target, "client connected");
        if workers[target]
            .send(worker::WorkerMessage::NewClient { id, peer, stream })
            .is_err()
        {
            // Worker is gone; we are shutting down.
            app.connected.fetch_sub(1, Ordering::Relaxed);
            metrics::gauge!("proxy_connected_clients").decrement(1);
            return;
        }
    }
}
