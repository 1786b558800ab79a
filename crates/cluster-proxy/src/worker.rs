use crate::client::{self, ClientHandle, ClientStatus};
use crate::pool::Pool;
use crate::request::{Request, RequestRef, RequestState};
use crate::{App, MultiplexingMode};
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub enum WorkerMessage {
    NewClient {
        id: u64,
        peer: SocketAddr,
        stream: std::net::TcpStream,
    },
}

/// The fixed set of worker threads. Each runs a single-threaded runtime
/// with a `LocalSet`: within one worker nothing runs concurrently with
/// anything else on that worker. The accept loop hands clients off over
/// each worker's channel.
pub struct WorkerPool {
    senders: Vec<mpsc::UnboundedSender<WorkerMessage>>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(app: &Arc<App>, cancel: CancellationToken) -> anyhow::Result<WorkerPool> {
        let mut senders = Vec::new();
        let mut handles = Vec::new();
        tracing::info!(threads = app.cfg.threads, "starting workers");
        for id in 0..app.cfg.threads {
            let (tx, rx) = mpsc::unbounded_channel();
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let app = app.clone();
            let cancel = cancel.clone();
            let handle = std::thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || {
                    let local = tokio::task::LocalSet::new();
                    local.block_on(&runtime, worker_main(id, app, rx, cancel));
                })?;
            senders.push(tx);
            handles.push(handle);
        }
        Ok(WorkerPool { senders, handles })
    }

    pub fn clone_senders(&self) -> Vec<mpsc::UnboundedSender<WorkerMessage>> {
        self.senders.clone()
    }

    pub fn join(self) {
        drop(self.senders);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

async fn worker_main(
    id: usize,
    app: Arc<App>,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    cancel: CancellationToken,
) {
    let worker = Rc::new(Worker {
        id,
        app: app.clone(),
        cancel: cancel.clone(),
        clients: RefCell::new(Vec::new()),
        shared: RefCell::new(None),
        next_request_id: Cell::new(0),
    });
    let shared = Pool::new_shared(app, Rc::downgrade(&worker), cancel.clone());
    *worker.shared.borrow_mut() = Some(shared.clone());
    Pool::spawn_dispatcher(shared);
    tracing::debug!(worker = id, "worker started");
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(WorkerMessage::NewClient { id, peer, stream }) => {
                    worker.register_client(id, peer, stream);
                }
                None => return,
            },
            _ = cancel.cancelled() => return,
        }
    }
}

pub struct Worker {
    pub id: usize,
    pub app: Arc<App>,
    pub cancel: CancellationToken,
    clients: RefCell<Vec<Rc<ClientHandle>>>,
    shared: RefCell<Option<Rc<Pool>>>,
    next_request_id: Cell<u64>,
}

impl Worker {
    pub fn shared_pool(&self) -> Rc<Pool> {
        self.shared
            .borrow()
            .clone()
            .expect("shared pool is set at worker startup")
    }

    fn fresh_request_id(&self) -> u64 {
        let id = self.next_request_id.get();
        self.next_request_id.set(id.wrapping_add(1));
        id
    }

    fn register_client(self: &Rc<Self>, id: u64, peer: SocketAddr, stream: std::net::TcpStream) {
        let stream = match tokio::net::TcpStream::from_std(stream) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(client = id, %err, "failed to adopt client socket");
                self.app.connected.fetch_sub(1, Ordering::Relaxed);
                metrics::gauge!("proxy_connected_clients").decrement(1);
                return;
            }
        };
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let client = Rc::new(ClientHandle {
            id,
            peer,
            worker_id: self.id,
            status: Cell::new(ClientStatus::None),
            out_tx,
            private_pool: RefCell::new(None),
            cancel: self.cancel.child_token(),
        });
        if self.app.cfg.multiplexing == MultiplexingMode::Always {
            self.create_private_pool(&client);
        }
        client.status.set(ClientStatus::Linked);
        self.clients.borrow_mut().push(client.clone());
        tracing::debug!(client = id, worker = self.id, "client linked");
        client::spawn(self.clone(), client, stream, out_rx);
    }

    fn create_private_pool(self: &Rc<Self>, client: &Rc<ClientHandle>) -> Rc<Pool> {
        tracing::debug!(client = client.id, "creating private connection pool");
        let private = Pool::new_private(
            self.app.clone(),
            self.app.topology.clone_private(),
            client.cancel.clone(),
        );
        Pool::spawn_dispatcher(private.clone());
        *client.private_pool.borrow_mut() = Some(private.clone());
        private
    }

    /// The auto-multiplexing check, run by the shared dispatcher before
    /// every drain: once either shared queue reaches the threshold, every
    /// client on this worker moves to a private pool.
    pub fn maybe_demote(self: &Rc<Self>) {
        if self.app.cfg.multiplexing != MultiplexingMode::Auto {
            return;
        }
        let shared = self.shared_pool();
        if !shared.queue_pressure() {
            return;
        }
        tracing::debug!(worker = self.id, "disabling multiplexing for this worker's clients");
        let clients: Vec<_> = self.clients.borrow().clone();
        for client in clients {
            let existing = client.private_pool.borrow().clone();
            let private = match existing {
                Some(private) => private,
                None => self.create_private_pool(&client),
            };
            shared.migrate_client_to(&client, &private);
        }
    }

    /// Route one parsed command and queue it on the client's pool. `prev`
    /// chains it to the preceding command of the same pipelined read.
    /// Rejections are answered directly and return `None`; they never
    /// terminate the client.
    pub fn process_request(
        self: &Rc<Self>,
        client: &Rc<ClientHandle>,
        frame: resp::RequestFrame,
        prev: Option<RequestRef>,
    ) -> Option<RequestRef> {
        if self.app.cfg.dump_queries {
            let args: Vec<String> = frame
                .args()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect();
            tracing::debug!(client = client.id, ?args, "query");
        }
        if frame.argc() == 0 {
            client.send_reply(resp::error_frame("Invalid request"));
            return None;
        }
        let pool = self.pool_for(client);
        let routed = match cluster_map::route_request(pool.routes().topology(), &frame) {
            Ok(routed) => routed,
            Err(err) => {
                tracing::debug!(client = client.id, %err, "rejecting request");
                client.send_reply(resp::error_frame(&err.to_string()));
                return None;
            }
        };
        let req = Rc::new(Request {
            id: self.fresh_request_id(),
            client: RefCell::new(Some(client.clone())),
            frame,
            command: routed.command,
            node: RefCell::new(routed.node),
            slot: routed.slot,
            owned_by_client: Cell::new(pool.is_private()),
            state: Cell::new(RequestState::Queued),
            retried: Cell::new(false),
            link: RefCell::new(None),
            prev: RefCell::new(prev.as_ref().map(Rc::downgrade)),
            next: RefCell::new(None),
        });
        if let Some(prev) = prev {
            *prev.next.borrow_mut() = Some(Rc::downgrade(&req));
        }
        metrics::counter!("proxy_requests_routed").increment(1);
        tracing::debug!(
            client = client.id,
            request = req.id,
            command = req.command.name,
            slot = req.slot,
            "request routed"
        );
        pool.enqueue(req.clone());
        Some(req)
    }

    fn pool_for(&self, client: &Rc<ClientHandle>) -> Rc<Pool> {
        client
            .private_pool
            .borrow()
            .clone()
            .unwrap_or_else(|| self.shared_pool())
    }

    /// Free a client: stop its tasks, drop its unwritten requests, and
    /// orphan the in-flight ones so their replies are consumed and
    /// discarded without disturbing the shared links.
    pub fn teardown_client(self: &Rc<Self>, client: &Rc<ClientHandle>) {
        if client.status.replace(ClientStatus::Unlinked) == ClientStatus::Unlinked {
            return;
        }
        tracing::debug!(client = client.id, worker = self.id, "freeing client");
        client.cancel.cancel();
        self.clients.borrow_mut().retain(|c| !Rc::ptr_eq(c, client));
        self.shared_pool().purge_client(client.id);
        if let Some(private) = client.private_pool.borrow().clone() {
            private.purge_client(client.id);
        }
        self.app.connected.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!("proxy_connected_clients").decrement(1);
    }
}
