use crate::client::ClientHandle;
use crate::conn;
use crate::request::{RequestRef, RequestState};
use crate::worker::Worker;
use crate::App;
use bytes::{Bytes, BytesMut};
use cluster_map::{Node, Topology};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Which slot map a pool routes against: the worker-shared topology, or a
/// client's private deep clone.
pub enum Routes {
    Shared(Arc<Topology>),
    Private(Topology),
}

impl Routes {
    pub fn topology(&self) -> &Topology {
        match self {
            Routes::Shared(topology) => topology,
            Routes::Private(topology) => topology,
        }
    }
}

/// One live backend connection. The pool's dispatcher is the only writer;
/// a dedicated task reads replies from the other half.
pub struct Link {
    node: Arc<Node>,
    writer: RefCell<OwnedWriteHalf>,
}

/// Errors that end a request, with their on-wire surface.
#[derive(Debug, Clone, Copy)]
pub enum DispatchError {
    Connect,
    Write,
    Reset,
    ReplyFraming,
}

impl DispatchError {
    fn wire_message(self) -> &'static str {
        match self {
            DispatchError::Connect => "Could not connect to node",
            DispatchError::Write => "Failed to write to cluster",
            DispatchError::Reset => "Cluster node disconnected",
            DispatchError::ReplyFraming => "Failed to get reply",
        }
    }
}

enum SendFailure {
    Dial,
    Write(Rc<Link>),
}

/// A connection pool: the `to_send` queue of routed requests, the
/// `pending` queue of written requests awaiting replies, and the lazily
/// dialed per-node links. One shared pool per worker; demoted clients own
/// a private one with a cloned topology.
pub struct Pool {
    app: Arc<App>,
    routes: Routes,
    /// Present on the shared pool only; lets the dispatcher run the
    /// demotion-policy check on its worker before each drain.
    worker: Weak<Worker>,
    inner: RefCell<PoolInner>,
    kick: Notify,
    cancel: CancellationToken,
}

struct PoolInner {
    to_send: VecDeque<RequestRef>,
    pending: VecDeque<RequestRef>,
    links: HashMap<String, Rc<Link>>,
}

impl Pool {
    pub fn new_shared(
        app: Arc<App>,
        worker: Weak<Worker>,
        cancel: CancellationToken,
    ) -> Rc<Pool> {
        let topology = app.topology.clone();
        Rc::new(Pool {
            app,
            routes: Routes::Shared(topology),
            worker,
            inner: RefCell::new(PoolInner::default()),
            kick: Notify::new(),
            cancel,
        })
    }

    pub fn new_private(app: Arc<App>, topology: Topology, cancel: CancellationToken) -> Rc<Pool> {
        Rc::new(Pool {
            app,
            routes: Routes::Private(topology),
            worker: Weak::new(),
            inner: RefCell::new(PoolInner::default()),
            kick: Notify::new(),
            cancel,
        })
    }

    pub fn is_private(&self) -> bool {
        matches!(self.routes, Routes::Private(_))
    }

    pub fn routes(&self) -> &Routes {
        &self.routes
    }

    pub fn spawn_dispatcher(pool: Rc<Pool>) {
        tokio::task::spawn_local(async move { pool.run_dispatcher().await });
    }

    /// Queue a routed request and give the dispatcher its immediate send
    /// attempt.
    pub fn enqueue(&self, req: RequestRef) {
        self.inner.borrow_mut().to_send.push_back(req);
        self.kick.notify_one();
    }

    /// Whether either queue reached the auto-demotion threshold.
    pub fn queue_pressure(&self) -> bool {
        let inner = self.inner.borrow();
        inner.to_send.len() >= crate::DEMOTE_QUEUE_LEN
            || inner.pending.len() >= crate::DEMOTE_QUEUE_LEN
    }

    async fn run_dispatcher(self: Rc<Self>) {
        loop {
            if let Some(worker) = self.worker.upgrade() {
                worker.maybe_demote();
            }
            self.drain().await;
            tokio::select! {
                _ = self.kick.notified() => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    /// Send queued requests in FIFO order. Writes are whole-request and
    /// sequential, so two clients' bytes never interleave on a link, and a
    /// pipelined chain releases the link after every command.
    async fn drain(self: &Rc<Self>) {
        loop {
            let Some(req) = self.inner.borrow().to_send.front().cloned() else {
                return;
            };
            req.state.set(RequestState::Writing);
            let node = req.node.borrow().clone();
            match self.write_request(&req, &node).await {
                Ok(link) => {
                    let mut inner = self.inner.borrow_mut();
                    if let Some(at) = inner.to_send.iter().position(|r| Rc::ptr_eq(r, &req)) {
                        inner.to_send.remove(at);
                    }
                    req.state.set(RequestState::Pending);
                    *req.link.borrow_mut() = Some(link);
                    inner.pending.push_back(req);
                }
                Err(SendFailure::Dial) => {
                    // A replayed request whose reconnect fails reports the
                    // lost node, not a plain connect failure.
                    let error = if req.retried.get() {
                        DispatchError::Reset
                    } else {
                        DispatchError::Connect
                    };
                    self.remove_from_to_send(&req);
                    self.finish(req, Err(error));
                }
                Err(SendFailure::Write(link)) => {
                    self.remove_link(&link);
                    if req.retried.get() {
                        self.remove_from_to_send(&req);
                        self.finish(req, Err(DispatchError::Write));
                    } else {
                        // Replay over a fresh connection, once.
                        req.retried.set(true);
                        req.state.set(RequestState::Queued);
                    }
                }
            }
        }
    }

    async fn write_request(
        self: &Rc<Self>,
        req: &RequestRef,
        node: &Arc<Node>,
    ) -> Result<Rc<Link>, SendFailure> {
        let link = match self.link_for(node).await {
            Ok(link) => link,
            Err(err) => {
                tracing::debug!(node = %node, %err, "failed to connect to node");
                return Err(SendFailure::Dial);
            }
        };
        let written = {
            let mut writer = link.writer.borrow_mut();
            writer.write_all(&req.frame.buffer).await
        };
        match written {
            Ok(()) => {
                tracing::debug!(request = req.id, node = %node, "request written to cluster");
                Ok(link)
            }
            Err(err) => {
                tracing::debug!(request = req.id, node = %node, %err, "error writing to cluster");
                Err(SendFailure::Write(link))
            }
        }
    }

    /// The link for `node`, dialing it on first use.
    async fn link_for(self: &Rc<Self>, node: &Arc<Node>) -> std::io::Result<Rc<Link>> {
        if let Some(link) = self.inner.borrow().links.get(node.name.as_str()).cloned() {
            return Ok(link);
        }
        let stream = conn::dial(node, &self.app.cfg).await?;
        let (read_half, write_half) = stream.into_split();
        let link = Rc::new(Link {
            node: node.clone(),
            writer: RefCell::new(write_half),
        });
        self.inner
            .borrow_mut()
            .links
            .insert(node.name.clone(), link.clone());
        let pool = self.clone();
        let reader_link = link.clone();
        tokio::task::spawn_local(async move {
            run_reader(pool, reader_link, read_half).await;
        });
        Ok(link)
    }

    /// Hand a complete raw reply to the oldest request written on `link`.
    fn complete_oldest(self: &Rc<Self>, link: &Rc<Link>, bytes: Bytes) {
        let req = {
            let mut inner = self.inner.borrow_mut();
            let at = inner
                .pending
                .iter()
                .position(|r| r.written_on(link));
            at.and_then(|at| inner.pending.remove(at))
        };
        match req {
            Some(req) => self.finish(req, Ok(bytes)),
            None => {
                tracing::warn!(node = %link.node, "dropping reply with no pending request");
            }
        }
    }

    /// The backend side of `link` died. Requests written on it that have
    /// not been replayed yet go back to the head of `to_send` in order;
    /// requests failing a second time are answered with an error.
    fn handle_transport_reset(self: &Rc<Self>, link: &Rc<Link>) {
        metrics::counter!("proxy_backend_resets").increment(1);
        self.remove_link(link);
        let mut retryable = Vec::new();
        let mut dead = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            inner.pending.retain(|req| {
                if !req.written_on(link) {
                    return true;
                }
                req.link.borrow_mut().take();
                if req.client.borrow().is_none() {
                    // Orphaned: its client is gone, nothing to replay for.
                    req.state.set(RequestState::Done);
                    req.unlink_chain();
                } else if req.retried.get() {
                    dead.push(req.clone());
                } else {
                    retryable.push(req.clone());
                }
                false
            });
            for req in retryable.iter().rev() {
                req.retried.set(true);
                req.state.set(RequestState::Queued);
                inner.to_send.push_front(req.clone());
            }
        }
        for req in dead {
            self.finish(req, Err(DispatchError::Reset));
        }
        self.kick.notify_one();
    }

    /// The reply stream on `link` is unparseable. The oldest request gets
    /// the framing error; the stream cannot be trusted afterwards, so the
    /// link resets and the remaining in-flight requests take the replay
    /// path.
    fn handle_reply_framing_error(self: &Rc<Self>, link: &Rc<Link>) {
        let req = {
            let mut inner = self.inner.borrow_mut();
            let at = inner.pending.iter().position(|r| r.written_on(link));
            at.and_then(|at| inner.pending.remove(at))
        };
        if let Some(req) = req {
            self.finish(req, Err(DispatchError::ReplyFraming));
        }
        self.handle_transport_reset(link);
    }

    /// Deliver the outcome and free the request. A request whose client is
    /// gone consumes its reply silently, keeping the link's reply stream
    /// aligned for the other multiplexed clients.
    fn finish(&self, req: RequestRef, outcome: Result<Bytes, DispatchError>) {
        req.state.set(RequestState::Done);
        req.link.borrow_mut().take();
        req.unlink_chain();
        let client = req.client.borrow_mut().take();
        let Some(client) = client else { return };
        match outcome {
            Ok(bytes) => client.send_reply(bytes),
            Err(err) => {
                tracing::debug!(request = req.id, client = client.id, ?err, "request failed");
                client.send_reply(resp::error_frame(err.wire_message()));
            }
        }
    }

    fn remove_from_to_send(&self, req: &RequestRef) {
        let mut inner = self.inner.borrow_mut();
        if let Some(at) = inner.to_send.iter().position(|r| Rc::ptr_eq(r, req)) {
            inner.to_send.remove(at);
        }
    }

    fn remove_link(&self, link: &Rc<Link>) {
        let mut inner = self.inner.borrow_mut();
        if let Some(current) = inner.links.get(link.node.name.as_str()) {
            if Rc::ptr_eq(current, link) {
                inner.links.remove(link.node.name.as_str());
            }
        }
    }

    /// Remove a dead client's unwritten requests and orphan the rest.
    pub fn purge_client(&self, client_id: u64) {
        let mut inner = self.inner.borrow_mut();
        inner.to_send.retain(|req| {
            if req.owner_id() != Some(client_id) {
                return true;
            }
            if req.state.get() == RequestState::Queued {
                req.state.set(RequestState::Done);
                req.client.borrow_mut().take();
                req.unlink_chain();
                return false;
            }
            // Mid-write: the bytes are already (partially) on the wire, so
            // the request must stay and its reply be consumed.
            req.client.borrow_mut().take();
            true
        });
        for req in inner.pending.iter() {
            if req.owner_id() == Some(client_id) {
                req.client.borrow_mut().take();
            }
        }
    }

    /// Demotion: move this client's demotable queued requests onto its
    /// private pool, rebinding each onto the equally-named private node.
    /// A request whose pipelined chain has a member in flight on the
    /// shared pool stays put, so a chain never straddles pools. Requests
    /// already written stay too; their replies are awaited here.
    pub fn migrate_client_to(&self, client: &Rc<ClientHandle>, private: &Rc<Pool>) {
        let mut moved = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            inner.to_send.retain(|req| {
                let demotable = req.owner_id() == Some(client.id)
                    && req.state.get() == RequestState::Queued
                    && !req.chain_in_flight_upstream();
                if demotable {
                    moved.push(req.clone());
                }
                !demotable
            });
        }
        for req in moved {
            let name = req.node_name();
            match private.routes.topology().node_of_name(&name) {
                Some(node) => {
                    *req.node.borrow_mut() = node.clone();
                    req.owned_by_client.set(true);
                    private.inner.borrow_mut().to_send.push_back(req);
                }
                None => {
                    // No private counterpart; leave it on the shared pool.
                    self.inner.borrow_mut().to_send.push_back(req);
                }
            }
        }
        private.kick.notify_one();
    }
}

impl Default for PoolInner {
    fn default() -> Self {
        PoolInner {
            to_send: VecDeque::new(),
            pending: VecDeque::new(),
            links: HashMap::new(),
        }
    }
}

/// Read raw reply bytes off one link and deliver complete frames, in
/// order, to the requests written on it.
async fn run_reader(pool: Rc<Pool>, link: Rc<Link>, mut read_half: OwnedReadHalf) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        let read = tokio::select! {
            read = read_half.read_buf(&mut buf) => read,
            _ = pool.cancel.cancelled() => return,
        };
        match read {
            Ok(0) => {
                tracing::debug!(node = %link.node, "node closed the connection");
                pool.handle_transport_reset(&link);
                return;
            }
            Err(err) => {
                tracing::debug!(node = %link.node, %err, "error reading from node");
                pool.handle_transport_reset(&link);
                return;
            }
            Ok(_) => {}
        }
        loop {
            match resp::reply_frame_len(&buf) {
                Ok(Some(len)) => {
                    let bytes = buf.split_to(len).freeze();
                    pool.complete_oldest(&link, bytes);
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(node = %link.node, %err, "unparseable reply from node");
                    pool.handle_reply_framing_error(&link);
                    return;
                }
            }
        }
    }
}
