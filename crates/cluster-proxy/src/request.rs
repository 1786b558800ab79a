use crate::client::ClientHandle;
use cluster_map::{CommandDef, Node};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;

pub type RequestRef = Rc<Request>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Routed and queued on `to_send`.
    Queued,
    /// The dispatcher is writing it to the backend.
    Writing,
    /// Fully written; its reply is awaited.
    Pending,
    /// Reply delivered or request failed.
    Done,
}

/// One routed command from one client. The frame's buffer holds the exact
/// bytes that go to the backend.
pub struct Request {
    pub id: u64,
    /// Cleared when the owning client goes away; the reply is then read
    /// and dropped to keep the backend stream in sync.
    pub client: RefCell<Option<Rc<ClientHandle>>>,
    pub frame: resp::RequestFrame,
    pub command: &'static CommandDef,
    /// Rebound onto the private clone when the client is demoted.
    pub node: RefCell<Arc<Node>>,
    pub slot: Option<u16>,
    pub owned_by_client: Cell<bool>,
    pub state: Cell<RequestState>,
    /// Set when the request has been replayed after a transport failure.
    pub retried: Cell<bool>,
    /// The backend link this request was written on, while pending.
    pub link: RefCell<Option<Rc<crate::pool::Link>>>,
    /// Links to the neighbouring commands this one was pipelined with.
    pub prev: RefCell<Option<Weak<Request>>>,
    pub next: RefCell<Option<Weak<Request>>>,
}

impl Request {
    pub fn written_on(&self, link: &Rc<crate::pool::Link>) -> bool {
        self.link
            .borrow()
            .as_ref()
            .map(|l| Rc::ptr_eq(l, link))
            .unwrap_or(false)
    }

    pub fn owner_id(&self) -> Option<u64> {
        self.client.borrow().as_ref().map(|c| c.id)
    }

    pub fn node_name(&self) -> String {
        self.node.borrow().name.clone()
    }

    /// Whether any earlier member of this request's pipelined chain is
    /// currently in flight on a shared pool. Such a request must not be
    /// demoted: a chain never straddles two pools.
    pub fn chain_in_flight_upstream(&self) -> bool {
        let mut cursor = self.prev.borrow().clone();
        while let Some(weak) = cursor {
            let Some(prev) = weak.upgrade() else { break };
            if !prev.owned_by_client.get()
                && matches!(
                    prev.state.get(),
                    RequestState::Writing | RequestState::Pending
                )
            {
                return true;
            }
            cursor = prev.prev.borrow().clone();
        }
        false
    }

    /// Unlink from the pipelined chain on destruction, keeping the
    /// neighbours joined.
    pub fn unlink_chain(self: &Rc<Self>) {
        let prev = self.prev.borrow_mut().take();
        let next = self.next.borrow_mut().take();
        if let Some(next) = next.as_ref().and_then(Weak::upgrade) {
            *next.prev.borrow_mut() = prev.clone();
        }
        if let Some(prev) = prev.and_then(|w| w.upgrade()) {
            *prev.next.borrow_mut() = next;
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("client", &self.owner_id())
            .field("command", &self.command.name)
            .field("slot", &self.slot)
            .field("state", &self.state.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_map::{lookup_command, Role};

    fn frame() -> resp::RequestFrame {
        let mut parser = resp::RequestParser::new();
        parser
            .read_buf()
            .extend_from_slice(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
        parser.next().unwrap().unwrap()
    }

    fn node() -> Arc<Node> {
        Arc::new(Node {
            name: "node-1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 7001,
            role: Role::Primary,
            slots: Vec::new(),
            migrating: Vec::new(),
            importing: Vec::new(),
            clone_of: None,
        })
    }

    fn request(id: u64) -> RequestRef {
        Rc::new(Request {
            id,
            client: RefCell::new(None),
            frame: frame(),
            command: lookup_command("get").unwrap(),
            node: RefCell::new(node()),
            slot: Some(1),
            owned_by_client: Cell::new(false),
            state: Cell::new(RequestState::Queued),
            retried: Cell::new(false),
            link: RefCell::new(None),
            prev: RefCell::new(None),
            next: RefCell::new(None),
        })
    }

    fn chain(prev: &RequestRef, next: &RequestRef) {
        *next.prev.borrow_mut() = Some(Rc::downgrade(prev));
        *prev.next.borrow_mut() = Some(Rc::downgrade(next));
    }

    #[test]
    fn test_chain_in_flight_upstream() {
        let (a, b, c) = (request(0), request(1), request(2));
        chain(&a, &b);
        chain(&b, &c);
        assert!(!c.chain_in_flight_upstream());

        a.state.set(RequestState::Pending);
        assert!(c.chain_in_flight_upstream());
        assert!(b.chain_in_flight_upstream());

        // A member already demoted does not hold its successors back.
        a.owned_by_client.set(true);
        assert!(!c.chain_in_flight_upstream());
    }

    #[test]
    fn test_unlink_chain_keeps_neighbours_joined() {
        let (a, b, c) = (request(0), request(1), request(2));
        chain(&a, &b);
        chain(&b, &c);
        b.unlink_chain();

        let a_next = a.next.borrow().clone().unwrap().upgrade().unwrap();
        assert!(Rc::ptr_eq(&a_next, &c));
        let c_prev = c.prev.borrow().clone().unwrap().upgrade().unwrap();
        assert!(Rc::ptr_eq(&c_prev, &a));
        assert!(b.prev.borrow().is_none());
        assert!(b.next.borrow().is_none());
    }
}
