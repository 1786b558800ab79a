use crate::pool::Pool;
use crate::request::RequestRef;
use crate::worker::Worker;
use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bytes read from a client socket per read.
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    None,
    Linked,
    Unlinked,
}

/// Worker-local handle to one connected client. Replies are pushed onto
/// `out_tx` as raw frames and flushed by the client's writer task.
pub struct ClientHandle {
    pub id: u64,
    pub peer: SocketAddr,
    pub worker_id: usize,
    pub status: Cell<ClientStatus>,
    pub out_tx: mpsc::UnboundedSender<Bytes>,
    /// Set once the client is demoted off the shared pool; a demoted
    /// client stays private for the rest of its life.
    pub private_pool: RefCell<Option<Rc<Pool>>>,
    pub cancel: CancellationToken,
}

impl ClientHandle {
    pub fn send_reply(&self, bytes: Bytes) {
        // A send failure means the writer is gone and the client is being
        // torn down; the reply is dropped with it.
        let _ = self.out_tx.send(bytes);
    }
}

pub fn spawn(
    worker: Rc<Worker>,
    client: Rc<ClientHandle>,
    stream: TcpStream,
    out_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    let (read_half, write_half) = stream.into_split();
    {
        let worker = worker.clone();
        let client = client.clone();
        tokio::task::spawn_local(async move {
            run_reader(worker, client, read_half).await;
        });
    }
    tokio::task::spawn_local(async move {
        run_writer(worker, client, write_half, out_rx).await;
    });
}

/// Read, parse, and route the client's commands. Commands split out of a
/// single buffer form a pipelined chain, linked prev/next.
async fn run_reader(worker: Rc<Worker>, client: Rc<ClientHandle>, mut read_half: OwnedReadHalf) {
    let mut parser = resp::RequestParser::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    // The previous emitted request, when the buffer still held more bytes
    // after it: the next command completes the chain.
    let mut chain: Option<RequestRef> = None;
    loop {
        let read = tokio::select! {
            read = read_half.read(&mut chunk) => read,
            _ = client.cancel.cancelled() => return,
        };
        match read {
            Ok(0) => {
                tracing::debug!(client = client.id, peer = %client.peer, "client closed connection");
                worker.teardown_client(&client);
                return;
            }
            Err(err) => {
                tracing::debug!(client = client.id, peer = %client.peer, %err, "error reading from client");
                worker.teardown_client(&client);
                return;
            }
            Ok(n) => parser.read_buf().extend_from_slice(&chunk[..n]),
        }
        if worker.app.cfg.dump_buffer {
            tracing::debug!(
                client = client.id,
                buffer = %String::from_utf8_lossy(parser.read_buf()),
                "client buffer"
            );
        }
        loop {
            match parser.next() {
                Ok(Some(frame)) => {
                    let more_buffered = parser.buffered() > 0;
                    let prev = chain.take();
                    let req = worker.process_request(&client, frame, prev);
                    if more_buffered {
                        chain = req;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(client = client.id, %err, "invalid request");
                    client.send_reply(resp::error_frame("Invalid request"));
                    parser.reset();
                    chain = None;
                    break;
                }
            }
        }
    }
}

/// Flush reply frames back to the client socket, in the order the
/// dispatch engine produced them.
async fn run_writer(
    worker: Rc<Worker>,
    client: Rc<ClientHandle>,
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    loop {
        let bytes = tokio::select! {
            bytes = out_rx.recv() => bytes,
            _ = client.cancel.cancelled() => return,
        };
        let Some(bytes) = bytes else { return };
        if let Err(err) = write_half.write_all(&bytes).await {
            tracing::debug!(client = client.id, %err, "error writing to client");
            worker.teardown_client(&client);
            return;
        }
    }
}
