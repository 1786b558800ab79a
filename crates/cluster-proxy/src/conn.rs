use crate::ProxyConfig;
use cluster_map::Node;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Keep-alive probe time for backend links. Aggressive on purpose: long
/// commands must not look like dead peers, and real failures should be
/// noticed quickly.
const NODE_KEEPALIVE: Duration = Duration::from_secs(15);

/// Open a connection to a backend node: TCP_NODELAY, keep-alive, and the
/// `AUTH` handshake when a secret is configured. Any failure leaves no
/// connection behind.
pub async fn dial(node: &Node, cfg: &ProxyConfig) -> io::Result<TcpStream> {
    tracing::debug!(node = %node, "connecting to node");
    let stream = TcpStream::connect((node.host.as_str(), node.port)).await?;
    stream.set_nodelay(true)?;
    set_keepalive(&stream, NODE_KEEPALIVE)?;
    let mut stream = stream;
    if let Some(secret) = cfg.auth.as_deref() {
        authenticate(&mut stream, secret).await.map_err(|err| {
            tracing::error!(node = %node, %err, "failed to authenticate to node");
            err
        })?;
    }
    Ok(stream)
}

async fn authenticate(stream: &mut TcpStream, secret: &str) -> io::Result<()> {
    stream
        .write_all(&resp::encode_command(&[b"AUTH", secret.as_bytes()]))
        .await?;
    let mut reply = Vec::new();
    loop {
        match resp::reply_frame_len(&reply) {
            Ok(Some(_)) => break,
            Ok(None) => {}
            Err(_) => return Err(io::Error::other("malformed AUTH reply")),
        }
        let mut chunk = [0u8; 256];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        reply.extend_from_slice(&chunk[..n]);
    }
    if reply.first() == Some(&b'-') {
        return Err(io::Error::other("node refused AUTH"));
    }
    Ok(())
}

pub fn set_keepalive(stream: &TcpStream, time: Duration) -> io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(time)
        .with_interval(time / 3);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
