use crate::{Topology, TopologyError};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

/// Where to learn the cluster layout from: `host:port`, `:port` (meaning
/// localhost), or a UNIX socket path.
#[derive(Debug, Clone)]
pub enum EntryAddress {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl std::str::FromStr for EntryAddress {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((host, port)) = s.split_once(':') else {
            return Ok(EntryAddress::Unix {
                path: PathBuf::from(s),
            });
        };
        let host = if host.is_empty() { "localhost" } else { host };
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|&p| p != 0)
            .ok_or_else(|| BootstrapError::InvalidAddress(s.to_string()))?;
        Ok(EntryAddress::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for EntryAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryAddress::Tcp { host, port } => write!(f, "{host}:{port}"),
            EntryAddress::Unix { path } => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("invalid cluster address '{0}'")]
    InvalidAddress(String),
    #[error("could not connect to {0}")]
    Connect(String, #[source] std::io::Error),
    #[error("i/o error talking to the entry node")]
    Io(#[from] std::io::Error),
    #[error("entry node closed the connection")]
    UnexpectedEof,
    #[error("entry node replied with error: {0}")]
    Server(String),
    #[error("malformed reply from entry node")]
    BadReply,
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Fetch the cluster layout from the entry node, blocking. Runs once at
/// startup, before any worker exists.
pub fn fetch_topology(
    entry: &EntryAddress,
    auth: Option<&str>,
) -> Result<Topology, BootstrapError> {
    tracing::debug!(entry = %entry, "fetching cluster configuration");
    match entry {
        EntryAddress::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port))
                .map_err(|err| BootstrapError::Connect(entry.to_string(), err))?;
            fetch_over(stream, entry, auth)
        }
        EntryAddress::Unix { path } => {
            let stream = UnixStream::connect(path)
                .map_err(|err| BootstrapError::Connect(entry.to_string(), err))?;
            fetch_over(stream, entry, auth)
        }
    }
}

fn fetch_over(
    mut stream: impl Read + Write,
    entry: &EntryAddress,
    auth: Option<&str>,
) -> Result<Topology, BootstrapError> {
    if let Some(secret) = auth {
        let reply = exchange(&mut stream, &[b"AUTH", secret.as_bytes()])?;
        if reply.first() == Some(&b'-') {
            return Err(BootstrapError::Server(error_text(&reply)));
        }
    }
    let reply = exchange(&mut stream, &[b"CLUSTER", b"NODES"])?;
    let payload = match reply.first() {
        Some(b'-') => return Err(BootstrapError::Server(error_text(&reply))),
        Some(b'$') => bulk_payload(&reply).ok_or(BootstrapError::BadReply)?,
        _ => return Err(BootstrapError::BadReply),
    };
    let text = std::str::from_utf8(payload).map_err(|_| BootstrapError::BadReply)?;
    let entry_addr = match entry {
        EntryAddress::Tcp { host, port } => Some((host.as_str(), *port)),
        EntryAddress::Unix { .. } => None,
    };
    Ok(Topology::from_nodes_reply(text, entry_addr)?)
}

/// Write one command and read back exactly one reply frame.
fn exchange(
    stream: &mut (impl Read + Write),
    args: &[&[u8]],
) -> Result<Vec<u8>, BootstrapError> {
    stream.write_all(&resp::encode_command(args))?;
    let mut reply = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match resp::reply_frame_len(&reply) {
            Ok(Some(len)) => {
                reply.truncate(len);
                return Ok(reply);
            }
            Ok(None) => {}
            Err(_) => return Err(BootstrapError::BadReply),
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(BootstrapError::UnexpectedEof);
        }
        reply.extend_from_slice(&chunk[..n]);
    }
}

fn bulk_payload(reply: &[u8]) -> Option<&[u8]> {
    let header_end = reply.windows(2).position(|w| w == b"\r\n")? + 2;
    if reply.starts_with(b"$-") || reply.len() < header_end + 2 {
        return None;
    }
    Some(&reply[header_end..reply.len() - 2])
}

fn error_text(reply: &[u8]) -> String {
    let text = &reply[1..];
    let text = text.strip_suffix(b"\r\n").unwrap_or(text);
    String::from_utf8_lossy(text).into_owned()
}
