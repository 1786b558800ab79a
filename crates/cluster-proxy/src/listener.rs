use crate::ProxyConfig;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

const TCP_BACKLOG: i32 = 511;

/// The proxy's bound listening sockets, still in std form so they can be
/// carried across daemonization and into the runtime.
pub struct Listeners {
    sockets: Vec<std::net::TcpListener>,
}

impl Listeners {
    /// Bind IPv6 and IPv4 listeners on `port`. A family the host does not
    /// support is skipped with a warning; at least one bind must succeed.
    /// With port 0 the IPv4 socket reuses whatever ephemeral port the
    /// first bind was assigned.
    pub fn bind(port: u16) -> io::Result<Listeners> {
        let mut sockets = Vec::new();
        let mut port = port;
        match bind_one(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))) {
            Ok(socket) => {
                port = socket.local_addr()?.port();
                sockets.push(socket);
            }
            Err(err) => warn_family("IPv6", err),
        }
        match bind_one(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))) {
            Ok(socket) => sockets.push(socket),
            Err(err) if sockets.is_empty() => {
                warn_family("IPv4", err);
                return Err(io::Error::other("no address family available"));
            }
            Err(err) => warn_family("IPv4", err),
        }
        Ok(Listeners { sockets })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect()
    }

    /// Register the sockets with the current tokio runtime.
    pub fn into_tokio(self) -> io::Result<Vec<tokio::net::TcpListener>> {
        self.sockets
            .into_iter()
            .map(tokio::net::TcpListener::from_std)
            .collect()
    }
}

fn bind_one(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        // Keep the families separate so the v4 bind below succeeds too.
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(TCP_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn warn_family(family: &str, err: io::Error) {
    tracing::warn!(%err, "not listening on {family}");
}

/// Options every accepted client socket gets, mirroring what the backend
/// links use: no Nagle delay, and keep-alive probes when configured.
pub fn set_client_socket_options(
    stream: &tokio::net::TcpStream,
    cfg: &ProxyConfig,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    if let Some(time) = cfg.tcp_keepalive {
        crate::conn::set_keepalive(stream, time)?;
    }
    Ok(())
}
