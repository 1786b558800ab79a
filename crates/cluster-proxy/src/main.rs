use anyhow::Context;
use clap::Parser;
use cluster_map::{fetch_topology, EntryAddress, Topology, SLOT_COUNT};
use cluster_proxy::logging::{self, LogLevel};
use cluster_proxy::{Listeners, MultiplexingMode, Proxy, ProxyConfig};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MAX_THREADS: usize = 500;

/// A transparent proxy for sharded RESP back ends: clients connect as if
/// to a single server and every command is forwarded to the shard owning
/// its key slot.
#[derive(Debug, Parser)]
#[command(name = "cluster-proxy", version)]
struct Cli {
    /// Port to listen on.
    #[arg(short = 'p', long, default_value_t = 7777)]
    port: u16,

    /// Maximum number of simultaneous clients.
    #[arg(long, default_value_t = 10_000_000)]
    max_clients: u64,

    /// Number of worker threads.
    #[arg(long, default_value_t = 8, env = "PROXY_THREADS")]
    threads: usize,

    /// Keep-alive probe time for client sockets, in seconds; 0 disables.
    #[arg(long = "tcpkeepalive", default_value_t = 300)]
    tcp_keepalive: u64,

    /// Run in the background, detached from the terminal.
    #[arg(long)]
    daemonize: bool,

    /// When multiplexing should be disabled.
    #[arg(long = "disable-multiplexing", value_enum, default_value_t = MultiplexingMode::Auto)]
    disable_multiplexing: MultiplexingMode,

    /// Authentication secret for the back-end nodes.
    #[arg(short = 'a', long, env = "PROXY_AUTH")]
    auth: Option<String>,

    /// Disable colorized log output.
    #[arg(long)]
    disable_colors: bool,

    /// Minimum log level.
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Dump request arguments (only for log-level 'debug').
    #[arg(long)]
    dump_queries: bool,

    /// Dump raw request buffers (only for log-level 'debug').
    #[arg(long)]
    dump_buffer: bool,

    /// Cluster entry address: host:port, :port, or a UNIX socket path.
    cluster_address: String,
}

fn main() -> anyhow::Result<()> {
    // Config errors exit 1 with usage; --help and --version exit 0.
    let mut cli = Cli::try_parse().unwrap_or_else(|err| {
        let code = if err.use_stderr() { 1 } else { 0 };
        let _ = err.print();
        std::process::exit(code);
    });
    logging::install(cli.log_level, !cli.disable_colors);

    if cli.threads > MAX_THREADS {
        tracing::warn!("maximum threads allowed: {MAX_THREADS}");
        cli.threads = MAX_THREADS;
    } else if cli.threads < 1 {
        cli.threads = 1;
    }

    tracing::info!("cluster-proxy v{}", env!("CARGO_PKG_VERSION"));
    let entry: EntryAddress = cli
        .cluster_address
        .parse()
        .with_context(|| format!("invalid cluster address '{}'", cli.cluster_address))?;
    tracing::info!(cluster = %entry, "fetching cluster configuration");
    let topology = fetch_topology(&entry, cli.auth.as_deref())
        .context("failed to fetch cluster configuration")?;
    summarize_topology(&topology);

    let listeners = Listeners::bind(cli.port)
        .with_context(|| format!("failed to listen on port {}", cli.port))?;
    tracing::info!(port = cli.port, "listening");

    if cli.daemonize {
        daemonize();
    }

    let cfg = ProxyConfig {
        max_clients: cli.max_clients,
        threads: cli.threads,
        tcp_keepalive: (cli.tcp_keepalive > 0).then(|| Duration::from_secs(cli.tcp_keepalive)),
        multiplexing: cli.disable_multiplexing,
        auth: cli.auth,
        dump_queries: cli.dump_queries,
        dump_buffer: cli.dump_buffer,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received interrupt, shutting down");
                on_signal.cancel();
            }
        });
        let proxy = Proxy::start(cfg, topology, listeners, cancel)?;
        proxy.serve().await
    })
}

fn summarize_topology(topology: &Topology) {
    let masters = topology.nodes().iter().filter(|n| !n.is_replica()).count();
    let replicas = topology.nodes().len() - masters;
    tracing::info!("cluster has {masters} master(s) and {replicas} replica(s)");
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    let mut last_owner: Option<&str> = None;
    for slot in 0..SLOT_COUNT {
        match topology.node_of_slot(slot) {
            None => {
                tracing::debug!(slot, "slot has no owner");
                return;
            }
            Some(node) => {
                if last_owner != Some(node.name.as_str()) {
                    tracing::debug!(slot, node = %node, "slot range starts");
                    last_owner = Some(node.name.as_str());
                }
            }
        }
    }
}

/// Detach from the controlling terminal: fork, start a new session, and
/// point the standard streams at /dev/null.
fn daemonize() {
    // SAFETY: runs before any thread or runtime is started.
    unsafe {
        if libc::fork() != 0 {
            std::process::exit(0);
        }
        libc::setsid();
        let fd = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
        if fd != -1 {
            libc::dup2(fd, libc::STDIN_FILENO);
            libc::dup2(fd, libc::STDOUT_FILENO);
            libc::dup2(fd, libc::STDERR_FILENO);
            if fd > libc::STDERR_FILENO {
                libc::close(fd);
            }
        }
    }
}
