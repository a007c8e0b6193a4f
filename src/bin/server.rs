use bytes::BytesMut;
use clap::Parser;
use dashmap::DashMap;
use feox_reactor::{
    Action, Config, Conn, ConnWaker, EventHandler, Input, LoadBalance, Options, Server,
    ServerInfo,
};
use memchr::memchr;
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address, e.g. tcp://127.0.0.1:6380 or unix:///tmp/feox.sock (repeatable)
    #[arg(short, long = "addr")]
    addrs: Vec<String>,

    /// Number of event loops (0 = one, negative = one per CPU)
    #[arg(short, long, default_value_t = 1, allow_negative_numbers = true)]
    loops: i32,

    /// Load balancing: random, round-robin or least-connections
    #[arg(long, default_value = "random")]
    balance: LoadBalance,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long, default_value_t = 300)]
    idle_timeout: u64,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

struct ClientInfo {
    addr: Option<String>,
    loop_index: usize,
    last_active: Instant,
    waker: ConnWaker,
}

/// Live connections across all loops, keyed by connection id
struct ClientRegistry {
    clients: DashMap<u64, ClientInfo>,
}

impl ClientRegistry {
    fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    fn register(&self, conn: &Conn) {
        self.clients.insert(
            conn.id(),
            ClientInfo {
                addr: conn.remote_addr().map(|a| a.to_string()),
                loop_index: conn.loop_index(),
                last_active: Instant::now(),
                waker: conn.waker(),
            },
        );
    }

    fn touch(&self, id: u64) {
        if let Some(mut entry) = self.clients.get_mut(&id) {
            entry.last_active = Instant::now();
        }
    }

    fn unregister(&self, id: u64) {
        self.clients.remove(&id);
    }

    fn is_idle(&self, id: u64, timeout: Duration) -> bool {
        self.clients
            .get(&id)
            .map(|entry| entry.last_active.elapsed() >= timeout)
            .unwrap_or(false)
    }

    /// Wakers of every connection idle for at least `timeout`
    fn idle(&self, timeout: Duration) -> Vec<ConnWaker> {
        self.clients
            .iter()
            .filter(|entry| entry.last_active.elapsed() >= timeout)
            .map(|entry| entry.waker.clone())
            .collect()
    }

    fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn describe(&self) -> String {
        let mut lines: Vec<String> = self
            .clients
            .iter()
            .map(|entry| {
                format!(
                    "id={} addr={} loop={} idle={}",
                    entry.key(),
                    entry.addr.as_deref().unwrap_or("?"),
                    entry.loop_index,
                    entry.last_active.elapsed().as_secs()
                )
            })
            .collect();
        lines.sort();
        lines.join("\n")
    }
}

/// Per-connection state: bytes of a command line not terminated yet
#[derive(Default)]
struct Session {
    pending: BytesMut,
}

/// Inline command server: PING, ECHO, CLIENTS, CLIENT LIST, QUIT, SHUTDOWN
struct LineServer {
    registry: ClientRegistry,
    idle_timeout: Option<Duration>,
}

impl LineServer {
    fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            registry: ClientRegistry::new(),
            idle_timeout,
        }
    }

    fn execute(&self, line: &[u8], out: &mut BytesMut) -> Action {
        let line = String::from_utf8_lossy(line);
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Action::None;
        };
        let args: Vec<&str> = parts.collect();

        match cmd.to_ascii_uppercase().as_str() {
            "PING" if args.is_empty() => out.extend_from_slice(b"+PONG\r\n"),
            "PING" => write_bulk(out, &args.join(" ")),
            "ECHO" if !args.is_empty() => write_bulk(out, &args.join(" ")),
            "CLIENTS" => {
                out.extend_from_slice(format!(":{}\r\n", self.registry.client_count()).as_bytes())
            }
            "CLIENT" if args.first().map(|a| a.eq_ignore_ascii_case("LIST")) == Some(true) => {
                write_bulk(out, &self.registry.describe())
            }
            "QUIT" => {
                out.extend_from_slice(b"+OK\r\n");
                return Action::Close;
            }
            "SHUTDOWN" => return Action::Shutdown,
            "ECHO" | "CLIENT" => out.extend_from_slice(
                format!(
                    "-ERR wrong number of arguments for '{}' command\r\n",
                    cmd.to_ascii_lowercase()
                )
                .as_bytes(),
            ),
            _ => out.extend_from_slice(format!("-ERR unknown command '{}'\r\n", cmd).as_bytes()),
        }

        Action::None
    }
}

fn write_bulk(out: &mut BytesMut, value: &str) {
    out.extend_from_slice(format!("${}\r\n", value.len()).as_bytes());
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

impl EventHandler for LineServer {
    type Client = Session;

    fn serving(&self, info: &ServerInfo) -> Action {
        for addr in &info.addrs {
            info!("Ready to accept connections on {}", addr);
        }
        info!("Running {} event loop(s)", info.num_loops);
        Action::None
    }

    fn accepted(&self, _conn: &Conn, _unix: bool) -> (Option<Session>, Action) {
        (Some(Session::default()), Action::None)
    }

    fn opened(&self, conn: &Conn, _client: &mut Session, _out: &mut BytesMut) -> (Options, Action) {
        self.registry.register(conn);

        // Input is copied into the session, so the shared buffer is safe
        let options = Options {
            tcp_keep_alive: Some(Duration::from_secs(300)),
            reuse_input_buffer: true,
        };
        (options, Action::None)
    }

    fn data(
        &self,
        conn: &Conn,
        session: &mut Session,
        input: Option<Input<'_>>,
        out: &mut BytesMut,
    ) -> Action {
        let Some(input) = input else {
            // Woken by the idle scan
            return match self.idle_timeout {
                Some(timeout) if self.registry.is_idle(conn.id(), timeout) => {
                    debug!("Closing idle connection {}", conn.id());
                    out.extend_from_slice(b"-ERR idle timeout\r\n");
                    Action::Close
                }
                _ => Action::None,
            };
        };

        self.registry.touch(conn.id());
        session.pending.extend_from_slice(&input);

        while let Some(pos) = memchr(b'\n', &session.pending) {
            let line = session.pending.split_to(pos + 1);
            let line = line.strip_suffix(b"\n").unwrap_or(&line[..]);
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            match self.execute(line, out) {
                Action::None => {}
                action => return action,
            }
        }

        Action::None
    }

    fn tick(&self) -> Option<(Duration, Action)> {
        let timeout = self.idle_timeout?;
        for waker in self.registry.idle(timeout) {
            if let Err(e) = waker.wake() {
                debug!("Waking connection {} failed: {}", waker.id(), e);
            }
        }
        Some((timeout.min(Duration::from_secs(1)), Action::None))
    }

    fn closed(&self, conn: &Conn, _client: Session, err: Option<io::Error>) -> Action {
        self.registry.unregister(conn.id());
        match err {
            Some(e) => debug!("Connection {} closed: {}", conn.id(), e),
            None => debug!("Connection {} closed", conn.id()),
        }
        Action::None
    }

    fn shutdown(&self) {
        info!("All loops stopped");
    }
}

/// Configuration from `--config` if given, otherwise from the flags
///
/// `--verbose` overrides the log level from either source.
fn build_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let defaults = Config::default();
            Config {
                addrs: if args.addrs.is_empty() {
                    defaults.addrs.clone()
                } else {
                    args.addrs.clone()
                },
                loops: args.loops,
                load_balance: args.balance,
                log_level: args.log_level.clone(),
                ..defaults
            }
        }
    };
    if args.verbose {
        config.log_level = "debug".to_string();
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = build_config(&args)?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(format!("feox_reactor={}", config.log_level))
        .init();

    if let Some(config_path) = &args.config {
        info!("Loaded configuration from {}", config_path);
    }

    info!(
        "Starting FeOx Reactor v{} with {} loop(s)",
        env!("CARGO_PKG_VERSION"),
        config.resolved_loops()
    );

    let idle_timeout = (args.idle_timeout > 0).then(|| Duration::from_secs(args.idle_timeout));
    let server = Server::new(config, LineServer::new(idle_timeout))?;

    // Setup signal handlers for graceful shutdown
    let handle = server.handle();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, shutting down gracefully...");
        handle.stop();
    })?;

    // Run the server
    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
