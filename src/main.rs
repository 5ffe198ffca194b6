//! Keel: multi-tenant session and servant-dispatch server.
//!
//! Exposes named services over JSON-RPC 2.0 via WebSocket. Every connection
//! handshakes with a principal and gets a session; sessions of the same login
//! share one servant registry, so stateful servants survive reconnects.
//!
//! Usage:
//!   keel                                  # Default port 7070, random token
//!   keel --port 8080 --token mysecret     # Custom port and token
//!   keel --workers 16 --queue-depth 512   # Bigger dispatch pool
//!   keel --local-processors 2             # Serve acquireProcessor in-process

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use keel_acquire::{
    BroadcastAccept, DirectoryPoll, InMemoryBus, InMemoryJobStore, LocalProcessor, MessageBus,
    StaticDiscovery, WorkerHandle,
};
use keel_protocol::AuthConfig;
use keel_server::{
    BundledServices, RpcServer, ServerConfig, ServiceCatalog, SessionManager,
};
use keel_services::config::ConfigService;
use keel_transport::{TransportConfig, TransportServer};
use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "keel", about = "Keel session and servant-dispatch server")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "7070")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Authentication token (random if not provided)
    #[arg(long)]
    token: Option<String>,

    /// Maximum concurrent connections
    #[arg(long, default_value = "64")]
    max_connections: usize,

    /// Dispatch pool workers
    #[arg(long, default_value = "8")]
    workers: usize,

    /// Calls that may queue for a free worker
    #[arg(long, default_value = "256")]
    queue_depth: usize,

    /// How long broadcast-accept waits for a worker, in seconds
    #[arg(long, default_value = "30")]
    accept_budget_secs: u64,

    /// Idle sessions are reaped after this many seconds
    #[arg(long, default_value = "300", value_parser = clap::value_parser!(u64).range(1..))]
    keep_alive_secs: u64,

    /// Longest wait acquireResource accepts, in seconds (at most 180)
    #[arg(long, default_value = "180", value_parser = clap::value_parser!(u64).range(1..=180))]
    max_acquire_wait_secs: u64,

    /// In-process processors answering acquireProcessor
    #[arg(long, default_value = "0")]
    local_processors: usize,

    /// Root directory RawFile servants may read under (defaults to home)
    #[arg(long)]
    file_root: Option<PathBuf>,

    /// Enable CORS on the HTTP endpoints
    #[arg(long)]
    cors: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file (defaults to ~/.keel/logs/keel.log if no path given)
    #[arg(long, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let Some(log_file_arg) = &cli.log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(());
    };

    let log_path = if log_file_arg == "DEFAULT" {
        keel_home().join("logs/keel.log")
    } else {
        PathBuf::from(log_file_arg)
    };
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    eprintln!("Logging to {}", log_path.display());
    Ok(())
}

fn keel_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".keel")
}

/// How often idle sessions are looked for. Never zero.
fn reap_interval(window: Duration) -> Duration {
    (window / 4).max(Duration::from_secs(1))
}

fn random_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let token_was_explicit = cli.token.is_some();
    let auth_token = cli.token.clone().unwrap_or_else(random_token);
    let file_root = match &cli.file_root {
        Some(root) => root
            .canonicalize()
            .with_context(|| format!("resolving file root {}", root.display()))?,
        None => dirs::home_dir().context("no home directory; pass --file-root")?,
    };

    let config = ServerConfig {
        pool_size: cli.workers,
        queue_depth: cli.queue_depth,
        keep_alive_window: Duration::from_secs(cli.keep_alive_secs),
        accept_budget: Duration::from_secs(cli.accept_budget_secs),
        max_acquire_wait: Duration::from_secs(cli.max_acquire_wait_secs),
        ..ServerConfig::default()
    };

    // ── Acquisition collaborators ────────────────────────────────────────
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
    let processors = Arc::new(BroadcastAccept::new(
        bus.clone(),
        Arc::new(InMemoryJobStore::new()),
        config.accept_budget,
    ));
    let resources = Arc::new(DirectoryPoll::with_ceiling(
        Arc::new(StaticDiscovery::new()),
        config.max_acquire_wait,
    ));
    info!("Resource acquisition waits capped at {:?}", resources.ceiling());
    for i in 0..cli.local_processors {
        let handle = WorkerHandle {
            worker_id: format!("local-{i}"),
            endpoint: format!("inproc://local-{i}"),
        };
        LocalProcessor::new(handle, 0).admin().spawn(bus.clone());
    }

    let catalog = ServiceCatalog::bundled(BundledServices {
        settings: ConfigService::shared_defaults(),
        file_root: file_root.clone(),
        processors,
        resources,
    });
    let services = catalog.names().join(", ");

    let server = Arc::new(RpcServer::new(SessionManager::new(config.clone(), catalog)));
    server.initialize();

    let transport_config = TransportConfig {
        port: cli.port,
        hostname: cli.hostname.clone(),
        auth: Some(AuthConfig {
            token: auth_token.clone(),
            handshake_timeout_ms: 10_000,
        }),
        enable_cors: cli.cors,
        max_connections: Some(cli.max_connections),
        ..TransportConfig::default()
    };
    let mut transport = TransportServer::start(transport_config, server.clone())
        .await
        .context("starting transport")?;

    // Reap sessions whose clients stopped sending keep-alives.
    let reaper = {
        let server = server.clone();
        let window = config.keep_alive_window;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(reap_interval(window));
            loop {
                tick.tick().await;
                let reaped = server.manager().reap_idle(window).await;
                if reaped > 0 {
                    info!("Reaped {reaped} idle session(s)");
                }
            }
        })
    };

    println!();
    println!("  Keel server running");
    println!();
    println!("  WebSocket:  ws://{}:{}/ws", cli.hostname, transport.port());
    println!("  Services:   {services}");
    println!("  File root:  {}", file_root.display());
    println!("  Workers:    {} (queue {})", config.pool_size, config.queue_depth);
    if cli.local_processors > 0 {
        println!("  Processors: {} local", cli.local_processors);
    }
    if token_was_explicit {
        println!("  Auth token: (from --token)");
    } else {
        println!("  Auth token: {auth_token}");
    }
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;

    println!();
    println!("  Shutting down...");
    reaper.abort();
    server.shutdown().await;
    if tokio::time::timeout(Duration::from_secs(5), transport.stop())
        .await
        .is_err()
    {
        warn!("Transport did not stop within 5s; exiting anyway");
    }
    println!("  Server stopped.");
    Ok(())
}
