use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ringlimit::config::RingLimitConfig;
use ringlimit::grpc::{GrpcConnector, GrpcServer};
use ringlimit::mesh::{Discovery, PeerRegistry, RequestRouter};
use ringlimit::ratelimit::RateLimitCache;

/// How often unreachable static peers are dialed again.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Distributed rate limiting with consistent-hash key ownership")]
struct Cli {
    /// Path to a YAML or TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address the gRPC server binds to
    #[arg(long, value_name = "ADDR")]
    grpc_addr: Option<SocketAddr>,

    /// Host other peers use to reach this node
    #[arg(long, value_name = "HOST")]
    advertise_addr: Option<String>,

    /// Peer host; repeat for each peer
    #[arg(long = "peer", value_name = "HOST")]
    peers: Vec<String>,

    /// Maximum number of keys cached on this node
    #[arg(long)]
    cache_size: Option<usize>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting ringlimit");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli)?;
    let advertise = config.server.advertise_host();
    info!(
        grpc_addr = %config.server.grpc_addr,
        advertise = %advertise,
        cache_size = config.cache.cache_size,
        "Configuration loaded"
    );

    let cache = Arc::new(RateLimitCache::new(config.cache.cache_size));
    let connector = Arc::new(GrpcConnector::new(config.peers.connect_timeout()));
    let registry = Arc::new(
        PeerRegistry::new(connector)
            .with_local_host(advertise.clone())
            .with_virtual_nodes(config.peers.virtual_nodes),
    );
    let router = Arc::new(
        RequestRouter::new(registry.clone(), cache)
            .with_default_limit(config.limits.limit_config()),
    );

    let shutdown = CancellationToken::new();

    // Bind before dialing peers so they can reach us during startup
    let listener = TcpListener::bind(config.server.grpc_addr).await?;
    let server = GrpcServer::new(config.server.grpc_addr, router)
        .with_request_timeout(config.server.request_timeout());
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        server
            .serve_with_listener(listener, async move { server_shutdown.cancelled().await })
            .await
    });

    let hosts = config.initial_hosts();
    let errors = registry.update(&hosts).await;
    for (host, err) in &errors {
        warn!(host = %host, error = %err, "Initial peer unreachable");
    }

    let discovery = if config.gossip.enabled {
        let discovery = Discovery::start(config.gossip.discovery_config(advertise)).await?;
        let discovery = Arc::new(discovery);
        let sync = discovery.spawn_sync(registry.clone(), shutdown.clone());
        Some((discovery, sync))
    } else {
        if !errors.is_empty() {
            tokio::spawn(reconnect_static_peers(registry.clone(), hosts, shutdown.clone()));
        }
        None
    };

    shutdown_signal().await;
    shutdown.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "gRPC server exited with error"),
        Err(e) => error!(error = %e, "gRPC server task failed"),
    }

    if let Some((discovery, sync)) = discovery {
        if let Err(e) = sync.await {
            error!(error = %e, "Discovery sync task failed");
        }
        match Arc::try_unwrap(discovery) {
            Ok(discovery) => discovery.shutdown().await?,
            Err(_) => warn!("Discovery still in use, skipping graceful leave"),
        }
    }

    info!("ringlimit stopped");
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<RingLimitConfig> {
    let mut config = RingLimitConfig::load(cli.config.as_deref())?;

    if let Some(addr) = cli.grpc_addr {
        config.server.grpc_addr = addr;
    }
    if let Some(advertise) = &cli.advertise_addr {
        config.server.advertise_addr = Some(advertise.clone());
    }
    if !cli.peers.is_empty() {
        config.peers.hosts = cli.peers.clone();
    }
    if let Some(size) = cli.cache_size {
        config.cache.cache_size = size;
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

/// Keep dialing static peers that were down at startup until all are in the ring.
async fn reconnect_static_peers(
    registry: Arc<PeerRegistry>,
    hosts: Vec<String>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(RECONNECT_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let errors = registry.update(&hosts).await;
        if errors.is_empty() {
            info!(peers = registry.size(), "All static peers connected");
            return;
        }
        for (host, err) in &errors {
            warn!(host = %host, error = %err, "Peer still unreachable");
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
