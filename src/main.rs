use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracegate::auth::AuthServer;
use tracegate::cache::PageCache;
use tracegate::cmd;
use tracegate::config::Config;
use tracegate::proxy::ProxySidecar;
use tracegate::registry::TraceRegistry;
use tracegate::router::LobbyServer;
use tracegate::runtime::ContainerRuntime;
use tracegate::watcher::{TraceManager, TraceWatcher};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tracegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // The trace inspector is required before anything else happens; a
    // lobby that cannot derive identifiers is useless.
    if cmd::find_on_path(&config.runtime.inspector).is_none() {
        error!(
            inspector = %config.runtime.inspector,
            "Trace inspector not found on PATH, refusing to start"
        );
        anyhow::bail!(
            "trace inspector `{}` not found on PATH",
            config.runtime.inspector
        );
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runtime = Arc::new(ContainerRuntime::new(config.runtime.binary.clone()));
    let registry = Arc::new(TraceRegistry::new());
    let cache = Arc::new(PageCache::new(
        Arc::clone(&registry),
        Arc::clone(&runtime),
        config.server.static_assets_host.clone(),
    ));

    // Auth sidecar
    let auth_addr: SocketAddr = format!("127.0.0.1:{}", config.server.auth_port)
        .parse()
        .expect("valid loopback address");
    let auth_server = AuthServer::new(auth_addr, shutdown_rx.clone());
    let auth_handle = tokio::spawn(async move {
        if let Err(e) = auth_server.run().await {
            error!(error = %e, "Auth stub error");
        }
    });

    // Reverse-proxy sidecar
    let proxy = ProxySidecar::start(Arc::clone(&runtime), &config)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to start reverse-proxy sidecar");
            anyhow::anyhow!("failed to start reverse-proxy sidecar: {}", e)
        })?;

    // Adopt traces already on disk before serving anything, then start
    // watching for arrivals and departures.
    let manager = Arc::new(TraceManager::new(
        Arc::clone(&registry),
        Arc::clone(&runtime),
        &config,
    ));
    manager.scan_existing(&config.traces.root).await?;

    let trace_watcher = TraceWatcher::new(&config.traces.root)?;
    let watcher_manager = Arc::clone(&manager);
    let watcher_shutdown = shutdown_rx.clone();
    let watcher_handle = tokio::spawn(async move {
        watcher_manager.run(trace_watcher, watcher_shutdown).await;
    });

    // Lobby server
    let lobby_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid lobby bind address");
            anyhow::anyhow!("Invalid lobby bind address: {}", e)
        })?;
    let lobby = LobbyServer::new(
        lobby_addr,
        Arc::clone(&cache),
        &config.server.static_assets_host,
        shutdown_rx.clone(),
    );
    let lobby_handle = tokio::spawn(async move {
        if let Err(e) = lobby.run().await {
            error!(error = %e, "Lobby server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Teardown order: the auth stub first (awaited), then every trace
    // container, then the reverse proxy last.
    let _ = auth_handle.await;
    manager.stop_all().await;
    proxy.stop().await;

    let _ = watcher_handle.await;
    let _ = lobby_handle.await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting lobby"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        auth_port = config.server.auth_port,
        public_port = config.server.public_port,
        public_url = %config.server.public_url,
        "Server configuration"
    );
    info!(
        root = %config.traces.root.display(),
        storage = ?config.traces.storage_dir,
        notify_topic = ?config.traces.notify_topic,
        notify_on_new = config.traces.notify_on_new,
        "Trace configuration"
    );
    info!(
        runtime = %config.runtime.binary,
        image = %config.runtime.image,
        inspector = %config.runtime.inspector,
        proxy_image = %config.runtime.proxy_image,
        "Runtime configuration"
    );
}
