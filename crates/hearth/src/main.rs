//! Hearth Server
//!
//! Home device state server with a WebSocket API and field-controller link.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use hearth::hearth_runtime::service::ServiceManager;
use hearth::home::{HomeLoader, Settings};
use hearth::hub::{Hub, HubConfig};
use hearth::server::{AppState, create_router};
use hearth::services::{JanitorService, LivenessService, ReloadService};
use hearth::store::SnapshotDb;
use hearth::transport::{BackoffPolicy, ControllerLink, ControllerLinkConfig, LinkState};

/// Hearth Home Server
#[derive(Parser, Debug)]
#[command(name = "hearth")]
#[command(about = "Hearth home device state server", long_about = None)]
struct Args {
    /// Path to the home directory
    #[arg(long, default_value = "./home")]
    home: PathBuf,

    /// Server host address (overrides home.toml)
    #[arg(long)]
    host: Option<String>,

    /// Server port (overrides home.toml)
    #[arg(long)]
    port: Option<u16>,

    /// Field controller address, host:port (overrides home.toml)
    #[arg(long)]
    controller: Option<String>,

    /// Don't watch the home directory for room edits
    #[arg(long)]
    no_watch: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hearth=info,tower_http=debug"));
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Hearth server v{}", env!("CARGO_PKG_VERSION"));

    let home = HomeLoader::load(&args.home)
        .await
        .with_context(|| format!("Failed to load home from {}", args.home.display()))?;
    let mut settings = home.settings.clone();
    apply_overrides(&mut settings, &args);
    info!("Loaded home: {} ({})", settings.home.name, settings.home.id);

    let persist = if settings.persistence.enabled {
        let path = if settings.persistence.path.is_absolute() {
            settings.persistence.path.clone()
        } else {
            home.path.join(&settings.persistence.path)
        };
        let db = SnapshotDb::open(&path)
            .with_context(|| format!("Failed to open state database {}", path.display()))?;
        info!("Persisting device state to {}", path.display());
        Some(Arc::new(db))
    } else {
        None
    };

    let (hub, receivers) = Hub::new(HubConfig::from_settings(&settings), persist);
    let summary = hub.install(home.devices());
    info!(
        "Registered {} devices ({} rejected)",
        summary.added.len(),
        summary.rejected.len()
    );

    let service_manager = Arc::new(ServiceManager::new());
    let timing = &settings.timing;

    let (link_state, _parked) = match &settings.controller.address {
        Some(address) => {
            let link = ControllerLink::new(
                ControllerLinkConfig {
                    address: address.clone(),
                    format: settings.controller.wire_format,
                    backoff: BackoffPolicy {
                        initial: Duration::from_millis(settings.controller.backoff_min_ms),
                        max: Duration::from_millis(settings.controller.backoff_max_ms),
                        ..BackoffPolicy::default()
                    },
                },
                hub.clone(),
                receivers,
            );
            let state = link.state();
            if let Err(e) = service_manager.spawn(link).await {
                error!("Failed to start controller link: {}", e);
            }
            (state, None)
        }
        None => {
            info!("No field controller configured; commands stay queued");
            // Commands queue until the buffer fills, then submissions are refused
            (watch::channel(LinkState::Disabled).1, Some(receivers))
        }
    };

    spawn_or_log(
        &service_manager,
        LivenessService::new(hub.clone(), timing.sweep_interval()),
    )
    .await;
    spawn_or_log(
        &service_manager,
        JanitorService::new(hub.clone(), timing.janitor_interval()),
    )
    .await;
    spawn_or_log(
        &service_manager,
        ReloadService::new(hub.clone(), home.path.clone(), !args.no_watch),
    )
    .await;

    for (id, state) in service_manager.list() {
        info!("  - {} ({})", id, state);
    }

    let state = AppState::new(hub.clone(), service_manager.clone(), link_state);
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port).parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service_manager.clone(), hub))
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn apply_overrides(settings: &mut Settings, args: &Args) {
    if let Some(host) = &args.host {
        settings.server.host = host.clone();
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(controller) = &args.controller {
        settings.controller.address = Some(controller.clone());
    }
}

async fn spawn_or_log<S: hearth::hearth_runtime::service::Service>(manager: &ServiceManager, service: S) {
    let id = service.spec().id;
    if let Err(e) = manager.spawn(service).await {
        error!("Failed to start service {}: {}", id, e);
    }
}

/// Wait for shutdown signal and cleanup
async fn shutdown_signal(service_manager: Arc<ServiceManager>, hub: Arc<Hub>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }

    if let Err(e) = service_manager.shutdown_all().await {
        error!("Error during service shutdown: {}", e);
    }
    hub.close();
}
