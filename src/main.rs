use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nodegate::cli::Args;
use nodegate::cluster::KubeApiFetcher;
use nodegate::config::{load_config_file, NodegateConfig};
use nodegate::probe::{HealthProber, SshTransport};
use nodegate::reconcile::Reconciler;
use nodegate::registry::RedbRegistry;
use nodegate::server::{create_router, AppState};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    // Load configuration, falling back to defaults when no file is given
    let config = match &args.config_file {
        Some(path) => match load_config_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load config file {}: {}", path.display(), e);
                process::exit(1);
            }
        },
        None => NodegateConfig::default(),
    };

    // Open the node registry
    let registry = match RedbRegistry::open(&config.registry_path) {
        Ok(registry) => registry,
        Err(e) => {
            error!(
                "Failed to open registry at {}: {}",
                config.registry_path.display(),
                e
            );
            process::exit(1);
        }
    };

    // Wire the probe and the live-state fetcher
    let probe_config = config.probe.to_probe_config();
    let transport = SshTransport::new(probe_config.connect_timeout, probe_config.exec_timeout);
    let prober = HealthProber::new(Box::new(transport), probe_config);

    let fetcher = match KubeApiFetcher::new(&config.kube) {
        Ok(fetcher) => fetcher,
        Err(e) => {
            error!("Failed to build cluster client: {}", e);
            process::exit(1);
        }
    };

    let reconciler = Reconciler::new(
        Arc::new(registry),
        Arc::new(fetcher),
        Arc::new(prober),
    );
    let state = AppState::new(reconciler);

    let bind_addr = args.bind_addr.as_deref().unwrap_or(&config.bind_addr);
    let port = args.port.unwrap_or(config.port);
    let addr = format!("{}:{}", bind_addr, port);

    info!("Starting nodegate on {}", addr);
    info!("Cluster API server: {}", config.kube.api_server);

    let app = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /health                          - Health check");
    info!("  POST /v1/nodes                        - Admit a node");
    info!("  GET  /v1/clusters/{{cluster_id}}/nodes  - Bound nodes");
    info!("  GET  /v1/nodes/unbound                - Unbound nodes");

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
