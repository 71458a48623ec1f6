use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dockfleet::api::create_router;
use dockfleet::cli::Args;
use dockfleet::config::AppConfig;
use dockfleet::kv::{FileKvStore, KvStore, MemoryKvStore};
use dockfleet::App;

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

    let mut config = match args.config {
        Some(ref path) => match AppConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load config: {}", e);
                process::exit(1);
            }
        },
        None => AppConfig::default(),
    };
    if let Some(bind_addr) = args.bind_addr {
        config.bind_addr = bind_addr;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    let kv: Arc<dyn KvStore> = if args.ephemeral {
        Arc::new(MemoryKvStore::new())
    } else {
        match FileKvStore::open(&config.data_dir) {
            Ok(store) => store,
            Err(e) => {
                error!(
                    "Failed to open KV store at {}: {}",
                    config.data_dir.display(),
                    e
                );
                process::exit(1);
            }
        }
    };

    let addr = config.listen_addr();
    let app = App::build(config, kv).await;

    info!("Starting dockfleet on {}", addr);
    let router = create_router(app.clone());

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /clusters        - Cluster inventory");
    info!("  GET  /nodes           - Node registry");
    info!("  GET  /jobs            - Job instances");
    info!("  GET  /source          - Declarative state export");

    if let Err(e) = axum::serve(listener, router).await {
        error!("Server error: {}", e);
    }
    app.shutdown();
}
