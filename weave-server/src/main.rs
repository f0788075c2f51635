//! Weave server: the WebSocket sync endpoint plus the HTTP API.
//!
//! Configuration comes from `WEAVE_*` environment variables (see
//! [`config::Config`]). With `WEAVE_DATA_DIR` set, documents and versions
//! are kept in RocksDB; otherwise they live in memory for the process
//! lifetime.

mod api;
mod config;

use std::future::IntoFuture;
use std::sync::Arc;

use log::{error, info};
use weave_collab::{
    AccessGate, DocumentRegistry, DocumentStore, MemoryDirectory, MemoryStore, PersistenceConfig,
    PersistenceGateway, SignalHub, Storage, StoreConfig, SyncServer, VersionService,
};

use config::Config;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    info!("Starting Weave server v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!("{e}");
        std::process::exit(1);
    }
    info!("Server shut down gracefully");
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn Storage> = match &config.data_dir {
        Some(path) => {
            info!("Storing documents in {}", path.display());
            Arc::new(DocumentStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)
        }
        None => {
            info!("WEAVE_DATA_DIR not set, documents are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let directory = Arc::new(match &config.directory_file {
        Some(path) => MemoryDirectory::load(path)?,
        None => {
            info!("WEAVE_DIRECTORY_FILE not set, starting with an empty directory");
            MemoryDirectory::new()
        }
    });

    let gate = Arc::new(AccessGate::new(directory.clone(), Arc::new(SignalHub::default())));
    let gateway = Arc::new(PersistenceGateway::new(store.clone(), PersistenceConfig::default()));
    let registry = Arc::new(DocumentRegistry::new(gateway, config.registry_config()));
    let versions = Arc::new(
        VersionService::new(store)
            .with_registry(registry.clone())
            .with_max_depth(config.max_reconstruct_depth),
    );
    let server = Arc::new(SyncServer::new(config.server_config(), gate.clone(), registry.clone()));

    let sync_listener = server.bind().await?;
    let sync_server = server.clone();
    let sync_task = tokio::spawn(async move { sync_server.serve(sync_listener).await });

    let app = api::router(api::ApiState {
        gate,
        directory,
        versions,
        registry: registry.clone(),
        server,
    });
    let api_listener = tokio::net::TcpListener::bind(config.api_addr()).await?;
    info!("HTTP API listening on http://{}", api_listener.local_addr()?);

    tokio::select! {
        served = axum::serve(api_listener, app).with_graceful_shutdown(shutdown_signal()).into_future() => {
            served?;
        }
        synced = sync_task => {
            // The accept loop only returns on a listener error.
            synced??;
        }
    }

    let flushed = registry.flush_all().await;
    info!("Flushed {flushed} resident document(s)");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
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
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
