//! AgentVault backup control plane entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agentvault_core::DataStore;
use agentvault_server::config::{Config, StoreMode};
use agentvault_server::http::{build_router, AppState};
use agentvault_server::objectstore::ObjectStoreBroker;
use agentvault_server::purge;
use agentvault_server::storage::{DynamoStore, SqliteStore};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing(log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "agentvault=info".into()),
    );

    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(config.log_json);

    let store_mode = config.effective_store_mode();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr,
        ?store_mode,
        "Starting agentvault-server"
    );

    let broker = Arc::new(ObjectStoreBroker::connect(&config).await?);

    let store: Arc<dyn DataStore> = match store_mode {
        StoreMode::Kv => Arc::new(DynamoStore::connect(&config).await?),
        StoreMode::Sql => {
            let sqlite = Arc::new(SqliteStore::open(&config.database_path).await?);
            // KV mode purges rows via the table TTL; SQL mode sweeps here.
            tokio::spawn(purge::run(
                sqlite.clone(),
                broker.clone(),
                Duration::from_secs(config.purge_interval_seconds),
            ));
            sqlite
        }
    };

    let listen_addr = config.listen_addr;
    let app = build_router(AppState::new(store, broker, config));

    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "AgentVault server ready");

    let draining = Arc::new(Notify::new());
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(draining.clone()));

    let drain_deadline = async {
        draining.notified().await;
        tokio::time::sleep(DRAIN_TIMEOUT).await;
    };

    tokio::select! {
        result = server => result?,
        () = drain_deadline => warn!("drain deadline exceeded, terminating"),
    }

    info!("Server stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM, notifying the drain deadline as it does.
async fn shutdown_signal(draining: Arc<Notify>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Received shutdown signal, draining requests");
    draining.notify_one();
}
