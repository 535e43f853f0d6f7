//! CLI entry point (§6): parses configuration, wires store + router +
//! listener together, and shuts down cleanly on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;

use topicbus::config::Config;
use topicbus::connection::ConnectionContext;
use topicbus::kv::InMemoryKvStore;
use topicbus::partition::MessageStore;
use topicbus::{router, server};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let config = Config::parse();
    env_logger::Builder::new().filter_level(config.log_level()).init();

    let listener = match TcpListener::bind(config.listen_addr()).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {err}", config.listen_addr());
            return std::process::ExitCode::FAILURE;
        }
    };
    info!("listening on {}", config.listen_addr());

    let store = Arc::new(MessageStore::new(
        PathBuf::from(&config.storage_path),
        config.segment_bytes,
    ));
    let (router_handle, router_shutdown, router_join) =
        router::spawn(None, config.node_id, Duration::from_secs(config.slow_consumer_deadline_secs));

    let ctx = Arc::new(ConnectionContext {
        router: router_handle,
        store: store.clone(),
        kv: Some(Arc::new(InMemoryKvStore::new())),
        queue_depth: config.queue_depth,
        idle_read_timeout: Duration::from_secs(config.idle_read_timeout_secs),
        node_id: config.node_id,
    });

    let (accept_shutdown_tx, accept_shutdown_rx) = tokio::sync::watch::channel(false);
    let accept_loop = tokio::spawn(server::serve(listener, ctx, accept_shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining connections");

    let _ = accept_shutdown_tx.send(true);
    let _ = accept_loop.await;
    let _ = router_shutdown.send(true);
    let _ = router_join.await;
    if let Err(err) = store.stop().await {
        error!("error while closing partitions: {err}");
    }

    info!("shutdown complete");
    std::process::ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
