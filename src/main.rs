//! kvsyncd - collaborative key-value sync daemon.
//!
//! Hosts the Sync Server (§4.6) for every room in `config.toml`, dials an
//! outbound [`sync::client::SyncClient`] for each configured peer, and
//! exposes Prometheus metrics over HTTP.

mod config;
mod error;
mod http;
mod metrics;
mod persistence;
mod sync;
mod telemetry;
mod workspace;

use std::path::Path;
use std::rc::Rc;

use kvsync_crdt::{Awareness, MemDocument, Origin};
use tracing::{error, info};

use crate::config::Config;
use crate::sync::{client::SyncClient, SyncServer};

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path.
/// Falls back to `config.toml` when no argument is provided.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {flag}");
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "config.toml".to_string(),
    };

    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

fn init_tracing(format: config::LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        config::LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        config::LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = resolve_config_path();

    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("ERROR: Failed to load config from {config_path}: {e}");
        e
    })?;

    init_tracing(config.server.log_format);

    if let Err(errors) = crate::config::validate(&config) {
        for err in &errors {
            error!(error = %err, "configuration validation failed");
        }
        return Err(anyhow::anyhow!(
            "configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    info!(server = %config.server.name, "starting kvsyncd");

    metrics::init();

    if config.server.metrics_port != 0 {
        let metrics_port = config.server.metrics_port;
        tokio::spawn(async move {
            http::run_http_server(metrics_port).await;
        });
    }

    // The CRDT reference runtime (MemDocument, Awareness, KVLog's internal
    // state) is Rc/RefCell-based and single-threaded-cooperative by design
    // (§5). Everything that shares those objects across tasks — every
    // SyncClient, every WorkspaceClient — runs on this LocalSet rather
    // than tokio::spawn's default multi-thread scheduling.
    let local = tokio::task::LocalSet::new();
    local.run_until(run(config)).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let sync_server = SyncServer::bind(&config).await?;
    let server_task = tokio::spawn(sync_server.run());

    // One outbound SyncClient per configured peer, sharing one Document
    // and Awareness table per room (§4.7, §4.6 "one shared awareness
    // instance" per room).
    let mut clients = Vec::new();
    for (room, room_config) in &config.rooms {
        if room_config.peers.is_empty() {
            continue;
        }
        let doc = Rc::new(MemDocument::new(room.clone(), !room_config.retain_history));
        let awareness = Rc::new(Awareness::new());
        for peer_url in &room_config.peers {
            let url = format!("{}/sync/{}", peer_url.trim_end_matches('/'), room);
            info!(room = %room, url = %url, "dialing sync peer");
            let client = Rc::new(SyncClient::new(
                url,
                Origin::new(config.server.replica_id),
                doc.clone(),
                awareness.clone(),
                config.reconnect.clone(),
            ));
            client.connect();
            clients.push(client);
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    for client in &clients {
        client.destroy();
    }
    server_task.abort();
    Ok(())
}
