// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orcha Core - standalone control plane
//!
//! Runs the lifecycle managers, watchers and monitor workers on top of the
//! SQLite stores until interrupted. The backend is chosen with
//! `ORCHA_BACKEND`; the binary refuses to start without one.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use orcha_core::config::{BackendMode, Config};
use orcha_core::control_plane::ControlPlane;
use orcha_core::framework::MockHpcConnector;
use orcha_core::framework::k8s::InMemoryCluster;
use orcha_core::secrets::MemorySecretResolver;
use orcha_core::store::sqlite::{self, SqliteEntityStore, SqliteRunnableStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orcha_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        database_url = %config.database_url,
        namespace = %config.namespace,
        monitor_workers = config.monitor_workers,
        "Starting Orcha Core"
    );

    let pool = sqlite::connect(&config.database_url).await?;
    info!("Database ready");

    let (cluster, hpc) = match config.backend {
        Some(BackendMode::Simulated) => {
            info!(backend = %BackendMode::Simulated, "Using in-process cluster and HPC scheduler");
            (
                Arc::new(InMemoryCluster::new()),
                Arc::new(MockHpcConnector::new()),
            )
        }
        None => anyhow::bail!("ORCHA_BACKEND is not set (supported: simulated)"),
    };

    let secrets = match &config.secrets_file {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let secrets = MemorySecretResolver::from_json(&json)
                .with_context(|| format!("Invalid secret catalogue {}", path.display()))?;
            info!(path = %path.display(), secrets = secrets.len(), "Secret catalogue loaded");
            secrets
        }
        None => {
            info!("No secret catalogue configured, runs that name secrets will be rejected");
            MemorySecretResolver::new()
        }
    };

    let plane = ControlPlane::builder()
        .config(config)
        .entity_store(Arc::new(SqliteEntityStore::new(pool.clone())))
        .runnable_store(Arc::new(SqliteRunnableStore::new(pool)))
        .kube_api(cluster)
        .hpc_connector(hpc)
        .secrets(Arc::new(secrets))
        .build()?
        .start()
        .await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    plane.shutdown().await?;

    info!("Orcha Core shut down");

    Ok(())
}
