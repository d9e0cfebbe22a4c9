// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for orcha-core integration tests.
//!
//! Provides TestContext: a control plane over in-memory stores, the
//! in-memory cluster and the mock HPC scheduler.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use orcha_core::backoff::BackoffPolicy;
use orcha_core::config::Config;
use orcha_core::control_plane::{ControlPlane, ControlPlaneBuilder, ControlPlaneConfig};
use orcha_core::entity::Entity;
use orcha_core::framework::MockHpcConnector;
use orcha_core::framework::k8s::InMemoryCluster;
use orcha_core::run_manager::RunRequest;
use orcha_core::secrets::MemorySecretResolver;
use orcha_core::spec::RunSpec;
use orcha_core::state::State;
use orcha_core::store::{EntityStore, MemoryEntityStore, MemoryRunnableStore};

/// Namespace every test cluster object lands in.
pub const NAMESPACE: &str = "orcha-test";

/// Test context holding the collaborators behind a control plane.
pub struct TestContext {
    pub entities: Arc<MemoryEntityStore>,
    pub runnables: Arc<MemoryRunnableStore>,
    pub cluster: Arc<InMemoryCluster>,
    pub hpc: Arc<MockHpcConnector>,
    pub secrets: Arc<MemorySecretResolver>,
}

impl TestContext {
    /// Fresh, empty collaborators.
    pub fn new() -> Self {
        Self {
            entities: Arc::new(MemoryEntityStore::new()),
            runnables: Arc::new(MemoryRunnableStore::new()),
            cluster: Arc::new(InMemoryCluster::new()),
            hpc: Arc::new(MockHpcConnector::new()),
            secrets: Arc::new(MemorySecretResolver::new()),
        }
    }

    /// Configuration with short timeouts and polling.
    pub fn config() -> Config {
        Config {
            namespace: NAMESPACE.to_string(),
            monitor_workers: 2,
            backend_timeout: Duration::from_secs(2),
            backend_max_retries: 2,
            hpc_poll_interval: Duration::from_millis(20),
            ..Config::default()
        }
    }

    /// Builder wired to these collaborators, for tests that add to it.
    pub fn builder(&self) -> ControlPlaneBuilder {
        ControlPlane::builder()
            .config(Self::config())
            .entity_store(self.entities.clone())
            .runnable_store(self.runnables.clone())
            .kube_api(self.cluster.clone())
            .hpc_connector(self.hpc.clone())
            .secrets(self.secrets.clone())
            .watch_backoff(BackoffPolicy {
                first: Duration::from_millis(5),
                max: Duration::from_millis(50),
                factor: 2.0,
            })
    }

    /// Assembled but not started control plane.
    pub fn build(&self) -> ControlPlaneConfig {
        self.builder()
            .build()
            .expect("Failed to build control plane")
    }

    /// Started control plane.
    pub async fn start(&self) -> ControlPlane {
        self.build()
            .start()
            .await
            .expect("Failed to start control plane")
    }

    /// Stored entity by id.
    pub async fn stored(&self, id: &str) -> Option<Entity> {
        self.entities.find(id).await.expect("Failed to read entity")
    }

    /// Wait until the stored entity reaches `state`; `None` state waits for
    /// removal.
    pub async fn wait_for(&self, id: &str, state: Option<State>) -> Option<Entity> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let current = self.stored(id).await;
            let reached = match (&current, state) {
                (None, None) => true,
                (Some(entity), Some(state)) => entity.state().ok() == Some(state),
                _ => false,
            };
            if reached {
                return current;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "Timed out waiting for {id} to reach {state:?}, last seen {:?}",
                current.as_ref().map(|e| e.state().ok())
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Request for a `container` job running `image`.
pub fn container_request(image: &str) -> RunRequest {
    let mut run = RunSpec::new("job");
    run.image = Some(image.to_string());
    RunRequest {
        project: "demo".into(),
        kind: "container".into(),
        name: "container-job".into(),
        user: Some("alice".into()),
        run,
        ..RunRequest::default()
    }
}

/// Same request, executed on the caller's side.
pub fn local_request(image: &str) -> RunRequest {
    let mut request = container_request(image);
    request.run.local_execution = true;
    request
}

/// Name of the cluster Job created for run `id`.
pub fn job_name(id: &str) -> String {
    format!("orcha-job-{id}")
}
