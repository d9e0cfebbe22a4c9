// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution backends.
//!
//! A [`Framework`] executes runnables on one backend and owns their backend
//! resources. Every operation is idempotent so the caller can retry it after
//! a timeout without checking what the previous attempt did. Frameworks
//! record each runnable in the [`RunnableStore`] before touching the backend,
//! which is what lets a restarted control plane reattach instead of
//! resubmitting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::entity::StatusFragment;
use crate::error::{Error, Result};
use crate::runnable::Runnable;
use crate::state::State;
use crate::store::RunnableStore;

pub mod hpc;
pub mod k8s;

pub use hpc::{HpcConnector, HpcFramework, HpcJobStatus, HpcMonitor, HpcMonitorConfig, MockHpcConnector};

/// Framework ids.
pub mod ids {
    /// Kubernetes Job.
    pub const K8S_JOB: &str = "k8sjob";
    /// Kubernetes Job running the kaniko image builder.
    pub const K8S_KANIKO: &str = "k8skaniko";
    /// Argo Workflow.
    pub const K8S_ARGO: &str = "k8sargo";
    /// HPC batch scheduler.
    pub const HPC: &str = "hpcdl";
}

/// Backend call failures.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// Connection failure, 5xx, or an unavailable dependency.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The call did not finish in time.
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend refused the request.
    #[error("backend rejected request: {0}")]
    Rejected(String),

    /// The addressed resource does not exist.
    #[error("backend resource not found: {0}")]
    NotFound(String),
}

impl BackendError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_) | BackendError::Timeout(_))
    }
}

/// One execution backend.
#[async_trait]
pub trait Framework: Send + Sync {
    /// Framework id, e.g. `k8sjob`.
    fn id(&self) -> &str;

    /// Record and submit; returns the runnable as the backend accepted it.
    async fn submit(&self, runnable: &Runnable) -> std::result::Result<Runnable, BackendError>;

    /// Halt the work; returns the runnable in its halted state.
    async fn stop(&self, runnable: &Runnable) -> std::result::Result<Runnable, BackendError>;

    /// Continue halted work.
    async fn resume(&self, runnable: &Runnable) -> std::result::Result<Runnable, BackendError>;

    /// Remove backend resources; returns the runnable marked `DELETED`.
    async fn delete(&self, runnable: &Runnable) -> std::result::Result<Runnable, BackendError>;

    /// Results of finished work, merged into the run's status.
    async fn fetch_results(
        &self,
        _runnable: &Runnable,
    ) -> std::result::Result<Option<StatusFragment>, BackendError> {
        Ok(None)
    }

    /// State the backend currently reports, used when reattaching after a
    /// restart. `None` when it cannot tell.
    async fn reconcile(
        &self,
        _runnable: &Runnable,
    ) -> std::result::Result<Option<State>, BackendError> {
        Ok(None)
    }
}

/// Framework id to implementation.
#[derive(Clone, Default)]
pub struct FrameworkRegistry {
    frameworks: HashMap<String, Arc<dyn Framework>>,
}

impl FrameworkRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the framework's own id, replacing any previous entry.
    pub fn register(&mut self, framework: Arc<dyn Framework>) {
        self.frameworks
            .insert(framework.id().to_string(), framework);
    }

    /// Framework registered under `id`.
    pub fn get(&self, id: &str) -> Result<&Arc<dyn Framework>> {
        self.frameworks
            .get(id)
            .ok_or_else(|| Error::unknown_kind("framework", id))
    }

    /// Registered ids.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.frameworks.keys().map(String::as_str)
    }
}

/// Write `runnable` to the store, reporting failures as backend errors so
/// they are retried with the backend call they precede.
pub(crate) async fn record(
    store: &dyn RunnableStore,
    runnable: &Runnable,
) -> std::result::Result<(), BackendError> {
    store
        .store(runnable)
        .await
        .map_err(|e| BackendError::Unavailable(format!("runnable store: {e}")))
}
