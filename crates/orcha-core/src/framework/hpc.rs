// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `hpcdl`: batch jobs on an HPC scheduler.
//!
//! The scheduler has no watch API, so [`HpcMonitor`] polls the status of
//! every live HPC runnable and publishes a [`ChangeEvent`] when it moves.
//! The scheduler's job id is kept in [`Runnable::handle`].
//! The poller never writes the runnable store itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::{BackendError, Framework, ids, record};
use crate::bus::{ChangeEvent, EventPublisher};
use crate::runnable::Runnable;
use crate::state::State;
use crate::store::RunnableStore;

/// Job status as the scheduler reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HpcJobStatus {
    /// Waiting for an allocation.
    Queued,
    /// Executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed(String),
    /// Cancelled by a user or the control plane.
    Cancelled,
    /// The scheduler does not know the job.
    Unknown,
}

impl HpcJobStatus {
    /// Run state this status reports. Cancellation is driven by the control
    /// plane itself and reports nothing.
    pub fn state(&self) -> Option<State> {
        match self {
            HpcJobStatus::Queued => Some(State::Pending),
            HpcJobStatus::Running => Some(State::Running),
            HpcJobStatus::Completed => Some(State::Completed),
            HpcJobStatus::Failed(_) | HpcJobStatus::Unknown => Some(State::Error),
            HpcJobStatus::Cancelled => None,
        }
    }
}

/// Client of the HPC scheduler.
#[async_trait]
pub trait HpcConnector: Send + Sync {
    /// Submit a job and return the scheduler's job id.
    async fn submit(&self, runnable: &Runnable) -> Result<String, BackendError>;

    /// Current status of `job_id`.
    async fn status(&self, job_id: &str) -> Result<HpcJobStatus, BackendError>;

    /// Cancel `job_id`. Cancelling a finished or unknown job succeeds.
    async fn cancel(&self, job_id: &str) -> Result<(), BackendError>;
}

#[derive(Default)]
struct MockJobs {
    next: u64,
    jobs: HashMap<String, HpcJobStatus>,
    cancelled: Vec<String>,
}

/// Scheduler held in memory; tests move jobs with [`MockHpcConnector::set_status`].
#[derive(Clone, Default)]
pub struct MockHpcConnector {
    inner: Arc<Mutex<MockJobs>>,
}

impl MockHpcConnector {
    /// Empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> Result<std::sync::MutexGuard<'_, MockJobs>, BackendError> {
        self.inner
            .lock()
            .map_err(|_| BackendError::Unavailable("scheduler state poisoned".into()))
    }

    /// Move `job_id` to `status`.
    pub fn set_status(&self, job_id: &str, status: HpcJobStatus) {
        if let Ok(mut jobs) = self.jobs() {
            jobs.jobs.insert(job_id.to_string(), status);
        }
    }

    /// Ids of cancelled jobs, in order.
    pub fn cancelled(&self) -> Vec<String> {
        self.jobs().map(|j| j.cancelled.clone()).unwrap_or_default()
    }

    /// Number of submitted jobs.
    pub fn submitted(&self) -> usize {
        self.jobs().map(|j| j.jobs.len()).unwrap_or(0)
    }
}

#[async_trait]
impl HpcConnector for MockHpcConnector {
    async fn submit(&self, _runnable: &Runnable) -> Result<String, BackendError> {
        let mut jobs = self.jobs()?;
        jobs.next += 1;
        let job_id = format!("hpc-{}", jobs.next);
        jobs.jobs.insert(job_id.clone(), HpcJobStatus::Queued);
        Ok(job_id)
    }

    async fn status(&self, job_id: &str) -> Result<HpcJobStatus, BackendError> {
        Ok(self
            .jobs()?
            .jobs
            .get(job_id)
            .cloned()
            .unwrap_or(HpcJobStatus::Unknown))
    }

    async fn cancel(&self, job_id: &str) -> Result<(), BackendError> {
        let mut jobs = self.jobs()?;
        if let Some(status) = jobs.jobs.get_mut(job_id) {
            *status = HpcJobStatus::Cancelled;
        }
        jobs.cancelled.push(job_id.to_string());
        Ok(())
    }
}

/// Framework submitting runnables to the HPC scheduler.
pub struct HpcFramework {
    connector: Arc<dyn HpcConnector>,
    store: Arc<dyn RunnableStore>,
}

impl HpcFramework {
    /// Framework over `connector`.
    pub fn new(connector: Arc<dyn HpcConnector>, store: Arc<dyn RunnableStore>) -> Self {
        Self { connector, store }
    }

    async fn cancel(&self, runnable: &Runnable) -> Result<(), BackendError> {
        match &runnable.handle {
            Some(job_id) => self.connector.cancel(job_id).await,
            None => Ok(()),
        }
    }

    async fn start(&self, runnable: &Runnable, message: &str) -> Result<Runnable, BackendError> {
        let mut started = runnable.clone().with_state(State::Ready, message);
        started.handle = None;
        record(self.store.as_ref(), &started).await?;

        let job_id = self.connector.submit(&started).await?;
        started.handle = Some(job_id);
        record(self.store.as_ref(), &started).await?;
        info!(
            run_id = %started.id,
            job_id = started.handle.as_deref().unwrap_or_default(),
            "HPC job submitted"
        );
        Ok(started)
    }
}

#[async_trait]
impl Framework for HpcFramework {
    fn id(&self) -> &str {
        ids::HPC
    }

    async fn submit(&self, runnable: &Runnable) -> Result<Runnable, BackendError> {
        // A retried submit finds the job id recorded by the first attempt.
        if let Some(stored) = self
            .store
            .find(&runnable.id)
            .await
            .map_err(|e| BackendError::Unavailable(format!("runnable store: {e}")))?
            && stored.handle.is_some()
            && stored.state == State::Ready
        {
            debug!(run_id = %stored.id, "HPC job already submitted");
            return Ok(stored);
        }
        self.start(runnable, "submitted").await
    }

    async fn stop(&self, runnable: &Runnable) -> Result<Runnable, BackendError> {
        self.cancel(runnable).await?;
        let stopped = runnable.clone().with_state(State::Stopped, "cancelled");
        record(self.store.as_ref(), &stopped).await?;
        Ok(stopped)
    }

    async fn resume(&self, runnable: &Runnable) -> Result<Runnable, BackendError> {
        self.start(runnable, "resubmitted").await
    }

    async fn delete(&self, runnable: &Runnable) -> Result<Runnable, BackendError> {
        if !runnable.state.is_terminal() {
            self.cancel(runnable).await?;
        }
        let deleted = runnable.clone().with_state(State::Deleted, "deleted");
        record(self.store.as_ref(), &deleted).await?;
        Ok(deleted)
    }

    async fn reconcile(&self, runnable: &Runnable) -> Result<Option<State>, BackendError> {
        match &runnable.handle {
            Some(job_id) => Ok(self.connector.status(job_id).await?.state()),
            None => Ok(Some(State::Error)),
        }
    }
}

/// Configuration for the HPC monitor.
#[derive(Debug, Clone)]
pub struct HpcMonitorConfig {
    /// How often live jobs are polled.
    pub poll_interval: Duration,
}

impl Default for HpcMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Background worker polling live HPC jobs.
pub struct HpcMonitor {
    connector: Arc<dyn HpcConnector>,
    store: Arc<dyn RunnableStore>,
    publisher: EventPublisher<ChangeEvent>,
    config: HpcMonitorConfig,
    shutdown: Arc<Notify>,
}

impl HpcMonitor {
    /// Create a monitor publishing to `publisher`.
    pub fn new(
        connector: Arc<dyn HpcConnector>,
        store: Arc<dyn RunnableStore>,
        publisher: EventPublisher<ChangeEvent>,
        config: HpcMonitorConfig,
    ) -> Self {
        Self {
            connector,
            store,
            publisher,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Poll until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "HPC monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("HPC monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "Failed to poll HPC jobs");
                    }
                }
            }
        }

        info!("HPC monitor stopped");
    }

    /// Check every live HPC runnable once. Returns how many changes were
    /// published; a change is published on every poll until the run
    /// manager records it.
    pub async fn poll_once(&self) -> crate::error::Result<usize> {
        let live: Vec<Runnable> = self
            .store
            .find_all()
            .await?
            .into_iter()
            .filter(|r| r.framework == ids::HPC && r.state.is_live())
            .collect();

        let mut changed = 0;
        for runnable in live {
            let Some(job_id) = runnable.handle.as_deref() else {
                continue;
            };
            let status = match self.connector.status(job_id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(run_id = %runnable.id, job_id, error = %e, "HPC status check failed");
                    continue;
                }
            };
            let Some(state) = status.state() else {
                continue;
            };
            if state == runnable.state {
                continue;
            }

            let mut observed = runnable.clone().with_state(state, format!("{status:?}"));
            if let HpcJobStatus::Failed(reason) = &status {
                observed.error = Some(reason.clone());
            }
            debug!(run_id = %observed.id, state = %state, "HPC job changed state");
            if self.publisher.publish(ChangeEvent::observed(observed)).await {
                changed += 1;
            }
        }
        Ok(changed)
    }
}
