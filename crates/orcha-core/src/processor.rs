// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stage-scoped status enrichment.
//!
//! When a run enters a state, every processor registered for that state's
//! stage (`onRunning`, `onCompleted`, `onError`, `onStopped`, `onDeleted`)
//! runs in registration order. Each sees the status accumulated so far and
//! may return a fragment to merge. Enrichment is best effort: a processor
//! that fails or outlives its time bound contributes nothing and the
//! transition goes ahead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backoff::{RetryPolicy, retry_backend};
use crate::entity::{Entity, StatusFragment};
use crate::error::Result;
use crate::framework::FrameworkRegistry;
use crate::runnable::Runnable;

/// Stage names.
pub mod stages {
    /// Run entered `RUNNING`.
    pub const ON_RUNNING: &str = "onRunning";
    /// Run entered `COMPLETED`.
    pub const ON_COMPLETED: &str = "onCompleted";
    /// Alias of [`ON_COMPLETED`] accepted at registration.
    pub const ON_COMPLETE: &str = "onComplete";
    /// Run entered `ERROR`.
    pub const ON_ERROR: &str = "onError";
    /// Run entered `STOPPED`.
    pub const ON_STOPPED: &str = "onStopped";
    /// Run entered `DELETED`.
    pub const ON_DELETED: &str = "onDeleted";

    /// Every stage.
    pub const ALL: [&str; 5] = [ON_RUNNING, ON_COMPLETED, ON_ERROR, ON_STOPPED, ON_DELETED];

    /// Canonical name of `stage`.
    pub fn normalize(stage: &str) -> &str {
        if stage == ON_COMPLETE { ON_COMPLETED } else { stage }
    }
}

/// Post-execution enrichment hook.
#[async_trait]
pub trait RunProcessor: Send + Sync {
    /// Unique name; a second registration under the same name in one stage
    /// is ignored.
    fn name(&self) -> &str;

    /// Fragment to merge into the run's status, if any.
    async fn process(
        &self,
        run: &Entity,
        runnable: &Runnable,
        status: &StatusFragment,
    ) -> Result<Option<StatusFragment>>;
}

/// Bound on one processor call unless configured otherwise.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Stage to processors, in registration order.
#[derive(Clone)]
pub struct ProcessorRegistry {
    stages: HashMap<String, Vec<Arc<dyn RunProcessor>>>,
    timeout: Duration,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self {
            stages: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ProcessorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound each processor call by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register `processor` for each of `stages`.
    pub fn register(&mut self, stages: &[&str], processor: Arc<dyn RunProcessor>) {
        for stage in stages {
            let list = self
                .stages
                .entry(stages::normalize(stage).to_string())
                .or_default();
            if list.iter().any(|p| p.name() == processor.name()) {
                debug!(stage, processor = processor.name(), "Processor already registered");
                continue;
            }
            list.push(processor.clone());
        }
    }

    /// Names registered for `stage`.
    pub fn names(&self, stage: &str) -> Vec<&str> {
        self.stages
            .get(stages::normalize(stage))
            .map(|list| list.iter().map(|p| p.name()).collect())
            .unwrap_or_default()
    }

    /// Run every processor of `stage` and return the merged fragment.
    pub async fn run(&self, stage: &str, run: &Entity, runnable: &Runnable) -> StatusFragment {
        let mut accumulated = StatusFragment::new();
        let Some(list) = self.stages.get(stages::normalize(stage)) else {
            return accumulated;
        };

        for processor in list {
            let mut status = run.status.clone();
            status.extend(accumulated.clone());
            let result =
                tokio::time::timeout(self.timeout, processor.process(run, runnable, &status)).await;
            match result {
                Ok(Ok(Some(fragment))) => accumulated.extend(fragment),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!(
                    run_id = %run.id,
                    stage,
                    processor = processor.name(),
                    error = %e,
                    "Processor failed, skipping"
                ),
                Err(_) => warn!(
                    run_id = %run.id,
                    stage,
                    processor = processor.name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Processor timed out, skipping"
                ),
            }
        }
        accumulated
    }
}

/// Copies the runnable's message and error into status.
#[derive(Debug, Default)]
pub struct RunnableStatusProcessor;

#[async_trait]
impl RunProcessor for RunnableStatusProcessor {
    fn name(&self) -> &str {
        "runnable-status"
    }

    async fn process(
        &self,
        _run: &Entity,
        runnable: &Runnable,
        _status: &StatusFragment,
    ) -> Result<Option<StatusFragment>> {
        let mut fragment = StatusFragment::new();
        if let Some(message) = &runnable.message {
            fragment.insert("message".into(), Value::String(message.clone()));
        }
        if let Some(error) = &runnable.error {
            fragment.insert("error".into(), Value::String(error.clone()));
        }
        Ok((!fragment.is_empty()).then_some(fragment))
    }
}

/// Collects results from the owning framework into `status.results`.
pub struct ResultsProcessor {
    frameworks: Arc<FrameworkRegistry>,
    retry: RetryPolicy,
}

impl ResultsProcessor {
    /// Processor reading from `frameworks`, retrying transient failures.
    pub fn new(frameworks: Arc<FrameworkRegistry>, retry: RetryPolicy) -> Self {
        Self { frameworks, retry }
    }
}

#[async_trait]
impl RunProcessor for ResultsProcessor {
    fn name(&self) -> &str {
        "results"
    }

    async fn process(
        &self,
        _run: &Entity,
        runnable: &Runnable,
        _status: &StatusFragment,
    ) -> Result<Option<StatusFragment>> {
        let framework = self.frameworks.get(&runnable.framework)?;
        let fetched = retry_backend(&self.retry, "fetch_results", || {
            framework.fetch_results(runnable)
        })
        .await?;
        let Some(results) = fetched else {
            return Ok(None);
        };
        let mut fragment = StatusFragment::new();
        fragment.insert("results".into(), Value::Object(results));
        Ok(Some(fragment))
    }
}

/// Registry with the built-in processors, each call bounded by the backend
/// timeout of `retry`.
pub fn default_processors(
    frameworks: Arc<FrameworkRegistry>,
    retry: RetryPolicy,
) -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new().with_timeout(retry.timeout);
    registry.register(&stages::ALL, Arc::new(RunnableStatusProcessor));
    registry.register(
        &[stages::ON_COMPLETED, stages::ON_ERROR],
        Arc::new(ResultsProcessor::new(frameworks, retry)),
    );
    registry
}
