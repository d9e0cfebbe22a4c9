// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run operations.
//!
//! Every run operation goes through the same pipeline:
//!
//! 1. the transition is prepared in memory on the run's lifecycle manager,
//! 2. processors for the entered stage enrich the status,
//! 3. the command the transition produced is executed by the owning
//!    framework, with retries,
//! 4. the run is persisted and the transition announced.
//!
//! A backend failure in step 3 aborts the operation before anything is
//! persisted. An observation handed to [`RunManager::handle`] reaches the
//! runnable store only after step 4. When the framework reports a state
//! one edge further (a stop that finished, a teardown that completed), the
//! run follows it at once.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::backoff::{RetryPolicy, retry_backend};
use crate::entity::{Entity, EntityType};
use crate::error::{Error, Result};
use crate::framework::FrameworkRegistry;
use crate::lifecycle::{
    KindAwareLifecycleManager, LifecycleEvent, LifecycleManager, RunLifecycleManager,
    Transitioned, run_states,
};
use crate::processor::ProcessorRegistry;
use crate::runnable::{Runnable, RunnableCommand};
use crate::runtime::RuntimeRegistry;
use crate::secrets::{GroupedSecrets, SecretResolver};
use crate::spec::{FunctionSpec, RunSpec, TaskSpec};
use crate::state::{Event, State};
use crate::store::{EntityStore, RunnableStore};

/// Capacity of the run event channel.
const EVENT_CAPACITY: usize = 1024;

/// A request to create a run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Owning project.
    pub project: String,
    /// Runtime kind, e.g. `python`.
    pub kind: String,
    /// Display name.
    pub name: String,
    /// Submitting user.
    pub user: Option<String>,
    /// Function defaults.
    pub function: FunctionSpec,
    /// Task settings.
    pub task: TaskSpec,
    /// Run-level values.
    pub run: RunSpec,
}

/// Stores and registries a [`RunManager`] works with.
#[derive(Clone)]
pub struct RunManagerParts {
    /// Run entities.
    pub entities: Arc<dyn EntityStore>,
    /// Submitted runnables.
    pub runnables: Arc<dyn RunnableStore>,
    /// Runtimes by kind.
    pub runtimes: Arc<RuntimeRegistry>,
    /// Frameworks by id.
    pub frameworks: Arc<FrameworkRegistry>,
    /// Secret catalogue.
    pub secrets: Arc<dyn SecretResolver>,
    /// Status processors.
    pub processors: Arc<ProcessorRegistry>,
    /// Backend call bounds.
    pub retry: RetryPolicy,
}

/// Creates, runs, stops, resumes and deletes runs.
pub struct RunManager {
    parts: RunManagerParts,
    lifecycle: KindAwareLifecycleManager<Runnable, RunnableCommand>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl RunManager {
    /// Build one run lifecycle per registered runtime.
    pub fn new(parts: RunManagerParts) -> Result<Self> {
        let events = broadcast::channel(EVENT_CAPACITY).0;
        let mut lifecycle = KindAwareLifecycleManager::new(EntityType::Run, "runtime");
        for runtime in parts.runtimes.iter() {
            let manager: RunLifecycleManager =
                LifecycleManager::builder(EntityType::Run, parts.entities.clone())
                    .states(run_states(runtime.clone()))
                    .events(events.clone())
                    .build()?;
            lifecycle.register(runtime.kind(), Arc::new(manager));
        }
        Ok(Self {
            parts,
            lifecycle,
            events,
        })
    }

    /// Receive run lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Lifecycle dispatcher for runs.
    pub fn lifecycle(&self) -> &KindAwareLifecycleManager<Runnable, RunnableCommand> {
        &self.lifecycle
    }

    /// Run by id, if present.
    pub async fn find(&self, id: &str) -> Result<Option<Entity>> {
        Ok(self.parts.entities.find(id).await?)
    }

    /// Run by id.
    pub async fn get(&self, id: &str) -> Result<Entity> {
        self.find(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("run {id}")))
    }

    /// Runs of one project, or all runs.
    pub async fn list(&self, project: Option<&str>) -> Result<Vec<Entity>> {
        Ok(self.parts.entities.list(EntityType::Run, project).await?)
    }

    /// Compose the effective spec, store the run and move it to `BUILT`.
    pub async fn create(&self, request: RunRequest) -> Result<Entity> {
        let runtime = self.parts.runtimes.get(&request.kind)?;
        let effective = runtime.build(&request.function, &request.task, request.run)?;
        let framework = runtime.framework(&effective.task)?;
        if !effective.local_execution {
            self.parts.frameworks.get(framework)?;
        }

        let mut run = Entity::new(EntityType::Run, request.project, request.kind, request.name)
            .with_spec(effective.to_map()?);
        run.user = request.user;
        let run = self.parts.entities.save(&run).await?;
        info!(run_id = %run.id, kind = %run.kind, task = %effective.task, "Run created");

        self.lifecycle.perform(&run, Event::Build, None).await
    }

    /// Produce the runnable and submit it.
    pub async fn run(&self, id: &str) -> Result<Entity> {
        let run = self.get(id).await?;
        let spec = RunSpec::from_map(&run.spec)?;
        let runnable = if spec.local_execution {
            None
        } else {
            let runtime = self.parts.runtimes.get(&run.kind)?;
            let secrets = match &spec.secrets {
                Some(names) if !names.is_empty() => {
                    self.parts.secrets.resolve(&run.project, names).await?
                }
                _ => GroupedSecrets::new(),
            };
            let mut runnable = runtime.run(&run, &secrets)?;
            runnable.user = run.user.clone();
            Some(runnable)
        };
        self.perform(&run, Event::Run, runnable).await
    }

    /// Halt a live run.
    pub async fn stop(&self, id: &str) -> Result<Entity> {
        let run = self.get(id).await?;
        let runnable = self.parts.runnables.find(id).await?;
        self.perform(&run, Event::Stop, runnable).await
    }

    /// Continue a stopped run.
    pub async fn resume(&self, id: &str) -> Result<Entity> {
        let run = self.get(id).await?;
        let runnable = self.parts.runnables.find(id).await?;
        self.perform(&run, Event::Resume, runnable).await
    }

    /// Tear down and remove a run.
    pub async fn delete(&self, id: &str) -> Result<Entity> {
        let run = self.get(id).await?;
        let runnable = self.parts.runnables.find(id).await?;
        self.perform(&run, Event::Delete, runnable).await
    }

    /// Move `run` to a state its backend reported. `runnable` defaults to
    /// the stored one.
    ///
    /// A supplied runnable is the observation being applied; it is recorded
    /// once the run has committed the state, unless the transition issued a
    /// backend command that recorded its own outcome.
    pub async fn handle(
        &self,
        run: &Entity,
        target: State,
        runnable: Option<Runnable>,
    ) -> Result<Entity> {
        let observed = runnable.is_some();
        let runnable = match runnable {
            Some(runnable) => Some(runnable),
            None => self.parts.runnables.find(&run.id).await?,
        };
        let manager = self.lifecycle.for_entity(run)?;
        let step = manager.prepare_handle(run, target, runnable.as_ref())?;
        self.drive(manager, step, runnable, observed).await
    }

    /// Record an observation whose state the run already holds, when the
    /// stored runnable still lags behind it. Returns whether it was written.
    pub async fn acknowledge(&self, observed: &Runnable) -> Result<bool> {
        if observed.state == State::Deleted {
            return Ok(false);
        }
        let Some(stored) = self.parts.runnables.find(&observed.id).await? else {
            return Ok(false);
        };
        if !stored.state.is_live() || stored.state == observed.state {
            return Ok(false);
        }
        self.parts.runnables.store(observed).await?;
        debug!(run_id = %observed.id, state = %observed.state, "Recorded applied observation");
        Ok(true)
    }

    async fn perform(
        &self,
        run: &Entity,
        event: Event,
        runnable: Option<Runnable>,
    ) -> Result<Entity> {
        let manager = self.lifecycle.for_entity(run)?;
        let step = manager.prepare_perform(run, event, runnable.as_ref())?;
        self.drive(manager, step, runnable, false).await
    }

    async fn drive(
        &self,
        manager: &RunLifecycleManager,
        mut step: Transitioned<RunnableCommand>,
        mut runnable: Option<Runnable>,
        mut observed: bool,
    ) -> Result<Entity> {
        loop {
            if step.applied
                && let Some(current) = &runnable
            {
                let fragment = self
                    .parts
                    .processors
                    .run(&step.to.stage(), &step.entity, current)
                    .await;
                step.entity.merge_status(fragment);
            }

            let reported = match step.output.take() {
                Some(command) => Some(self.dispatch(&command).await?),
                None => None,
            };

            let to = step.to;
            let applied = step.applied;
            let (run, _) = manager.commit(step).await?;
            if applied && to == State::Deleted {
                self.parts.runnables.remove(&run.id).await?;
            } else if observed
                && applied
                && reported.is_none()
                && let Some(current) = runnable.as_ref().filter(|r| r.state == to)
            {
                self.parts.runnables.store(current).await?;
            }
            observed = false;

            let next = match reported {
                Some(reported) if reported.state != to && manager.has_transition(to, reported.state) => {
                    debug!(
                        run_id = %run.id,
                        from = %to,
                        to = %reported.state,
                        "Following state reported by framework"
                    );
                    Some((reported.state, Some(reported)))
                }
                // Nothing on a backend to halt or tear down.
                None if applied && to == State::Stop => Some((State::Stopped, runnable)),
                None if applied && to == State::Deleting => Some((State::Deleted, runnable)),
                _ => None,
            };

            match next {
                Some((target, input)) => {
                    step = manager.prepare_handle(&run, target, input.as_ref())?;
                    runnable = input;
                }
                None => return Ok(run),
            }
        }
    }

    async fn dispatch(&self, command: &RunnableCommand) -> Result<Runnable> {
        let runnable = command.runnable();
        let framework = self.parts.frameworks.get(&runnable.framework)?;
        debug!(
            run_id = %runnable.id,
            framework = %runnable.framework,
            command = command.name(),
            "Dispatching runnable command"
        );

        let reported = retry_backend(&self.parts.retry, command.name(), move || async move {
            match command {
                RunnableCommand::Submit(r) => framework.submit(r).await,
                RunnableCommand::Stop(r) => framework.stop(r).await,
                RunnableCommand::Resume(r) => framework.resume(r).await,
                RunnableCommand::Delete(r) => framework.delete(r).await,
            }
        })
        .await?;
        Ok(reported)
    }
}
