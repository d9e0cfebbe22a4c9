// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable control plane.
//!
//! [`ControlPlane`] assembles the registries, lifecycle managers and
//! background tasks and runs them inside an existing tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use orcha_core::control_plane::ControlPlane;
//! use orcha_core::framework::k8s::InMemoryCluster;
//! use orcha_core::secrets::MemorySecretResolver;
//! use orcha_core::store::{MemoryEntityStore, MemoryRunnableStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let plane = ControlPlane::builder()
//!         .entity_store(Arc::new(MemoryEntityStore::new()))
//!         .runnable_store(Arc::new(MemoryRunnableStore::new()))
//!         .kube_api(Arc::new(InMemoryCluster::new()))
//!         .secrets(Arc::new(MemorySecretResolver::new()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... create and run runs through plane.runs() ...
//!
//!     plane.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! On start, runnables left in a live state by a previous process are
//! reconciled against their backends, and any state their run has not
//! applied is replayed through the monitor. Nothing is resubmitted.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffPolicy, RetryPolicy};
use crate::bus::{ChangeEvent, EventBus, EventPublisher};
use crate::config::Config;
use crate::entity::{EntityType, StatusFragment};
use crate::framework::k8s::{
    JobResource, K8sFramework, KanikoResource, KubeApi, ResourceStateMapper, WorkflowResource,
};
use crate::framework::{
    Framework, FrameworkRegistry, HpcConnector, HpcFramework, HpcMonitor, HpcMonitorConfig,
};
use crate::lifecycle::{
    LifecycleManager, NoopTriggerActuator, TriggerActuator, label_states, trigger_states,
    uploadable_states, workflow_states,
};
use crate::monitor::RunMonitor;
use crate::processor::{RunProcessor, default_processors};
use crate::run_manager::{RunManager, RunManagerParts};
use crate::runtime::{Runtime, RuntimeRegistry, default_runtimes};
use crate::secrets::SecretResolver;
use crate::state::State;
use crate::store::{EntityListener, EntityStore, HookedEntityStore, RunnableStore};
use crate::watcher::ResourceWatcher;

/// Lifecycle manager for entities without runs.
pub type EntityLifecycleManager = LifecycleManager<Value, StatusFragment>;

/// Capacity of the change-event bus.
const BUS_CAPACITY: usize = 1024;

/// Builder for a [`ControlPlane`].
pub struct ControlPlaneBuilder {
    config: Config,
    entities: Option<Arc<dyn EntityStore>>,
    runnables: Option<Arc<dyn RunnableStore>>,
    kube: Option<Arc<dyn KubeApi>>,
    hpc: Option<Arc<dyn HpcConnector>>,
    secrets: Option<Arc<dyn SecretResolver>>,
    trigger_actuator: Arc<dyn TriggerActuator>,
    runtimes: Vec<Arc<dyn Runtime>>,
    processors: Vec<(Vec<String>, Arc<dyn RunProcessor>)>,
    listeners: Vec<Arc<dyn EntityListener>>,
    watch_backoff: BackoffPolicy,
}

impl Default for ControlPlaneBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            entities: None,
            runnables: None,
            kube: None,
            hpc: None,
            secrets: None,
            trigger_actuator: Arc::new(NoopTriggerActuator),
            runtimes: Vec::new(),
            processors: Vec::new(),
            listeners: Vec::new(),
            watch_backoff: BackoffPolicy::default(),
        }
    }
}

impl ControlPlaneBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    ///
    /// Default: [`Config::default`]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the entity store (required).
    pub fn entity_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.entities = Some(store);
        self
    }

    /// Set the runnable store (required).
    pub fn runnable_store(mut self, store: Arc<dyn RunnableStore>) -> Self {
        self.runnables = Some(store);
        self
    }

    /// Set the cluster API client (required).
    pub fn kube_api(mut self, api: Arc<dyn KubeApi>) -> Self {
        self.kube = Some(api);
        self
    }

    /// Set the HPC scheduler client. Without one, `hpcdl` runs cannot be
    /// submitted.
    pub fn hpc_connector(mut self, connector: Arc<dyn HpcConnector>) -> Self {
        self.hpc = Some(connector);
        self
    }

    /// Set the secret resolver (required).
    pub fn secrets(mut self, secrets: Arc<dyn SecretResolver>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Set what starts and stops triggers.
    ///
    /// Default: [`NoopTriggerActuator`]
    pub fn trigger_actuator(mut self, actuator: Arc<dyn TriggerActuator>) -> Self {
        self.trigger_actuator = actuator;
        self
    }

    /// Register a runtime next to the built-in ones, replacing a built-in
    /// of the same kind.
    pub fn runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.runtimes.push(runtime);
        self
    }

    /// Register a processor for `stages` after the built-in ones.
    pub fn processor(mut self, stages: &[&str], processor: Arc<dyn RunProcessor>) -> Self {
        self.processors
            .push((stages.iter().map(|s| s.to_string()).collect(), processor));
        self
    }

    /// Notify `listener` after every committed entity write, in
    /// registration order.
    pub fn listener(mut self, listener: Arc<dyn EntityListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Set the delay growth between watch resubscribes.
    pub fn watch_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.watch_backoff = backoff;
        self
    }

    /// Assemble registries and lifecycle managers.
    ///
    /// Returns an error if required collaborators are missing or a
    /// transition table is malformed.
    pub fn build(self) -> Result<ControlPlaneConfig> {
        let mut entities = self
            .entities
            .ok_or_else(|| anyhow::anyhow!("entity_store is required"))?;
        if !self.listeners.is_empty() {
            let hooked = self
                .listeners
                .into_iter()
                .fold(HookedEntityStore::new(entities), HookedEntityStore::with_listener);
            entities = Arc::new(hooked);
        }
        let runnables = self
            .runnables
            .ok_or_else(|| anyhow::anyhow!("runnable_store is required"))?;
        let kube = self
            .kube
            .ok_or_else(|| anyhow::anyhow!("kube_api is required"))?;
        let secrets = self
            .secrets
            .ok_or_else(|| anyhow::anyhow!("secrets is required"))?;
        let namespace = self.config.namespace.clone();

        let jobs = Arc::new(K8sFramework::<JobResource>::new(
            kube.clone(),
            runnables.clone(),
            namespace.clone(),
        ));
        let builds = Arc::new(K8sFramework::<KanikoResource>::new(
            kube.clone(),
            runnables.clone(),
            namespace.clone(),
        ));
        let workflows = Arc::new(K8sFramework::<WorkflowResource>::new(
            kube.clone(),
            runnables.clone(),
            namespace,
        ));
        let mappers: Vec<Arc<dyn ResourceStateMapper>> = vec![
            jobs.clone() as Arc<dyn ResourceStateMapper>,
            builds.clone(),
            workflows.clone(),
        ];

        let mut frameworks = FrameworkRegistry::new();
        frameworks.register(jobs);
        frameworks.register(builds);
        frameworks.register(workflows);
        if let Some(hpc) = &self.hpc {
            frameworks.register(Arc::new(HpcFramework::new(hpc.clone(), runnables.clone())));
        }
        let frameworks = Arc::new(frameworks);

        let mut runtimes = RuntimeRegistry::new();
        for runtime in default_runtimes(&self.config).into_iter().chain(self.runtimes) {
            runtimes.register(runtime);
        }

        let retry = RetryPolicy::from_config(&self.config);
        let mut processors = default_processors(frameworks.clone(), retry);
        for (stages, processor) in self.processors {
            let stages: Vec<&str> = stages.iter().map(String::as_str).collect();
            processors.register(&stages, processor);
        }

        let runs = RunManager::new(RunManagerParts {
            entities: entities.clone(),
            runnables: runnables.clone(),
            runtimes: Arc::new(runtimes),
            frameworks: frameworks.clone(),
            secrets,
            processors: Arc::new(processors),
            retry,
        })?;

        let uploadable = |entity_type| -> Result<Arc<EntityLifecycleManager>> {
            Ok(Arc::new(
                LifecycleManager::builder(entity_type, entities.clone())
                    .states(uploadable_states())
                    .states(label_states())
                    .build()?,
            ))
        };
        let managers = EntityManagers {
            artifacts: uploadable(EntityType::Artifact)?,
            data_items: uploadable(EntityType::DataItem)?,
            models: uploadable(EntityType::Model)?,
            workflows: Arc::new(
                LifecycleManager::builder(EntityType::Workflow, entities.clone())
                    .states(workflow_states())
                    .build()?,
            ),
            triggers: Arc::new(
                LifecycleManager::builder(EntityType::Trigger, entities.clone())
                    .states(trigger_states(self.trigger_actuator))
                    .build()?,
            ),
        };

        Ok(ControlPlaneConfig {
            config: self.config,
            entities,
            runnables,
            kube,
            hpc: self.hpc,
            frameworks,
            mappers,
            runs: Arc::new(runs),
            managers,
            watch_backoff: self.watch_backoff,
        })
    }
}

#[derive(Clone)]
struct EntityManagers {
    artifacts: Arc<EntityLifecycleManager>,
    data_items: Arc<EntityLifecycleManager>,
    models: Arc<EntityLifecycleManager>,
    workflows: Arc<EntityLifecycleManager>,
    triggers: Arc<EntityLifecycleManager>,
}

/// An assembled, not yet started control plane.
pub struct ControlPlaneConfig {
    config: Config,
    entities: Arc<dyn EntityStore>,
    runnables: Arc<dyn RunnableStore>,
    kube: Arc<dyn KubeApi>,
    hpc: Option<Arc<dyn HpcConnector>>,
    frameworks: Arc<FrameworkRegistry>,
    mappers: Vec<Arc<dyn ResourceStateMapper>>,
    runs: Arc<RunManager>,
    managers: EntityManagers,
    watch_backoff: BackoffPolicy,
}

impl ControlPlaneConfig {
    /// Start the monitor workers, watchers and HPC poller, then reconcile
    /// runnables left live by a previous process.
    pub async fn start(self) -> Result<ControlPlane> {
        let bus = EventBus::new(BUS_CAPACITY);
        let monitor = Arc::new(RunMonitor::new(self.runs.clone()));
        let worker_handles = bus.spawn_workers(self.config.monitor_workers, monitor);

        let mut tasks = Vec::new();
        for mapper in &self.mappers {
            let watcher = ResourceWatcher::new(
                self.kube.clone(),
                mapper.clone(),
                self.runnables.clone(),
                bus.publisher(),
                self.watch_backoff,
            );
            let shutdown = watcher.shutdown_handle();
            let handle = tokio::spawn(async move {
                watcher.run().await;
            });
            tasks.push(BackgroundTask {
                name: format!("{} watcher", mapper.framework()),
                shutdown,
                handle,
            });
        }

        if let Some(connector) = &self.hpc {
            let hpc_monitor = HpcMonitor::new(
                connector.clone(),
                self.runnables.clone(),
                bus.publisher(),
                HpcMonitorConfig {
                    poll_interval: self.config.hpc_poll_interval,
                },
            );
            let shutdown = hpc_monitor.shutdown_handle();
            let handle = tokio::spawn(async move {
                hpc_monitor.run().await;
            });
            tasks.push(BackgroundTask {
                name: "HPC monitor".to_string(),
                shutdown,
                handle,
            });
        }

        match recover_runnables(
            self.runnables.as_ref(),
            self.entities.as_ref(),
            &self.frameworks,
            &bus.publisher(),
        )
        .await
        {
            Ok(replayed) => debug!(replayed, "Recovery finished"),
            Err(e) => warn!(error = %e, "Failed to recover runnables"),
        }

        info!(
            namespace = %self.config.namespace,
            monitor_workers = self.config.monitor_workers,
            watchers = self.mappers.len(),
            hpc = self.hpc.is_some(),
            "ControlPlane started"
        );

        Ok(ControlPlane {
            bus,
            worker_handles,
            tasks,
            runs: self.runs,
            managers: self.managers,
            frameworks: self.frameworks,
        })
    }
}

struct BackgroundTask {
    name: String,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// A running control plane.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ControlPlane {
    bus: EventBus<ChangeEvent>,
    worker_handles: Vec<JoinHandle<()>>,
    tasks: Vec<BackgroundTask>,
    runs: Arc<RunManager>,
    managers: EntityManagers,
    frameworks: Arc<FrameworkRegistry>,
}

impl ControlPlane {
    /// Create a new builder for configuring the control plane.
    pub fn builder() -> ControlPlaneBuilder {
        ControlPlaneBuilder::new()
    }

    /// Run operations.
    pub fn runs(&self) -> &Arc<RunManager> {
        &self.runs
    }

    /// Artifact lifecycle.
    pub fn artifacts(&self) -> &Arc<EntityLifecycleManager> {
        &self.managers.artifacts
    }

    /// Data item lifecycle.
    pub fn data_items(&self) -> &Arc<EntityLifecycleManager> {
        &self.managers.data_items
    }

    /// Model lifecycle.
    pub fn models(&self) -> &Arc<EntityLifecycleManager> {
        &self.managers.models
    }

    /// Workflow lifecycle.
    pub fn workflows(&self) -> &Arc<EntityLifecycleManager> {
        &self.managers.workflows
    }

    /// Trigger lifecycle.
    pub fn triggers(&self) -> &Arc<EntityLifecycleManager> {
        &self.managers.triggers
    }

    /// Registered frameworks.
    pub fn frameworks(&self) -> &Arc<FrameworkRegistry> {
        &self.frameworks
    }

    /// Publish change events from an external source.
    pub fn publisher(&self) -> EventPublisher<ChangeEvent> {
        self.bus.publisher()
    }

    /// Check if every background task is still running.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().all(|t| !t.handle.is_finished())
            && self.worker_handles.iter().all(|h| !h.is_finished())
    }

    /// Gracefully shut down.
    ///
    /// Watchers and the HPC poller stop first so no new events arrive,
    /// then the monitor workers finish their current event and exit.
    pub async fn shutdown(self) -> Result<()> {
        info!("ControlPlane shutting down...");

        for task in &self.tasks {
            task.shutdown.notify_one();
        }
        for task in self.tasks {
            if let Err(e) = task.handle.await {
                error!("{} task panicked: {}", task.name, e);
            }
        }

        self.bus.shutdown();
        for handle in self.worker_handles {
            if let Err(e) = handle.await {
                error!("Monitor worker task panicked: {}", e);
            }
        }

        info!("ControlPlane shutdown complete");
        Ok(())
    }
}

/// Reconcile every live runnable with its backend and replay what the run
/// has not applied yet.
///
/// The backend state is compared with the run itself, not only with the
/// stored runnable, so an observation lost before its run committed is
/// published again. Returns how many observations were published.
pub async fn recover_runnables(
    runnables: &dyn RunnableStore,
    entities: &dyn EntityStore,
    frameworks: &FrameworkRegistry,
    publisher: &EventPublisher<ChangeEvent>,
) -> crate::error::Result<usize> {
    let live: Vec<_> = runnables
        .find_all()
        .await?
        .into_iter()
        .filter(|r| r.state.is_live())
        .collect();
    if live.is_empty() {
        return Ok(0);
    }
    info!(count = live.len(), "Reconciling live runnables");

    let mut published = 0;
    for runnable in live {
        let framework: &Arc<dyn Framework> = match frameworks.get(&runnable.framework) {
            Ok(framework) => framework,
            Err(e) => {
                warn!(run_id = %runnable.id, error = %e, "Cannot reconcile runnable");
                continue;
            }
        };
        let state = match framework.reconcile(&runnable).await {
            Ok(Some(state)) => state,
            Ok(None) => continue,
            Err(e) => {
                warn!(run_id = %runnable.id, error = %e, "Failed to reconcile runnable");
                continue;
            }
        };
        let Some(run) = entities.find(&runnable.id).await? else {
            debug!(run_id = %runnable.id, "Runnable has no run, skipping");
            continue;
        };
        let run_state = match run.state() {
            Ok(run_state) => run_state,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Run has no usable state, skipping");
                continue;
            }
        };
        if state == runnable.state && state == run_state {
            continue;
        }
        // Only runs waiting on their backend take reported states; anything
        // else would fire a user transition again.
        if !run_state.is_live() {
            debug!(
                run_id = %run.id,
                run_state = %run_state,
                state = %state,
                "Run not waiting on backend, skipping"
            );
            continue;
        }

        let mut observed = runnable.with_state(state, "reconciled after restart");
        if state == State::Error && observed.error.is_none() {
            observed.error = Some("backend lost track of the work".into());
        }
        info!(
            run_id = %observed.id,
            run_state = %run_state,
            state = %state,
            "Replaying reconciled state"
        );
        if publisher.publish(ChangeEvent::observed(observed)).await {
            published += 1;
        }
    }
    Ok(published)
}
