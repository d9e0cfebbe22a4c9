// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtimes.
//!
//! A [`Runtime`] owns one run kind (`python`, `dbt`, ...). For each task
//! kind it supports it holds a [`Builder`] that produces the effective spec
//! and a [`Runner`] that turns that spec into a runnable. Its callbacks add
//! status fragments as the run moves through its lifecycle.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::entity::{Entity, StatusFragment};
use crate::error::{Error, Result};
use crate::runnable::Runnable;
use crate::secrets::GroupedSecrets;
use crate::spec::{Builder, FunctionSpec, RunSpec, TaskSpec};
use crate::state::State;

pub mod kinds;
pub mod runner;

pub use kinds::{
    container_runtime, dbt_runtime, default_runtimes, hpcdl_runtime, kaniko_runtime, kfp_runtime,
    python_runtime,
};
pub use runner::{
    ContainerJobRunner, HpcJobRunner, KanikoBuildRunner, PipelineRunner, Runner, WrapperJobRunner,
};

/// Runtime for one run kind.
pub trait Runtime: Send + Sync {
    /// Run kind, e.g. `python`.
    fn kind(&self) -> &str;

    /// Task kinds this runtime supports.
    fn task_kinds(&self) -> Vec<&str>;

    /// Framework that executes `task`.
    fn framework(&self, task: &str) -> Result<&str>;

    /// Effective spec for a new run; the builder is chosen by `run.task`.
    fn build(&self, function: &FunctionSpec, task: &TaskSpec, run: RunSpec) -> Result<RunSpec>;

    /// Runnable for `run`, whose spec is already effective.
    fn run(&self, run: &Entity, secrets: &GroupedSecrets) -> Result<Runnable>;

    /// Stop request for `runnable`, or `None` if there is nothing to stop.
    fn stop(&self, runnable: &Runnable) -> Option<Runnable> {
        (!runnable.state.is_terminal())
            .then(|| runnable.clone().with_state(State::Stop, "stop requested"))
    }

    /// Resume request for `runnable`.
    fn resume(&self, runnable: &Runnable) -> Option<Runnable> {
        Some(runnable.clone().with_state(State::Resume, "resume requested"))
    }

    /// Teardown request for `runnable`, or `None` once it is gone.
    fn delete(&self, runnable: &Runnable) -> Option<Runnable> {
        (runnable.state != State::Deleted)
            .then(|| runnable.clone().with_state(State::Deleting, "delete requested"))
    }

    /// Run became `READY`.
    fn on_ready(&self, _run: &Entity, _runnable: Option<&Runnable>) -> Option<StatusFragment> {
        None
    }

    /// Run became `RUNNING`.
    fn on_running(&self, _run: &Entity, _runnable: Option<&Runnable>) -> Option<StatusFragment> {
        None
    }

    /// Run became `COMPLETED`.
    fn on_complete(&self, _run: &Entity, _runnable: Option<&Runnable>) -> Option<StatusFragment> {
        None
    }

    /// Run became `ERROR`.
    fn on_error(&self, _run: &Entity, _runnable: Option<&Runnable>) -> Option<StatusFragment> {
        None
    }

    /// Run became `STOPPED`.
    fn on_stopped(&self, _run: &Entity, _runnable: Option<&Runnable>) -> Option<StatusFragment> {
        None
    }

    /// Run became `DELETED`.
    fn on_deleted(&self, _run: &Entity, _runnable: Option<&Runnable>) -> Option<StatusFragment> {
        None
    }
}

/// Builder and runner for one task kind.
#[derive(Clone)]
pub struct TaskBinding {
    /// Produces the effective spec.
    pub builder: Arc<dyn Builder>,
    /// Produces the runnable.
    pub runner: Arc<dyn Runner>,
}

/// Runtime assembled from task bindings.
#[derive(Clone)]
pub struct BaseRuntime {
    kind: String,
    tasks: BTreeMap<String, TaskBinding>,
}

impl BaseRuntime {
    /// Runtime for `kind` with no tasks.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            tasks: BTreeMap::new(),
        }
    }

    /// Bind `task` to a builder and runner.
    pub fn task(
        mut self,
        task: impl Into<String>,
        builder: Arc<dyn Builder>,
        runner: Arc<dyn Runner>,
    ) -> Self {
        self.tasks
            .insert(task.into(), TaskBinding { builder, runner });
        self
    }

    fn binding(&self, task: &str) -> Result<&TaskBinding> {
        self.tasks
            .get(task)
            .ok_or_else(|| Error::unknown_kind("task", format!("{}+{task}", self.kind)))
    }

    fn timestamp(key: &str) -> StatusFragment {
        let mut fragment = StatusFragment::new();
        fragment.insert(key.into(), Value::String(Utc::now().to_rfc3339()));
        fragment
    }
}

impl Runtime for BaseRuntime {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn task_kinds(&self) -> Vec<&str> {
        self.tasks.keys().map(String::as_str).collect()
    }

    fn framework(&self, task: &str) -> Result<&str> {
        Ok(self.binding(task)?.runner.framework())
    }

    fn build(&self, function: &FunctionSpec, task: &TaskSpec, run: RunSpec) -> Result<RunSpec> {
        self.binding(&run.task)?.builder.build(function, task, run)
    }

    fn run(&self, run: &Entity, secrets: &GroupedSecrets) -> Result<Runnable> {
        if run.kind != self.kind {
            return Err(Error::InvalidRequest(format!(
                "{} runtime cannot run {} run {}",
                self.kind, run.kind, run.id
            )));
        }
        let spec = RunSpec::from_map(&run.spec)?;
        self.binding(&spec.task)?.runner.produce(run, &spec, secrets)
    }

    fn on_running(&self, _run: &Entity, _runnable: Option<&Runnable>) -> Option<StatusFragment> {
        Some(Self::timestamp("started_at"))
    }

    fn on_complete(&self, _run: &Entity, _runnable: Option<&Runnable>) -> Option<StatusFragment> {
        Some(Self::timestamp("finished_at"))
    }

    fn on_error(&self, _run: &Entity, _runnable: Option<&Runnable>) -> Option<StatusFragment> {
        Some(Self::timestamp("finished_at"))
    }
}

/// Run kind to runtime.
#[derive(Clone, Default)]
pub struct RuntimeRegistry {
    runtimes: HashMap<String, Arc<dyn Runtime>>,
}

impl RuntimeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the runtime's own kind, replacing any previous entry.
    pub fn register(&mut self, runtime: Arc<dyn Runtime>) {
        self.runtimes.insert(runtime.kind().to_string(), runtime);
    }

    /// Runtime for `kind`.
    pub fn get(&self, kind: &str) -> Result<&Arc<dyn Runtime>> {
        self.runtimes
            .get(kind)
            .ok_or_else(|| Error::unknown_kind("runtime", kind))
    }

    /// All registered runtimes.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Runtime>> {
        self.runtimes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::entity::EntityType;
    use crate::framework::ids;

    #[test]
    fn test_unknown_runtime_names_kind() {
        let registry = RuntimeRegistry::new();

        let err = registry.get("julia").err().unwrap();

        assert_eq!(err.error_code(), "UNKNOWN_KIND");
        assert!(err.to_string().contains("julia"));
    }

    #[test]
    fn test_unknown_task_names_pair() {
        let runtime = python_runtime(&Config::default());

        let err = runtime
            .build(&FunctionSpec::default(), &TaskSpec::default(), RunSpec::new("serve"))
            .unwrap_err();

        assert_eq!(err.error_code(), "UNKNOWN_KIND");
        assert!(err.to_string().contains("python+serve"));
    }

    #[test]
    fn test_framework_follows_task() {
        let runtime = python_runtime(&Config::default());

        assert_eq!(runtime.framework("job").unwrap(), ids::K8S_JOB);
        assert_eq!(runtime.framework("build").unwrap(), ids::K8S_KANIKO);
        assert_eq!(runtime.task_kinds(), vec!["build", "job"]);
    }

    #[test]
    fn test_run_reads_effective_spec_from_entity() {
        let runtime = container_runtime(&Config::default());
        let mut spec = RunSpec::new("job");
        spec.image = Some("busybox".into());
        let run = Entity::new(EntityType::Run, "demo", "container", "r")
            .with_spec(spec.to_map().unwrap());

        let runnable = runtime.run(&run, &GroupedSecrets::new()).unwrap();

        assert_eq!(runnable.id, run.id);
        assert_eq!(runnable.runtime, "container");
        assert_eq!(runnable.task, "job");
        assert_eq!(runnable.state, State::Created);
    }

    #[test]
    fn test_default_commands_respect_state() {
        let runtime = container_runtime(&Config::default());
        let runnable = Runnable::new("r", ids::K8S_JOB, "container", "job", "demo");

        assert_eq!(runtime.stop(&runnable).unwrap().state, State::Stop);
        assert_eq!(runtime.delete(&runnable).unwrap().state, State::Deleting);

        let finished = runnable.clone().with_state(State::Completed, "done");
        assert!(runtime.stop(&finished).is_none());

        let gone = runnable.with_state(State::Deleted, "gone");
        assert!(runtime.delete(&gone).is_none());
    }
}
