// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Framework-native job descriptors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::secrets::GroupedSecrets;
use crate::spec::{EnvVar, Resources, Volume};
use crate::state::State;

/// A serializable description of work owned by one framework.
///
/// A runnable belongs to exactly one run and shares its id. The framework
/// and the watchers mutate `state`, `message`, `error` and `results` in
/// place as the backend reports progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runnable {
    /// Run id.
    pub id: String,
    /// Owning framework id, e.g. `k8sjob`.
    pub framework: String,
    /// Runtime kind that produced it.
    pub runtime: String,
    /// Task kind.
    pub task: String,
    /// Owning project.
    pub project: String,
    /// Submitting user.
    #[serde(default)]
    pub user: Option<String>,
    /// Container image.
    #[serde(default)]
    pub image: Option<String>,
    /// Entry command.
    #[serde(default)]
    pub command: Option<String>,
    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment.
    #[serde(default)]
    pub envs: Vec<EnvVar>,
    /// Secret name to key set; never secret values.
    #[serde(default)]
    pub secrets: GroupedSecrets,
    /// Compute requirements.
    #[serde(default)]
    pub resources: Option<Resources>,
    /// Volumes.
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Node selector.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Labels added to backend resources.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Files materialized next to the job (e.g. a Dockerfile).
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Workflow manifest for workflow-engine frameworks.
    #[serde(default)]
    pub workflow: Option<Value>,
    /// Backend retry budget.
    #[serde(default)]
    pub backoff_limit: Option<i32>,
    /// Backend handle assigned on submission (e.g. a scheduler job id).
    #[serde(default)]
    pub handle: Option<String>,
    /// Last state reported for the work.
    pub state: State,
    /// Human-readable progress message.
    #[serde(default)]
    pub message: Option<String>,
    /// Failure description.
    #[serde(default)]
    pub error: Option<String>,
    /// Results collected from the backend.
    #[serde(default)]
    pub results: Option<Map<String, Value>>,
}

impl Runnable {
    /// A runnable in `CREATED` for the given run.
    pub fn new(
        id: impl Into<String>,
        framework: impl Into<String>,
        runtime: impl Into<String>,
        task: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            framework: framework.into(),
            runtime: runtime.into(),
            task: task.into(),
            project: project.into(),
            user: None,
            image: None,
            command: None,
            args: Vec::new(),
            envs: Vec::new(),
            secrets: GroupedSecrets::new(),
            resources: None,
            volumes: Vec::new(),
            node_selector: BTreeMap::new(),
            labels: BTreeMap::new(),
            files: BTreeMap::new(),
            workflow: None,
            backoff_limit: None,
            handle: None,
            state: State::Created,
            message: None,
            error: None,
            results: None,
        }
    }

    /// Copy with a new state and message.
    pub fn with_state(mut self, state: State, message: impl Into<String>) -> Self {
        self.state = state;
        self.message = Some(message.into());
        self
    }

    /// Value of environment variable `name`.
    pub fn env(&self, name: &str) -> Option<&str> {
        self.envs
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }
}

/// What a run transition asks of the owning framework.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnableCommand {
    /// Persist and submit.
    Submit(Runnable),
    /// Halt the work.
    Stop(Runnable),
    /// Continue halted work.
    Resume(Runnable),
    /// Tear down backend resources.
    Delete(Runnable),
}

impl RunnableCommand {
    /// The runnable the command carries.
    pub fn runnable(&self) -> &Runnable {
        match self {
            RunnableCommand::Submit(r)
            | RunnableCommand::Stop(r)
            | RunnableCommand::Resume(r)
            | RunnableCommand::Delete(r) => r,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            RunnableCommand::Submit(_) => "submit",
            RunnableCommand::Stop(_) => "stop",
            RunnableCommand::Resume(_) => "resume",
            RunnableCommand::Delete(_) => "delete",
        }
    }
}
