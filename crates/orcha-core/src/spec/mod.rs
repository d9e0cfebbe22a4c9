// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function, task and run specs.
//!
//! Each spec is a fixed-schema struct plus an `extra` map for keys outside
//! the schema. [`RunSpec::merge`] composes the three into the effective run
//! spec: run values win, then task values, then function defaults. Fields
//! holding lists or maps are replaced as a whole, never concatenated.
//!
//! `extra` never carries a key named like a [`RunSpec`] field. Such keys
//! are dropped on merge and on serialization, so they cannot shadow the
//! typed value once the spec is stored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};

mod builder;

pub use builder::{Builder, Requirement, ValidatingBuilder};

/// Source code shipped with a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCode {
    /// Inline source (base64 when `base64` is set), or a URL.
    pub source: String,
    /// Entry point, e.g. `main:handler`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    /// Language tag, e.g. `python`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    /// Whether `source` is base64-encoded.
    #[serde(default)]
    pub base64: bool,
}

/// An environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Name.
    pub name: String,
    /// Value.
    pub value: String,
}

impl EnvVar {
    /// Create a variable.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Compute requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU quantity, e.g. `500m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory quantity, e.g. `1Gi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// GPU count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
}

/// Where a volume's content comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeSource {
    /// A persistent volume claim.
    PersistentVolumeClaim {
        /// Claim name.
        claim_name: String,
    },
    /// A config map.
    ConfigMap {
        /// Config map name.
        name: String,
    },
    /// Scratch space.
    EmptyDir,
}

/// A volume mounted into the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name.
    pub name: String,
    /// Mount path inside the container.
    pub mount_path: String,
    /// Content source.
    pub source: VolumeSource,
}

/// Function-level defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    /// Container image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Base image for builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    /// Entry command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Source code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceCode>,
    /// Package requirements installed at build time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Vec<String>>,
    /// Opaque workflow definition handed to the workflow engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Value>,
    /// Keys outside the schema.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Task-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Function reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Image override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Command override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Argument override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Extra environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envs: Option<Vec<EnvVar>>,
    /// Secret names to attach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Vec<String>>,
    /// Compute requirements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    /// Volumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,
    /// Node selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    /// Labels added to backend resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    /// Backend retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
    /// Image destination for builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Keys outside the schema.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Run-level request, and after [`RunSpec::merge`] the effective spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    /// Task kind, e.g. `job`.
    pub task: String,
    /// Function reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Executed outside the control plane; no backend is ever touched.
    #[serde(default)]
    pub local_execution: bool,
    /// Named inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Map<String, Value>>,
    /// Named outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Map<String, Value>>,
    /// Parameters passed to the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    /// Container image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Base image for builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    /// Entry command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Source code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceCode>,
    /// Package requirements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Vec<String>>,
    /// Opaque workflow definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Value>,
    /// Extra environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envs: Option<Vec<EnvVar>>,
    /// Secret names to attach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Vec<String>>,
    /// Compute requirements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    /// Volumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,
    /// Node selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    /// Labels added to backend resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    /// Backend retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
    /// Image destination for builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Keys outside the schema.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Serialized names of the typed [`RunSpec`] fields.
const RUN_SPEC_FIELDS: [&str; 21] = [
    "task",
    "function",
    "local_execution",
    "inputs",
    "outputs",
    "parameters",
    "image",
    "base_image",
    "command",
    "args",
    "source",
    "requirements",
    "workflow",
    "envs",
    "secrets",
    "resources",
    "volumes",
    "node_selector",
    "labels",
    "backoff_limit",
    "destination",
];

fn is_typed_field(key: &str) -> bool {
    RUN_SPEC_FIELDS.contains(&key)
}

/// First present value: run, then task, then function.
macro_rules! pick {
    ($run:expr, $task:expr, $function:expr) => {
        $run.or_else(|| $task.clone()).or_else(|| $function.clone())
    };
    ($run:expr, $other:expr) => {
        $run.or_else(|| $other.clone())
    };
}

impl RunSpec {
    /// A run request for `task`.
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    /// Compose the effective spec, field by field.
    pub fn merge(function: &FunctionSpec, task: &TaskSpec, run: RunSpec) -> RunSpec {
        let mut extra = Map::new();
        for bag in [&function.extra, &task.extra, &run.extra] {
            for (key, value) in bag {
                if is_typed_field(key) {
                    debug!(key = %key, "Dropping extra key shadowing a spec field");
                } else if !value.is_null() {
                    extra.insert(key.clone(), value.clone());
                }
            }
        }

        RunSpec {
            task: run.task,
            function: pick!(run.function, task.function),
            local_execution: run.local_execution,
            inputs: run.inputs,
            outputs: run.outputs,
            parameters: run.parameters,
            image: pick!(run.image, task.image, function.image),
            base_image: pick!(run.base_image, function.base_image),
            command: pick!(run.command, task.command, function.command),
            args: pick!(run.args, task.args, function.args),
            source: pick!(run.source, function.source),
            requirements: pick!(run.requirements, function.requirements),
            workflow: pick!(run.workflow, function.workflow),
            envs: pick!(run.envs, task.envs),
            secrets: pick!(run.secrets, task.secrets),
            resources: pick!(run.resources, task.resources),
            volumes: pick!(run.volumes, task.volumes),
            node_selector: pick!(run.node_selector, task.node_selector),
            labels: pick!(run.labels, task.labels),
            backoff_limit: pick!(run.backoff_limit, task.backoff_limit),
            destination: pick!(run.destination, task.destination),
            extra,
        }
    }

    /// Read the spec stored on a run entity.
    pub fn from_map(map: &Map<String, Value>) -> Result<RunSpec> {
        Ok(serde_json::from_value(Value::Object(map.clone()))?)
    }

    /// Serialize for storage on a run entity.
    pub fn to_map(&self) -> Result<Map<String, Value>> {
        let mut extra = self.extra.clone();
        extra.retain(|key, _| !is_typed_field(key));
        let mut map = match serde_json::to_value(RunSpec {
            extra: Map::new(),
            ..self.clone()
        })? {
            Value::Object(map) => map,
            other => {
                return Err(Error::InvalidSpec(format!(
                    "run spec serialized to non-object {other}"
                )));
            }
        };
        map.extend(extra);
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn function() -> FunctionSpec {
        serde_json::from_value(json!({
            "image": "python:3.11",
            "command": "python",
            "args": ["main.py"],
            "requirements": ["pandas"],
            "source": {"source": "cHJpbnQoKQ==", "base64": true, "handler": "main:handler"},
            "owner": "function",
            "color": "blue"
        }))
        .unwrap()
    }

    fn task() -> TaskSpec {
        serde_json::from_value(json!({
            "function": "python://demo/etl:1",
            "image": "python:3.12",
            "envs": [{"name": "MODE", "value": "task"}],
            "resources": {"cpu": "1"},
            "backoff_limit": 2,
            "owner": "task"
        }))
        .unwrap()
    }

    #[test]
    fn test_run_value_wins_over_task_and_function() {
        let mut run = RunSpec::new("job");
        run.image = Some("custom:latest".into());
        run.envs = Some(vec![EnvVar::new("MODE", "run")]);
        run.extra.insert("owner".into(), json!("run"));

        let effective = RunSpec::merge(&function(), &task(), run);

        assert_eq!(effective.image.as_deref(), Some("custom:latest"));
        assert_eq!(effective.envs, Some(vec![EnvVar::new("MODE", "run")]));
        assert_eq!(effective.extra["owner"], json!("run"));
    }

    #[test]
    fn test_task_value_wins_over_function() {
        let effective = RunSpec::merge(&function(), &task(), RunSpec::new("job"));

        assert_eq!(effective.image.as_deref(), Some("python:3.12"));
        assert_eq!(effective.extra["owner"], json!("task"));
        assert_eq!(effective.backoff_limit, Some(2));
        assert_eq!(effective.function.as_deref(), Some("python://demo/etl:1"));
    }

    #[test]
    fn test_function_default_when_nothing_overrides() {
        let effective = RunSpec::merge(&function(), &task(), RunSpec::new("job"));

        assert_eq!(effective.command.as_deref(), Some("python"));
        assert_eq!(effective.args, Some(vec!["main.py".to_string()]));
        assert_eq!(effective.requirements, Some(vec!["pandas".to_string()]));
        assert_eq!(effective.extra["color"], json!("blue"));
        assert!(effective.source.is_some());
    }

    #[test]
    fn test_lists_are_replaced_not_concatenated() {
        let mut run = RunSpec::new("job");
        run.args = Some(vec!["other.py".into()]);

        let effective = RunSpec::merge(&function(), &task(), run);

        assert_eq!(effective.args, Some(vec!["other.py".to_string()]));
    }

    #[test]
    fn test_null_extra_does_not_override() {
        let mut run = RunSpec::new("job");
        run.extra.insert("color".into(), Value::Null);

        let effective = RunSpec::merge(&function(), &task(), run);

        assert_eq!(effective.extra["color"], json!("blue"));
    }

    #[test]
    fn test_extra_keys_cannot_shadow_fields() {
        let function: FunctionSpec = serde_json::from_value(json!({
            "envs": [{"name": "MODE", "value": "function"}],
            "task": "build",
            "local_execution": true,
            "flavor": "vanilla"
        }))
        .unwrap();
        let mut run = RunSpec::new("job");
        run.envs = Some(vec![EnvVar::new("MODE", "run")]);

        let effective = RunSpec::merge(&function, &task(), run);
        let stored = RunSpec::from_map(&effective.to_map().unwrap()).unwrap();

        assert_eq!(stored.task, "job");
        assert_eq!(stored.envs, Some(vec![EnvVar::new("MODE", "run")]));
        assert!(!stored.local_execution);
        assert_eq!(stored.extra["flavor"], json!("vanilla"));
        assert!(!stored.extra.contains_key("envs"));
    }

    #[test]
    fn test_to_map_keeps_typed_value_over_extra() {
        let mut run = RunSpec::new("job");
        run.image = Some("busybox".into());
        run.extra.insert("image".into(), json!("shadow:latest"));
        run.extra.insert("task".into(), json!("build"));

        let map = run.to_map().unwrap();

        assert_eq!(map["image"], json!("busybox"));
        assert_eq!(map["task"], json!("job"));
    }

    #[test]
    fn test_typed_field_names_match_serialization() {
        let full = RunSpec {
            task: "job".into(),
            function: Some("f".into()),
            local_execution: true,
            inputs: Some(Map::new()),
            outputs: Some(Map::new()),
            parameters: Some(Map::new()),
            image: Some("i".into()),
            base_image: Some("b".into()),
            command: Some("c".into()),
            args: Some(vec![]),
            source: Some(SourceCode {
                source: "s".into(),
                handler: None,
                lang: None,
                base64: false,
            }),
            requirements: Some(vec![]),
            workflow: Some(json!({})),
            envs: Some(vec![]),
            secrets: Some(vec![]),
            resources: Some(Resources::default()),
            volumes: Some(vec![]),
            node_selector: Some(BTreeMap::new()),
            labels: Some(BTreeMap::new()),
            backoff_limit: Some(1),
            destination: Some("d".into()),
            extra: Map::new(),
        };

        let map = full.to_map().unwrap();

        assert_eq!(map.len(), RUN_SPEC_FIELDS.len());
        assert!(map.keys().all(|key| is_typed_field(key)));
    }

    #[test]
    fn test_map_round_trip_keeps_extra() {
        let mut run = RunSpec::new("transform");
        run.local_execution = true;
        run.extra.insert("profile".into(), json!("prod"));

        let map = run.to_map().unwrap();
        assert_eq!(map["profile"], json!("prod"));
        assert!(!map.contains_key("image"));

        assert_eq!(RunSpec::from_map(&map).unwrap(), run);
    }
}
