// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runners: effective spec to framework-native runnable.
//!
//! Runners are pure. They read the run's identity and effective spec and
//! never touch a store or a backend.

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::framework::ids;
use crate::runnable::Runnable;
use crate::secrets::GroupedSecrets;
use crate::spec::{EnvVar, RunSpec};

/// Environment variable carrying the owning project.
pub const PROJECT_ENV: &str = "PROJECT_NAME";
/// Environment variable carrying the run id.
pub const RUN_ID_ENV: &str = "RUN_ID";

/// Produces the runnable for one (runtime, task) pair.
pub trait Runner: Send + Sync {
    /// Framework the produced runnables belong to.
    fn framework(&self) -> &str;

    /// Build the runnable for `run`.
    fn produce(&self, run: &Entity, spec: &RunSpec, secrets: &GroupedSecrets) -> Result<Runnable>;
}

/// Fields every runner fills the same way.
pub fn base_runnable(
    framework: &str,
    run: &Entity,
    spec: &RunSpec,
    secrets: &GroupedSecrets,
) -> Runnable {
    let mut runnable = Runnable::new(&run.id, framework, &run.kind, &spec.task, &run.project);
    runnable.user = run.user.clone();
    runnable.envs = vec![
        EnvVar::new(PROJECT_ENV, &run.project),
        EnvVar::new(RUN_ID_ENV, &run.id),
    ];
    runnable
        .envs
        .extend(spec.envs.iter().flatten().cloned());
    runnable.secrets = secrets.clone();
    runnable.resources = spec.resources.clone();
    runnable.volumes = spec.volumes.clone().unwrap_or_default();
    runnable.node_selector = spec.node_selector.clone().unwrap_or_default();
    runnable.labels = spec.labels.clone().unwrap_or_default();
    runnable.backoff_limit = spec.backoff_limit;
    runnable
}

fn required<'a>(value: Option<&'a String>, what: &str, run: &Entity) -> Result<&'a String> {
    value.ok_or_else(|| Error::InvalidSpec(format!("run {} has no {what}", run.id)))
}

/// Runs user source through the `wrapper.py` entrypoint of a runtime image.
#[derive(Debug, Clone)]
pub struct WrapperJobRunner {
    image: String,
}

impl WrapperJobRunner {
    /// Runner defaulting to `image` when the spec names none.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
        }
    }
}

impl Runner for WrapperJobRunner {
    fn framework(&self) -> &str {
        ids::K8S_JOB
    }

    fn produce(&self, run: &Entity, spec: &RunSpec, secrets: &GroupedSecrets) -> Result<Runnable> {
        let mut runnable = base_runnable(self.framework(), run, spec, secrets);
        runnable.image = Some(spec.image.clone().unwrap_or_else(|| self.image.clone()));
        runnable.command = Some("python".into());
        runnable.args = vec!["wrapper.py".into()];

        if let Some(source) = &spec.source {
            runnable.files.insert("source".into(), source.source.clone());
            if let Some(handler) = &source.handler {
                runnable.envs.push(EnvVar::new("ORCHA_HANDLER", handler));
            }
            if source.base64 {
                runnable.envs.push(EnvVar::new("ORCHA_SOURCE_ENCODING", "base64"));
            }
        }
        if let Some(parameters) = &spec.parameters {
            runnable.files.insert(
                "parameters.json".into(),
                serde_json::to_string(parameters)?,
            );
        }
        Ok(runnable)
    }
}

/// Runs a user-supplied image as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerJobRunner;

impl Runner for ContainerJobRunner {
    fn framework(&self) -> &str {
        ids::K8S_JOB
    }

    fn produce(&self, run: &Entity, spec: &RunSpec, secrets: &GroupedSecrets) -> Result<Runnable> {
        let image = required(spec.image.as_ref(), "image", run)?;
        let mut runnable = base_runnable(self.framework(), run, spec, secrets);
        runnable.image = Some(image.clone());
        runnable.command = spec.command.clone();
        runnable.args = spec.args.clone().unwrap_or_default();
        Ok(runnable)
    }
}

/// Builds an image with the kaniko executor from generated build context.
#[derive(Debug, Clone)]
pub struct KanikoBuildRunner {
    executor_image: String,
    base_image: String,
}

impl KanikoBuildRunner {
    /// Runner using `executor_image`, building on `base_image` unless the
    /// spec names another base.
    pub fn new(executor_image: impl Into<String>, base_image: impl Into<String>) -> Self {
        Self {
            executor_image: executor_image.into(),
            base_image: base_image.into(),
        }
    }

    fn dockerfile(&self, spec: &RunSpec) -> String {
        let base = spec.base_image.as_deref().unwrap_or(&self.base_image);
        let mut lines = vec![format!("FROM {base}"), "WORKDIR /shared".into()];
        if spec.source.is_some() {
            lines.push("COPY source /shared/source".into());
        }
        if let Some(requirements) = spec.requirements.as_ref().filter(|r| !r.is_empty()) {
            lines.push(format!("RUN pip install --no-cache-dir {}", requirements.join(" ")));
        }
        lines.join("\n") + "\n"
    }
}

impl Runner for KanikoBuildRunner {
    fn framework(&self) -> &str {
        ids::K8S_KANIKO
    }

    fn produce(&self, run: &Entity, spec: &RunSpec, secrets: &GroupedSecrets) -> Result<Runnable> {
        let destination = spec.destination.clone().unwrap_or_else(|| {
            let name = spec.function.as_deref().unwrap_or(&run.name);
            format!("{}/{}:{}", run.project, name, run.id)
        });

        let mut runnable = base_runnable(self.framework(), run, spec, secrets);
        runnable.image = Some(self.executor_image.clone());
        runnable.args = vec![
            "--dockerfile=Dockerfile".into(),
            "--context=dir:///workspace".into(),
            format!("--destination={destination}"),
        ];
        runnable.files.insert("Dockerfile".into(), self.dockerfile(spec));
        if let Some(source) = &spec.source {
            runnable.files.insert("source".into(), source.source.clone());
        }
        Ok(runnable)
    }
}

/// Hands an opaque workflow definition to the workflow engine.
#[derive(Debug, Clone)]
pub struct PipelineRunner {
    image: String,
}

impl PipelineRunner {
    /// Runner whose steps default to `image`.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
        }
    }
}

impl Runner for PipelineRunner {
    fn framework(&self) -> &str {
        ids::K8S_ARGO
    }

    fn produce(&self, run: &Entity, spec: &RunSpec, secrets: &GroupedSecrets) -> Result<Runnable> {
        let workflow = spec
            .workflow
            .clone()
            .ok_or_else(|| Error::InvalidSpec(format!("run {} has no workflow", run.id)))?;
        let mut runnable = base_runnable(self.framework(), run, spec, secrets);
        runnable.image = Some(spec.image.clone().unwrap_or_else(|| self.image.clone()));
        runnable.workflow = Some(workflow);
        Ok(runnable)
    }
}

/// Batch job for the HPC scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct HpcJobRunner;

impl Runner for HpcJobRunner {
    fn framework(&self) -> &str {
        ids::HPC
    }

    fn produce(&self, run: &Entity, spec: &RunSpec, secrets: &GroupedSecrets) -> Result<Runnable> {
        let image = required(spec.image.as_ref(), "image", run)?;
        let mut runnable = base_runnable(self.framework(), run, spec, secrets);
        runnable.image = Some(image.clone());
        runnable.command = spec.command.clone();
        runnable.args = spec.args.clone().unwrap_or_default();
        Ok(runnable)
    }
}
