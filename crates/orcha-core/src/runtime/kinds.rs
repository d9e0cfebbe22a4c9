// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in runtimes.

use std::sync::Arc;

use super::runner::{
    ContainerJobRunner, HpcJobRunner, KanikoBuildRunner, PipelineRunner, WrapperJobRunner,
};
use super::{BaseRuntime, Runtime};
use crate::config::Config;
use crate::spec::{Requirement, ValidatingBuilder};

fn builder(runtime: &str, task: &str, requirement: Requirement) -> Arc<ValidatingBuilder> {
    Arc::new(ValidatingBuilder::new(runtime, task, requirement))
}

/// `python`: `job` through the wrapper, `build` through kaniko.
pub fn python_runtime(config: &Config) -> BaseRuntime {
    BaseRuntime::new("python")
        .task(
            "job",
            builder("python", "job", Requirement::SourceOrImage),
            Arc::new(WrapperJobRunner::new(&config.python_image)),
        )
        .task(
            "build",
            builder("python", "build", Requirement::Source),
            Arc::new(KanikoBuildRunner::new(
                &config.kaniko_image,
                &config.python_image,
            )),
        )
}

/// `dbt`: `transform` through the wrapper on the dbt image.
pub fn dbt_runtime(config: &Config) -> BaseRuntime {
    BaseRuntime::new("dbt").task(
        "transform",
        builder("dbt", "transform", Requirement::Source),
        Arc::new(WrapperJobRunner::new(&config.dbt_image)),
    )
}

/// `container`: a user image as a job.
pub fn container_runtime(_config: &Config) -> BaseRuntime {
    BaseRuntime::new("container").task(
        "job",
        builder("container", "job", Requirement::Image),
        Arc::new(ContainerJobRunner),
    )
}

/// `kaniko`: image builds from source.
pub fn kaniko_runtime(config: &Config) -> BaseRuntime {
    BaseRuntime::new("kaniko").task(
        "build",
        builder("kaniko", "build", Requirement::Source),
        Arc::new(KanikoBuildRunner::new(
            &config.kaniko_image,
            &config.python_image,
        )),
    )
}

/// `kfp`: pipelines on the workflow engine.
pub fn kfp_runtime(config: &Config) -> BaseRuntime {
    BaseRuntime::new("kfp").task(
        "pipeline",
        builder("kfp", "pipeline", Requirement::Workflow),
        Arc::new(PipelineRunner::new(&config.kfp_image)),
    )
}

/// `hpcdl`: batch jobs on the HPC scheduler.
pub fn hpcdl_runtime(_config: &Config) -> BaseRuntime {
    BaseRuntime::new("hpcdl").task(
        "job",
        builder("hpcdl", "job", Requirement::Image),
        Arc::new(HpcJobRunner),
    )
}

/// Every built-in runtime.
pub fn default_runtimes(config: &Config) -> Vec<Arc<dyn Runtime>> {
    vec![
        Arc::new(python_runtime(config)),
        Arc::new(dbt_runtime(config)),
        Arc::new(container_runtime(config)),
        Arc::new(kaniko_runtime(config)),
        Arc::new(kfp_runtime(config)),
        Arc::new(hpcdl_runtime(config)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::ids;

    #[test]
    fn test_builtin_task_frameworks() {
        let runtimes = default_runtimes(&Config::default());
        let table: Vec<(String, String, String)> = runtimes
            .iter()
            .flat_map(|runtime| {
                runtime.task_kinds().into_iter().map(|task| {
                    (
                        runtime.kind().to_string(),
                        task.to_string(),
                        runtime.framework(task).unwrap().to_string(),
                    )
                })
            })
            .collect();

        for (runtime, task, framework) in [
            ("python", "job", ids::K8S_JOB),
            ("python", "build", ids::K8S_KANIKO),
            ("dbt", "transform", ids::K8S_JOB),
            ("container", "job", ids::K8S_JOB),
            ("kaniko", "build", ids::K8S_KANIKO),
            ("kfp", "pipeline", ids::K8S_ARGO),
            ("hpcdl", "job", ids::HPC),
        ] {
            assert!(
                table.contains(&(runtime.into(), task.into(), framework.into())),
                "missing {runtime}+{task} on {framework}"
            );
        }
        assert_eq!(table.len(), 7);
    }
}
