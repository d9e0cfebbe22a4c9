// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `k8skaniko`: image builds as Jobs running the kaniko executor.

use serde_json::{Value, json};

use super::cluster::Resource;
use super::job::job_state;
use super::{K8sResource, metadata, pod_template};
use crate::entity::StatusFragment;
use crate::framework::{BackendError, ids};
use crate::runnable::Runnable;
use crate::state::State;

/// Build context directory inside the executor.
pub const CONTEXT_PATH: &str = "/workspace";

/// Image build Job.
#[derive(Debug, Clone, Copy, Default)]
pub struct KanikoResource;

impl KanikoResource {
    fn destination(resource: &Resource) -> Option<String> {
        resource.manifest["spec"]["template"]["spec"]["containers"][0]["args"]
            .as_array()?
            .iter()
            .filter_map(Value::as_str)
            .find_map(|arg| arg.strip_prefix("--destination="))
            .map(String::from)
    }
}

impl K8sResource for KanikoResource {
    const FRAMEWORK: &'static str = ids::K8S_KANIKO;
    const KIND: &'static str = "Job";
    const SHORT: &'static str = "build";

    fn manifest(runnable: &Runnable, namespace: &str) -> Result<Value, BackendError> {
        if !runnable.files.contains_key("Dockerfile") {
            return Err(BackendError::Rejected(format!(
                "build {} has no Dockerfile",
                runnable.id
            )));
        }
        Ok(json!({
            "apiVersion": "batch/v1",
            "kind": Self::KIND,
            "metadata": metadata(runnable, &Self::name(runnable), namespace),
            "spec": {
                "backoffLimit": runnable.backoff_limit.unwrap_or(0),
                "template": pod_template(runnable, CONTEXT_PATH)?,
            },
        }))
    }

    fn state_of(resource: &Resource) -> Option<State> {
        job_state(resource)
    }

    fn results(resource: &Resource) -> Option<StatusFragment> {
        if resource.status_count("succeeded") == 0 {
            return None;
        }
        let image = Self::destination(resource)?;
        let mut fragment = StatusFragment::new();
        fragment.insert("image".into(), json!(image));
        Some(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build() -> Runnable {
        let mut runnable = Runnable::new("b1", ids::K8S_KANIKO, "kaniko", "build", "demo");
        runnable.image = Some("kaniko:latest".into());
        runnable.args = vec![
            "--dockerfile=Dockerfile".into(),
            "--destination=registry/demo/etl:b1".into(),
        ];
        runnable
            .files
            .insert("Dockerfile".into(), "FROM python:3.11\n".into());
        runnable
    }

    #[test]
    fn test_results_report_built_image() {
        let mut resource =
            Resource::from_manifest(KanikoResource::manifest(&build(), "ns").unwrap()).unwrap();
        assert!(KanikoResource::results(&resource).is_none());

        resource.status = json!({"succeeded": 1});
        let results = KanikoResource::results(&resource).unwrap();

        assert_eq!(results["image"], json!("registry/demo/etl:b1"));
        assert_eq!(resource.name, "orcha-build-b1");
    }

    #[test]
    fn test_build_without_dockerfile_rejected() {
        let mut runnable = build();
        runnable.files.clear();

        assert!(matches!(
            KanikoResource::manifest(&runnable, "ns"),
            Err(BackendError::Rejected(_))
        ));
    }
}
