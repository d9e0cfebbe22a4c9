// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `k8sargo`: pipelines as Argo Workflows.
//!
//! The workflow definition is opaque; it becomes the object's `spec` with
//! the run's environment appended as global parameters.

use serde_json::{Map, Value, json};

use super::cluster::Resource;
use super::{K8sResource, managed_labels, metadata};
use crate::entity::StatusFragment;
use crate::framework::{BackendError, ids};
use crate::runnable::Runnable;
use crate::state::State;

/// Argo Workflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowResource;

impl K8sResource for WorkflowResource {
    const FRAMEWORK: &'static str = ids::K8S_ARGO;
    const KIND: &'static str = "Workflow";
    const SHORT: &'static str = "wf";

    fn manifest(runnable: &Runnable, namespace: &str) -> Result<Value, BackendError> {
        let mut spec = match &runnable.workflow {
            Some(Value::Object(spec)) => spec.clone(),
            Some(other) => {
                return Err(BackendError::Rejected(format!(
                    "workflow of {} is not an object: {other}",
                    runnable.id
                )));
            }
            None => {
                return Err(BackendError::Rejected(format!(
                    "runnable {} has no workflow",
                    runnable.id
                )));
            }
        };

        let parameters: Vec<Value> = runnable
            .envs
            .iter()
            .map(|e| json!({"name": e.name, "value": e.value}))
            .collect();
        let arguments = spec
            .entry("arguments")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(arguments) = arguments {
            match arguments
                .entry("parameters")
                .or_insert_with(|| Value::Array(Vec::new()))
            {
                Value::Array(existing) => existing.extend(parameters),
                _ => {
                    return Err(BackendError::Rejected(format!(
                        "workflow of {} has malformed parameters",
                        runnable.id
                    )));
                }
            }
        }
        spec.insert(
            "podMetadata".into(),
            json!({"labels": managed_labels(runnable)}),
        );

        Ok(json!({
            "apiVersion": "argoproj.io/v1alpha1",
            "kind": Self::KIND,
            "metadata": metadata(runnable, &Self::name(runnable), namespace),
            "spec": spec,
        }))
    }

    fn state_of(resource: &Resource) -> Option<State> {
        match resource.status_str("phase")? {
            "Pending" => Some(State::Pending),
            "Running" => Some(State::Running),
            "Succeeded" => Some(State::Completed),
            "Failed" | "Error" => Some(State::Error),
            _ => None,
        }
    }

    fn results(resource: &Resource) -> Option<StatusFragment> {
        let outputs = resource.status.get("outputs")?;
        let mut fragment = StatusFragment::new();
        fragment.insert("outputs".into(), outputs.clone());
        Some(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::EnvVar;

    fn pipeline() -> Runnable {
        let mut runnable = Runnable::new("p1", ids::K8S_ARGO, "kfp", "pipeline", "demo");
        runnable.envs = vec![EnvVar::new("RUN_ID", "p1")];
        runnable.workflow = Some(json!({
            "entrypoint": "main",
            "arguments": {"parameters": [{"name": "date", "value": "2025-01-01"}]},
        }));
        runnable
    }

    #[test]
    fn test_env_appended_as_parameters() {
        let manifest = WorkflowResource::manifest(&pipeline(), "ns").unwrap();

        assert_eq!(manifest["spec"]["entrypoint"], json!("main"));
        assert_eq!(
            manifest["spec"]["arguments"]["parameters"],
            json!([
                {"name": "date", "value": "2025-01-01"},
                {"name": "RUN_ID", "value": "p1"},
            ])
        );
    }

    #[test]
    fn test_phase_mapping() {
        let mut resource =
            Resource::from_manifest(WorkflowResource::manifest(&pipeline(), "ns").unwrap())
                .unwrap();
        assert_eq!(WorkflowResource::state_of(&resource), None);

        for (phase, state) in [
            ("Pending", State::Pending),
            ("Running", State::Running),
            ("Succeeded", State::Completed),
            ("Failed", State::Error),
        ] {
            resource.status = json!({"phase": phase});
            assert_eq!(WorkflowResource::state_of(&resource), Some(state), "{phase}");
        }
    }

    #[test]
    fn test_non_object_workflow_rejected() {
        let mut runnable = pipeline();
        runnable.workflow = Some(json!("steps"));

        assert!(WorkflowResource::manifest(&runnable, "ns").is_err());
    }
}
