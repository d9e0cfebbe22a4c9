// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `k8sjob`: runnables as batch Jobs.

use serde_json::{Value, json};

use super::cluster::Resource;
use super::{K8sResource, metadata, pod_template};
use crate::framework::{BackendError, ids};
use crate::runnable::Runnable;
use crate::state::State;

/// Where the wrapper expects its files.
pub const FILES_PATH: &str = "/shared";

/// Job counters to run state: any success completes, any failure errors,
/// otherwise an active pod means running.
pub fn job_state(resource: &Resource) -> Option<State> {
    if resource.status_count("succeeded") > 0 {
        Some(State::Completed)
    } else if resource.status_count("failed") > 0 {
        Some(State::Error)
    } else if resource.status_count("active") > 0 {
        Some(State::Running)
    } else {
        None
    }
}

/// Batch Job.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobResource;

impl K8sResource for JobResource {
    const FRAMEWORK: &'static str = ids::K8S_JOB;
    const KIND: &'static str = "Job";
    const SHORT: &'static str = "job";

    fn manifest(runnable: &Runnable, namespace: &str) -> Result<Value, BackendError> {
        Ok(json!({
            "apiVersion": "batch/v1",
            "kind": Self::KIND,
            "metadata": metadata(runnable, &Self::name(runnable), namespace),
            "spec": {
                "backoffLimit": runnable.backoff_limit.unwrap_or(0),
                "template": pod_template(runnable, FILES_PATH)?,
            },
        }))
    }

    fn state_of(resource: &Resource) -> Option<State> {
        job_state(resource)
    }
}
