// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes frameworks.
//!
//! Every Kubernetes-backed framework is a [`K8sFramework`] over one
//! [`K8sResource`]: the resource type says how a runnable becomes manifests
//! and how the cluster's view of the object maps back onto a run state. The
//! framework itself only sequences store writes and API calls.
//!
//! ```text
//! submit:  record(READY) -> apply(manifests)
//! stop:    record(STOP)  -> delete(object)            -> record(STOPPED)
//! resume:  apply(manifests)                           -> record(READY)
//! delete:  record(DELETING) -> delete(object, files)  -> record(DELETED)
//! ```

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::{BackendError, Framework, record};
use crate::entity::StatusFragment;
use crate::runnable::Runnable;
use crate::spec::VolumeSource;
use crate::state::State;
use crate::store::RunnableStore;

pub mod build;
pub mod cluster;
pub mod job;
pub mod workflow;

pub use build::KanikoResource;
pub use cluster::{InMemoryCluster, KubeApi, Resource, WatchEvent};
pub use job::JobResource;
pub use workflow::WorkflowResource;

/// Label keys on managed objects.
pub mod labels {
    /// Marks objects owned by the control plane.
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    /// Value of [`MANAGED_BY`].
    pub const MANAGER: &str = "orcha";
    /// Run id.
    pub const RUN_ID: &str = "orcha/run-id";
    /// Framework id.
    pub const FRAMEWORK: &str = "orcha/framework";
    /// Owning project.
    pub const PROJECT: &str = "orcha/project";
}

/// Config map kind holding runnable files.
const CONFIG_MAP: &str = "ConfigMap";

/// How one kind of cluster object represents a runnable.
pub trait K8sResource: Send + Sync + 'static {
    /// Framework id.
    const FRAMEWORK: &'static str;
    /// Object kind.
    const KIND: &'static str;
    /// Name infix, e.g. `job` in `orcha-job-<run id>`.
    const SHORT: &'static str;

    /// Object name for `runnable`.
    fn name(runnable: &Runnable) -> String {
        format!("orcha-{}-{}", Self::SHORT, runnable.id)
    }

    /// Main object manifest.
    fn manifest(runnable: &Runnable, namespace: &str) -> Result<Value, BackendError>;

    /// Run state the object's status reports, `None` when it says nothing
    /// new (e.g. just created).
    fn state_of(resource: &Resource) -> Option<State>;

    /// Results the finished object carries.
    fn results(_resource: &Resource) -> Option<StatusFragment> {
        None
    }
}

/// What a watcher needs to follow one framework's objects.
pub trait ResourceStateMapper: Send + Sync {
    /// Framework id.
    fn framework(&self) -> &str;
    /// Object kind to watch.
    fn kind(&self) -> &str;
    /// Namespace to watch.
    fn namespace(&self) -> &str;
    /// Label selector identifying managed objects of this framework.
    fn selector(&self) -> BTreeMap<String, String>;
    /// Run state reported by `resource`.
    fn state_of(&self, resource: &Resource) -> Option<State>;
}

/// Labels stamped on every object created for `runnable`.
pub fn managed_labels(runnable: &Runnable) -> BTreeMap<String, String> {
    let mut labels = runnable.labels.clone();
    labels.insert(labels::MANAGED_BY.into(), labels::MANAGER.into());
    labels.insert(labels::RUN_ID.into(), runnable.id.clone());
    labels.insert(labels::FRAMEWORK.into(), runnable.framework.clone());
    labels.insert(labels::PROJECT.into(), runnable.project.clone());
    labels
}

/// Selector matching every managed object of `framework`.
pub fn framework_selector(framework: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::MANAGED_BY.to_string(), labels::MANAGER.to_string()),
        (labels::FRAMEWORK.to_string(), framework.to_string()),
    ])
}

/// `metadata` block for an object named `name`.
pub fn metadata(runnable: &Runnable, name: &str, namespace: &str) -> Value {
    json!({
        "name": name,
        "namespace": namespace,
        "labels": managed_labels(runnable),
    })
}

/// Name of the config map carrying `runnable`'s files.
pub fn files_name(runnable: &Runnable) -> String {
    format!("orcha-files-{}", runnable.id)
}

fn files_manifest(runnable: &Runnable, namespace: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": CONFIG_MAP,
        "metadata": metadata(runnable, &files_name(runnable), namespace),
        "data": runnable.files,
    })
}

/// Pod template running `runnable`'s single container. Files, if any, are
/// mounted at `files_path`.
pub fn pod_template(runnable: &Runnable, files_path: &str) -> Result<Value, BackendError> {
    let image = runnable
        .image
        .as_deref()
        .ok_or_else(|| BackendError::Rejected(format!("runnable {} has no image", runnable.id)))?;

    let mut env: Vec<Value> = runnable
        .envs
        .iter()
        .map(|e| json!({"name": e.name, "value": e.value}))
        .collect();
    for (secret, keys) in &runnable.secrets {
        env.extend(keys.iter().map(|key| {
            json!({
                "name": key,
                "valueFrom": {"secretKeyRef": {"name": secret, "key": key}},
            })
        }));
    }

    let mut mounts = Vec::new();
    let mut volumes = Vec::new();
    for volume in &runnable.volumes {
        mounts.push(json!({"name": volume.name, "mountPath": volume.mount_path}));
        let source = match &volume.source {
            VolumeSource::PersistentVolumeClaim { claim_name } => {
                json!({"persistentVolumeClaim": {"claimName": claim_name}})
            }
            VolumeSource::ConfigMap { name } => json!({"configMap": {"name": name}}),
            VolumeSource::EmptyDir => json!({"emptyDir": {}}),
        };
        let mut entry = Map::new();
        entry.insert("name".into(), json!(volume.name));
        if let Value::Object(source) = source {
            entry.extend(source);
        }
        volumes.push(Value::Object(entry));
    }
    if !runnable.files.is_empty() {
        mounts.push(json!({"name": "orcha-files", "mountPath": files_path}));
        volumes.push(json!({"name": "orcha-files", "configMap": {"name": files_name(runnable)}}));
    }

    let mut container = json!({
        "name": "main",
        "image": image,
        "args": runnable.args,
        "env": env,
        "volumeMounts": mounts,
    });
    if let Some(command) = &runnable.command {
        container["command"] = json!([command]);
    }
    if let Some(resources) = &runnable.resources {
        let mut limits = Map::new();
        if let Some(cpu) = &resources.cpu {
            limits.insert("cpu".into(), json!(cpu));
        }
        if let Some(memory) = &resources.memory {
            limits.insert("memory".into(), json!(memory));
        }
        if let Some(gpu) = &resources.gpu {
            limits.insert("nvidia.com/gpu".into(), json!(gpu));
        }
        container["resources"] = json!({"limits": limits});
    }

    Ok(json!({
        "metadata": {"labels": managed_labels(runnable)},
        "spec": {
            "restartPolicy": "Never",
            "nodeSelector": runnable.node_selector,
            "containers": [container],
            "volumes": volumes,
        },
    }))
}

/// A framework executing runnables as cluster objects of type `R`.
pub struct K8sFramework<R> {
    api: Arc<dyn KubeApi>,
    store: Arc<dyn RunnableStore>,
    namespace: String,
    _resource: PhantomData<fn() -> R>,
}

impl<R: K8sResource> K8sFramework<R> {
    /// Framework creating objects in `namespace`.
    pub fn new(
        api: Arc<dyn KubeApi>,
        store: Arc<dyn RunnableStore>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            api,
            store,
            namespace: namespace.into(),
            _resource: PhantomData,
        }
    }

    async fn apply_all(&self, runnable: &Runnable) -> Result<(), BackendError> {
        if !runnable.files.is_empty() {
            self.api
                .apply(files_manifest(runnable, &self.namespace))
                .await?;
        }
        self.api
            .apply(R::manifest(runnable, &self.namespace)?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<R: K8sResource> Framework for K8sFramework<R> {
    fn id(&self) -> &str {
        R::FRAMEWORK
    }

    async fn submit(&self, runnable: &Runnable) -> Result<Runnable, BackendError> {
        let submitted = runnable.clone().with_state(State::Ready, "submitted");
        record(self.store.as_ref(), &submitted).await?;

        if let Err(e) = self.apply_all(&submitted).await {
            if let Err(store_err) = self.store.remove(&submitted.id).await {
                warn!(run_id = %submitted.id, error = %store_err, "Failed to forget unsubmitted runnable");
            }
            return Err(e);
        }

        info!(
            run_id = %submitted.id,
            framework = R::FRAMEWORK,
            kind = R::KIND,
            name = %R::name(&submitted),
            "Runnable submitted"
        );
        Ok(submitted)
    }

    async fn stop(&self, runnable: &Runnable) -> Result<Runnable, BackendError> {
        let stopping = runnable.clone().with_state(State::Stop, "stopping");
        record(self.store.as_ref(), &stopping).await?;

        self.api
            .delete(R::KIND, &self.namespace, &R::name(runnable))
            .await?;

        let stopped = stopping.with_state(State::Stopped, "stopped");
        record(self.store.as_ref(), &stopped).await?;
        info!(run_id = %stopped.id, framework = R::FRAMEWORK, "Runnable stopped");
        Ok(stopped)
    }

    async fn resume(&self, runnable: &Runnable) -> Result<Runnable, BackendError> {
        let resumed = runnable.clone().with_state(State::Ready, "resumed");
        self.apply_all(&resumed).await?;
        record(self.store.as_ref(), &resumed).await?;
        info!(run_id = %resumed.id, framework = R::FRAMEWORK, "Runnable resumed");
        Ok(resumed)
    }

    async fn delete(&self, runnable: &Runnable) -> Result<Runnable, BackendError> {
        let deleting = runnable.clone().with_state(State::Deleting, "deleting");
        record(self.store.as_ref(), &deleting).await?;

        self.api
            .delete(R::KIND, &self.namespace, &R::name(runnable))
            .await?;
        if !runnable.files.is_empty() {
            self.api
                .delete(CONFIG_MAP, &self.namespace, &files_name(runnable))
                .await?;
        }

        let deleted = deleting.with_state(State::Deleted, "deleted");
        record(self.store.as_ref(), &deleted).await?;
        info!(run_id = %deleted.id, framework = R::FRAMEWORK, "Runnable deleted");
        Ok(deleted)
    }

    async fn fetch_results(
        &self,
        runnable: &Runnable,
    ) -> Result<Option<StatusFragment>, BackendError> {
        let resource = self
            .api
            .get(R::KIND, &self.namespace, &R::name(runnable))
            .await?;
        Ok(resource.as_ref().and_then(R::results))
    }

    async fn reconcile(&self, runnable: &Runnable) -> Result<Option<State>, BackendError> {
        match self
            .api
            .get(R::KIND, &self.namespace, &R::name(runnable))
            .await?
        {
            Some(resource) => Ok(R::state_of(&resource)),
            None => {
                debug!(run_id = %runnable.id, kind = R::KIND, "Managed object is gone");
                Ok(Some(State::Error))
            }
        }
    }
}

impl<R: K8sResource> ResourceStateMapper for K8sFramework<R> {
    fn framework(&self) -> &str {
        R::FRAMEWORK
    }

    fn kind(&self) -> &str {
        R::KIND
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn selector(&self) -> BTreeMap<String, String> {
        framework_selector(R::FRAMEWORK)
    }

    fn state_of(&self, resource: &Resource) -> Option<State> {
        R::state_of(resource)
    }
}
