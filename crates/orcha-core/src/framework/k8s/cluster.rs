// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster API seam and an in-memory cluster.
//!
//! [`KubeApi`] is the narrow slice of the Kubernetes API the frameworks and
//! watchers need. [`InMemoryCluster`] implements it for development and
//! tests: callers drive resource status by hand, expire watch streams, and
//! inject transient failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::framework::BackendError;

/// Buffer of each watch stream.
const WATCH_CAPACITY: usize = 256;

/// A cluster object as the API returns it.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Object kind, e.g. `Job`.
    pub kind: String,
    /// Object name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// `metadata.labels`.
    pub labels: BTreeMap<String, String>,
    /// Manifest as last applied.
    pub manifest: Value,
    /// Status reported by the cluster.
    pub status: Value,
}

impl Resource {
    /// Read kind, name, namespace and labels out of `manifest`.
    pub fn from_manifest(manifest: Value) -> Result<Self, BackendError> {
        let kind = manifest
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Rejected("manifest has no kind".into()))?
            .to_string();
        let metadata = manifest
            .get("metadata")
            .ok_or_else(|| BackendError::Rejected(format!("{kind} manifest has no metadata")))?;
        let name = metadata
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Rejected(format!("{kind} manifest has no name")))?
            .to_string();
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        let labels = metadata
            .get("labels")
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            kind,
            name,
            namespace,
            labels,
            manifest,
            status: Value::Object(Map::new()),
        })
    }

    /// Whether every selector pair is among the labels.
    pub fn matches(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|found| found == v))
    }

    /// Integer field of `status`, zero when absent.
    pub fn status_count(&self, field: &str) -> i64 {
        self.status.get(field).and_then(Value::as_i64).unwrap_or(0)
    }

    /// String field of `status`.
    pub fn status_str(&self, field: &str) -> Option<&str> {
        self.status.get(field).and_then(Value::as_str)
    }
}

/// One change observed on a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Object appeared (or was listed when the watch started).
    Added(Resource),
    /// Object changed.
    Modified(Resource),
    /// Object is gone.
    Deleted(Resource),
}

impl WatchEvent {
    /// The object the event is about.
    pub fn resource(&self) -> &Resource {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => r,
        }
    }
}

/// The cluster operations the control plane uses.
#[async_trait]
pub trait KubeApi: Send + Sync {
    /// Create or replace the object described by `manifest`.
    async fn apply(&self, manifest: Value) -> Result<Resource, BackendError>;

    /// Current object, `None` if absent.
    async fn get(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Resource>, BackendError>;

    /// Remove the object. Removing an absent object succeeds.
    async fn delete(&self, kind: &str, namespace: &str, name: &str) -> Result<(), BackendError>;

    /// Stream changes to objects of `kind` matching `selector`. The stream
    /// starts with an `Added` for every existing match and ends when the
    /// server expires it.
    async fn watch(
        &self,
        kind: &str,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<mpsc::Receiver<WatchEvent>, BackendError>;
}

type Key = (String, String, String);

struct Watch {
    kind: String,
    namespace: String,
    selector: BTreeMap<String, String>,
    sender: mpsc::Sender<WatchEvent>,
}

#[derive(Default)]
struct ClusterState {
    resources: BTreeMap<Key, Resource>,
    watches: Vec<Watch>,
    failures: u32,
    calls: HashMap<&'static str, usize>,
}

impl ClusterState {
    /// Count the call and consume an injected failure, if any.
    fn enter(&mut self, op: &'static str) -> Result<(), BackendError> {
        *self.calls.entry(op).or_default() += 1;
        if self.failures > 0 {
            self.failures -= 1;
            return Err(BackendError::Unavailable(format!("injected failure on {op}")));
        }
        Ok(())
    }

    fn broadcast(&mut self, event: WatchEvent) {
        let resource = event.resource();
        self.watches.retain(|watch| {
            if watch.kind != resource.kind
                || watch.namespace != resource.namespace
                || !resource.matches(&watch.selector)
            {
                return !watch.sender.is_closed();
            }
            match watch.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(kind = %resource.kind, name = %resource.name, "Watch buffer full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// A cluster held in memory.
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    /// Empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ClusterState>, BackendError> {
        self.state
            .lock()
            .map_err(|_| BackendError::Unavailable("cluster state poisoned".into()))
    }

    /// Replace an object's status as the cluster would, notifying watchers.
    /// Returns false when the object does not exist.
    pub fn set_status(&self, kind: &str, namespace: &str, name: &str, status: Value) -> bool {
        let Ok(mut state) = self.lock() else {
            return false;
        };
        let key = (kind.to_string(), namespace.to_string(), name.to_string());
        let Some(resource) = state.resources.get_mut(&key) else {
            return false;
        };
        resource.status = status;
        let event = WatchEvent::Modified(resource.clone());
        state.broadcast(event);
        true
    }

    /// Remove an object behind the control plane's back (eviction, manual
    /// cleanup), notifying watchers.
    pub fn evict(&self, kind: &str, namespace: &str, name: &str) -> bool {
        let Ok(mut state) = self.lock() else {
            return false;
        };
        let key = (kind.to_string(), namespace.to_string(), name.to_string());
        match state.resources.remove(&key) {
            Some(resource) => {
                state.broadcast(WatchEvent::Deleted(resource));
                true
            }
            None => false,
        }
    }

    /// End every open watch stream.
    pub fn expire_watches(&self) {
        if let Ok(mut state) = self.lock() {
            state.watches.clear();
        }
    }

    /// Fail the next `n` API calls with a transient error.
    pub fn fail_next(&self, n: u32) {
        if let Ok(mut state) = self.lock() {
            state.failures = n;
        }
    }

    /// How many times `op` (`apply`, `get`, `delete`, `watch`) was called.
    pub fn calls(&self, op: &str) -> usize {
        self.lock()
            .map(|state| state.calls.get(op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of open watch streams.
    pub fn open_watches(&self) -> usize {
        self.lock()
            .map(|state| {
                state
                    .watches
                    .iter()
                    .filter(|w| !w.sender.is_closed())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Object snapshot.
    pub fn resource(&self, kind: &str, namespace: &str, name: &str) -> Option<Resource> {
        let state = self.lock().ok()?;
        state
            .resources
            .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// All objects of `kind`.
    pub fn resources(&self, kind: &str) -> Vec<Resource> {
        self.lock()
            .map(|state| {
                state
                    .resources
                    .values()
                    .filter(|r| r.kind == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl KubeApi for InMemoryCluster {
    async fn apply(&self, manifest: Value) -> Result<Resource, BackendError> {
        let mut state = self.lock()?;
        state.enter("apply")?;

        let mut resource = Resource::from_manifest(manifest)?;
        let key = (
            resource.kind.clone(),
            resource.namespace.clone(),
            resource.name.clone(),
        );
        let event = match state.resources.get(&key) {
            Some(existing) => {
                resource.status = existing.status.clone();
                WatchEvent::Modified(resource.clone())
            }
            None => WatchEvent::Added(resource.clone()),
        };
        state.resources.insert(key, resource.clone());
        state.broadcast(event);
        Ok(resource)
    }

    async fn get(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Resource>, BackendError> {
        let mut state = self.lock()?;
        state.enter("get")?;
        Ok(state
            .resources
            .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn delete(&self, kind: &str, namespace: &str, name: &str) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        state.enter("delete")?;
        let key = (kind.to_string(), namespace.to_string(), name.to_string());
        if let Some(resource) = state.resources.remove(&key) {
            state.broadcast(WatchEvent::Deleted(resource));
        }
        Ok(())
    }

    async fn watch(
        &self,
        kind: &str,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<mpsc::Receiver<WatchEvent>, BackendError> {
        let mut state = self.lock()?;
        state.enter("watch")?;

        let (sender, receiver) = mpsc::channel(WATCH_CAPACITY);
        for resource in state.resources.values() {
            if resource.kind == kind && resource.namespace == namespace && resource.matches(selector)
            {
                // A fresh channel only fills past capacity on huge listings.
                let _ = sender.try_send(WatchEvent::Added(resource.clone()));
            }
        }
        state.watches.push(Watch {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            selector: selector.clone(),
            sender,
        });
        Ok(receiver)
    }
}

/// Bare manifest carrying only kind, name, namespace and labels.
pub fn manifest(kind: &str, namespace: &str, name: &str, labels: &BTreeMap<String, String>) -> Value {
    json!({
        "kind": kind,
        "metadata": {"name": name, "namespace": namespace, "labels": labels},
    })
}
