// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background watch loop over one managed resource type.
//!
//! Watch streams expire. When one ends the watcher subscribes again after
//! a backoff delay; the attempt counter resets once a stream has delivered
//! events. Each resubscribe replays current objects as `Added`, which the
//! monitor absorbs as duplicates.
//!
//! Observations are only published. The runnable store moves when the run
//! commits the reported state, so an event lost before that point is
//! published again on the next update or resubscribe.
//!
//! Deletions are read against the runnable's recorded state: an object
//! removed by a teardown completes the deletion, one that vanished while
//! the work was live is reported as an error, and one removed by a stop or
//! a post-run cleanup is ignored.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::bus::{ChangeEvent, EventPublisher};
use crate::framework::k8s::{KubeApi, Resource, ResourceStateMapper, WatchEvent, labels};
use crate::runnable::Runnable;
use crate::state::State;
use crate::store::RunnableStore;

/// Publishes state changes observed on one resource type.
pub struct ResourceWatcher {
    api: Arc<dyn KubeApi>,
    mapper: Arc<dyn ResourceStateMapper>,
    store: Arc<dyn RunnableStore>,
    publisher: EventPublisher<ChangeEvent>,
    backoff: BackoffPolicy,
    shutdown: Arc<Notify>,
}

impl ResourceWatcher {
    /// Watcher over the resources `mapper` describes.
    pub fn new(
        api: Arc<dyn KubeApi>,
        mapper: Arc<dyn ResourceStateMapper>,
        store: Arc<dyn RunnableStore>,
        publisher: EventPublisher<ChangeEvent>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            api,
            mapper,
            store,
            publisher,
            backoff,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Watch until shutdown is signalled.
    pub async fn run(&self) {
        let framework = self.mapper.framework().to_string();
        let kind = self.mapper.kind().to_string();
        let namespace = self.mapper.namespace().to_string();
        let selector = self.mapper.selector();
        info!(framework = %framework, kind = %kind, namespace = %namespace, "Resource watcher started");

        let mut attempt: u32 = 0;
        loop {
            let subscribed = tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                result = self.api.watch(&kind, &namespace, &selector) => result,
            };

            match subscribed {
                Ok(mut events) => {
                    debug!(framework = %framework, kind = %kind, "Watch established");
                    let mut healthy = false;
                    loop {
                        tokio::select! {
                            biased;
                            _ = self.shutdown.notified() => {
                                info!(framework = %framework, kind = %kind, "Resource watcher stopped");
                                return;
                            }
                            event = events.recv() => match event {
                                Some(event) => {
                                    healthy = true;
                                    self.observe(event).await;
                                }
                                None => break,
                            },
                        }
                    }
                    if healthy {
                        attempt = 0;
                    }
                    info!(framework = %framework, kind = %kind, "Watch stream ended, resubscribing");
                }
                Err(e) => {
                    warn!(framework = %framework, kind = %kind, attempt, error = %e, "Failed to open watch");
                }
            }

            let delay = self.backoff.next(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(framework = %framework, kind = %kind, "Resource watcher stopped");
    }

    /// Translate one watch event; publishes at most one change event.
    pub async fn observe(&self, event: WatchEvent) -> bool {
        let resource = event.resource();
        let Some(run_id) = resource.labels.get(labels::RUN_ID) else {
            debug!(name = %resource.name, "Watched object has no run id");
            return false;
        };
        let runnable = match self.store.find(run_id).await {
            Ok(Some(runnable)) => runnable,
            Ok(None) => {
                debug!(run_id = %run_id, "No runnable recorded for watched object");
                return false;
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to load runnable");
                return false;
            }
        };

        let observed = match &event {
            WatchEvent::Deleted(_) => Self::on_removed(&runnable),
            WatchEvent::Added(resource) | WatchEvent::Modified(resource) => {
                self.on_changed(&runnable, resource)
            }
        };
        let Some(observed) = observed else {
            return false;
        };

        // Recorded by the run manager once the run commits, so an
        // observation keeps being published until it has been applied.
        debug!(run_id = %observed.id, state = %observed.state, "Observed state change");
        self.publisher.publish(ChangeEvent::observed(observed)).await
    }

    fn on_changed(&self, runnable: &Runnable, resource: &Resource) -> Option<Runnable> {
        // Halted or torn-down work may still emit updates until it is gone.
        if !runnable.state.is_live() {
            return None;
        }
        let state = self.mapper.state_of(resource)?;
        if state == runnable.state {
            return None;
        }
        let mut observed = runnable.clone().with_state(state, format!("{} {}", resource.kind, state));
        if state == State::Error {
            observed.error = Some(format!("{} {} failed", resource.kind, resource.name));
        }
        Some(observed)
    }

    fn on_removed(runnable: &Runnable) -> Option<Runnable> {
        match runnable.state {
            State::Deleting => Some(runnable.clone().with_state(State::Deleted, "deleted")),
            state if state.is_live() => {
                let mut lost = runnable.clone().with_state(State::Error, "resource lost");
                lost.error = Some("backend object removed while running".into());
                Some(lost)
            }
            _ => None,
        }
    }
}
