// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event bus between watchers and the monitor.
//!
//! ```text
//!  watcher / poller ── publish(ChangeEvent) ──► bounded mpsc
//!                                                   │
//!                                              dispatcher
//!                                   hash(entity id) % workers
//!                                     │        │        │
//!                                  worker   worker   worker ──► EventHandler::handle
//! ```
//!
//! Delivery is at least once: watchers replay current state on every
//! resubscribe. Events for one entity always land on the same worker and
//! are handled in publish order; across entities there is no order.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::runnable::Runnable;
use crate::state::State;

/// An entity reached `target_state` according to its backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Entity id.
    pub entity_id: String,
    /// State the backend reports.
    pub target_state: State,
    /// Runnable as last observed, handed to the transition as input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runnable: Option<Runnable>,
}

impl ChangeEvent {
    /// Event without a runnable.
    pub fn new(entity_id: impl Into<String>, target_state: State) -> Self {
        Self {
            entity_id: entity_id.into(),
            target_state,
            runnable: None,
        }
    }

    /// Event carrying the observed runnable.
    pub fn observed(runnable: Runnable) -> Self {
        Self {
            entity_id: runnable.id.clone(),
            target_state: runnable.state,
            runnable: Some(runnable),
        }
    }
}

/// Events carrying the key that picks their worker.
pub trait Sharded {
    /// Events with equal keys are handled one at a time, in order.
    fn shard_key(&self) -> &str;
}

impl Sharded for ChangeEvent {
    fn shard_key(&self) -> &str {
        &self.entity_id
    }
}

fn shard_of(key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// Consumes events from a bus.
#[async_trait]
pub trait EventHandler<E>: Send + Sync {
    /// Handle one event. Failures are the handler's to log.
    async fn handle(&self, event: E);
}

/// Sending half of a bus.
#[derive(Debug)]
pub struct EventPublisher<E> {
    sender: mpsc::Sender<E>,
}

impl<E> Clone for EventPublisher<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<E: Send + 'static> EventPublisher<E> {
    /// Queue `event`, waiting for room. Returns false once the bus is gone.
    pub async fn publish(&self, event: E) -> bool {
        if self.sender.send(event).await.is_err() {
            warn!("Event bus closed, dropping event");
            return false;
        }
        true
    }
}

/// Bounded queue drained by a pool of workers.
pub struct EventBus<E> {
    sender: mpsc::Sender<E>,
    receiver: Mutex<Option<mpsc::Receiver<E>>>,
    capacity: usize,
    shutdown: watch::Sender<bool>,
}

impl<E: Send + 'static> EventBus<E> {
    /// Bus holding at most `capacity` undelivered events.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        let (shutdown, _) = watch::channel(false);
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            capacity,
            shutdown,
        }
    }

    /// A handle for producers.
    pub fn publisher(&self) -> EventPublisher<E> {
        EventPublisher {
            sender: self.sender.clone(),
        }
    }

    /// Signal every worker to stop after its current event.
    pub fn shutdown(&self) {
        info!("Event bus shutting down");
        let _ = self.shutdown.send(true);
    }
}

impl<E: Sharded + Send + 'static> EventBus<E> {
    /// Spawn `workers` tasks feeding `handler`, plus the dispatcher routing
    /// events to them. Workers can be spawned once per bus.
    pub fn spawn_workers(
        &self,
        workers: usize,
        handler: Arc<dyn EventHandler<E>>,
    ) -> Vec<JoinHandle<()>> {
        let taken = self.receiver.lock().ok().and_then(|mut r| r.take());
        let Some(mut receiver) = taken else {
            warn!("Event bus workers already spawned");
            return Vec::new();
        };

        let workers = workers.max(1);
        let per_worker = self.capacity.div_ceil(workers).max(1);
        let mut queues = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers + 1);
        for worker in 0..workers {
            let (queue, mut events) = mpsc::channel::<E>(per_worker);
            queues.push(queue);
            let handler = handler.clone();
            let mut shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                debug!(worker, "Event worker started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let event = tokio::select! {
                        biased;
                        _ = shutdown.changed() => None,
                        event = events.recv() => event,
                    };
                    match event {
                        Some(event) => handler.handle(event).await,
                        None => break,
                    }
                }
                debug!(worker, "Event worker stopped");
            }));
        }

        let mut shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let event = tokio::select! {
                    biased;
                    _ = shutdown.changed() => None,
                    event = receiver.recv() => event,
                };
                let Some(event) = event else {
                    break;
                };
                let queue = &queues[shard_of(event.shard_key(), queues.len())];
                if queue.send(event).await.is_err() {
                    break;
                }
            }
            debug!("Event dispatcher stopped");
        }));
        handles
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler<ChangeEvent> for Collect {
        async fn handle(&self, event: ChangeEvent) {
            self.seen.lock().await.push(event.entity_id);
        }
    }

    /// Slow on `READY`, so a later event could overtake it on another worker.
    #[derive(Default)]
    struct Ordered {
        seen: Mutex<Vec<(String, State)>>,
    }

    #[async_trait]
    impl EventHandler<ChangeEvent> for Ordered {
        async fn handle(&self, event: ChangeEvent) {
            if event.target_state == State::Ready {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            self.seen
                .lock()
                .await
                .push((event.entity_id, event.target_state));
        }
    }

    #[tokio::test]
    async fn test_events_of_one_entity_keep_order() {
        let bus: EventBus<ChangeEvent> = EventBus::new(32);
        let ordered = Arc::new(Ordered::default());
        let handles = bus.spawn_workers(4, ordered.clone());
        let publisher = bus.publisher();
        let sequence = [State::Ready, State::Running, State::Completed];

        for state in sequence {
            for run in ["a", "b", "c"] {
                assert!(publisher.publish(ChangeEvent::new(run, state)).await);
            }
        }
        while ordered.seen.lock().await.len() < 9 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        bus.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
        let seen = ordered.seen.lock().await;
        for run in ["a", "b", "c"] {
            let states: Vec<State> = seen
                .iter()
                .filter(|(id, _)| id == run)
                .map(|(_, state)| *state)
                .collect();
            assert_eq!(states, sequence);
        }
    }

    #[tokio::test]
    async fn test_workers_spawn_once() {
        let bus: EventBus<ChangeEvent> = EventBus::new(4);
        let first = bus.spawn_workers(2, Arc::new(Collect::default()));
        let second = bus.spawn_workers(2, Arc::new(Collect::default()));

        assert_eq!(first.len(), 3);
        assert!(second.is_empty());
        bus.shutdown();
        for handle in first {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_workers_drain_every_event() {
        let bus: EventBus<ChangeEvent> = EventBus::new(16);
        let collect = Arc::new(Collect::default());
        let handles = bus.spawn_workers(3, collect.clone());
        let publisher = bus.publisher();

        for i in 0..10 {
            assert!(publisher.publish(ChangeEvent::new(format!("r{i}"), State::Running)).await);
        }
        while collect.seen.lock().await.len() < 10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        bus.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }

        let seen: HashSet<String> = collect.seen.lock().await.iter().cloned().collect();
        assert_eq!(seen.len(), 10);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_workers() {
        let bus: EventBus<ChangeEvent> = EventBus::new(4);
        let handles = bus.spawn_workers(2, Arc::new(Collect::default()));

        bus.shutdown();

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
