// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transition tables for uploadable entities, workflows and triggers, and
//! the labels plugin.

use std::sync::Arc;

use orcha_fsm::{BoxError, Step};
use serde_json::{Value, json};

use super::{EntityFsmState, EntityTransition};
use crate::entity::{Entity, StatusFragment};
use crate::error::Result;
use crate::state::{Event, State};

type States = Vec<EntityFsmState<Value, StatusFragment>>;
type Edge = EntityTransition<Value, StatusFragment>;
type EntityStep<'a> = Step<'a, State, Event, Value>;

/// Message carried by an `ERROR` input: a bare string or `{"message": ...}`.
fn error_fragment(
    step: &EntityStep<'_>,
    _entity: &mut Entity,
) -> std::result::Result<Option<StatusFragment>, BoxError> {
    let message = match step.input {
        Some(Value::String(message)) => Some(message.clone()),
        Some(Value::Object(map)) => map.get("message").and_then(Value::as_str).map(String::from),
        _ => None,
    };
    Ok(message.map(|m| {
        let mut fragment = StatusFragment::new();
        fragment.insert("message".into(), Value::String(m));
        fragment
    }))
}

fn error_edge() -> Edge {
    Edge::new(Event::Error, State::Error).with_logic(error_fragment)
}

/// Artifact, data item and model lifecycle.
pub fn uploadable_states() -> States {
    vec![
        EntityFsmState::new(State::Created)
            .transition(Edge::new(Event::Upload, State::Uploading))
            .transition(Edge::new(Event::Ready, State::Ready))
            .transition(error_edge())
            .transition(Edge::new(Event::Delete, State::Deleted)),
        EntityFsmState::new(State::Uploading)
            .transition(Edge::new(Event::Ready, State::Ready))
            .transition(error_edge())
            .transition(Edge::new(Event::Delete, State::Deleted)),
        EntityFsmState::new(State::Ready)
            .transition(Edge::new(Event::Upload, State::Uploading))
            .transition(error_edge())
            .transition(Edge::new(Event::Delete, State::Deleted)),
        EntityFsmState::new(State::Error)
            .transition(Edge::new(Event::Upload, State::Uploading))
            .transition(Edge::new(Event::Ready, State::Ready))
            .transition(Edge::new(Event::Delete, State::Deleted)),
        EntityFsmState::new(State::Deleted),
    ]
}

/// Workflow lifecycle.
pub fn workflow_states() -> States {
    vec![
        EntityFsmState::new(State::Created)
            .transition(Edge::new(Event::Ready, State::Ready))
            .transition(error_edge())
            .transition(Edge::new(Event::Delete, State::Deleted)),
        EntityFsmState::new(State::Ready)
            .transition(error_edge())
            .transition(Edge::new(Event::Delete, State::Deleted)),
        EntityFsmState::new(State::Error)
            .transition(Edge::new(Event::Ready, State::Ready))
            .transition(Edge::new(Event::Delete, State::Deleted)),
        EntityFsmState::new(State::Deleted),
    ]
}

/// Starts and stops whatever a trigger drives (a schedule, a listener).
pub trait TriggerActuator: Send + Sync {
    /// Trigger entered `RUNNING`.
    fn start(&self, trigger: &Entity) -> Result<Option<StatusFragment>>;

    /// Trigger is leaving `RUNNING`.
    fn stop(&self, trigger: &Entity) -> Result<Option<StatusFragment>>;
}

/// Actuator that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTriggerActuator;

impl TriggerActuator for NoopTriggerActuator {
    fn start(&self, _trigger: &Entity) -> Result<Option<StatusFragment>> {
        Ok(None)
    }

    fn stop(&self, _trigger: &Entity) -> Result<Option<StatusFragment>> {
        Ok(None)
    }
}

/// Trigger lifecycle; leaving `RUNNING` always stops the actuator.
pub fn trigger_states(actuator: Arc<dyn TriggerActuator>) -> States {
    let start = {
        let actuator = actuator.clone();
        move || {
            let actuator = actuator.clone();
            Edge::new(Event::Run, State::Running)
                .with_logic(move |_, trigger: &mut Entity| Ok(actuator.start(trigger)?))
        }
    };
    let stop_to = |event: Event, target: State| {
        let actuator = actuator.clone();
        Edge::new(event, target)
            .with_logic(move |_, trigger: &mut Entity| Ok(actuator.stop(trigger)?))
    };

    vec![
        EntityFsmState::new(State::Created)
            .transition(start())
            .transition(error_edge())
            .transition(Edge::new(Event::Delete, State::Deleted)),
        EntityFsmState::new(State::Running)
            .transition(stop_to(Event::Stop, State::Stopped))
            .transition(stop_to(Event::Error, State::Error))
            .transition(stop_to(Event::Delete, State::Deleted)),
        EntityFsmState::new(State::Stopped)
            .transition(start())
            .transition(error_edge())
            .transition(Edge::new(Event::Delete, State::Deleted)),
        EntityFsmState::new(State::Error)
            .transition(start())
            .transition(Edge::new(Event::Delete, State::Deleted)),
        EntityFsmState::new(State::Deleted),
    ]
}

/// Normalize `metadata.labels`: trimmed, non-empty, unique, sorted. An input
/// carrying `labels` replaces the current set first.
fn normalize_labels(
    step: &EntityStep<'_>,
    entity: &mut Entity,
) -> std::result::Result<Option<StatusFragment>, BoxError> {
    let source = step
        .input
        .and_then(|input| input.get("labels"))
        .or_else(|| entity.metadata.get("labels"))
        .cloned()
        .unwrap_or(Value::Null);

    let mut labels: Vec<String> = match source {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    };
    labels.sort();
    labels.dedup();

    entity.metadata.insert("labels".into(), json!(labels));
    Ok(None)
}

/// Labels plugin: an `UPDATE` self-loop on every live uploadable state.
pub fn label_states() -> States {
    [State::Created, State::Uploading, State::Ready, State::Error]
        .into_iter()
        .map(|state| {
            EntityFsmState::new(state)
                .transition(Edge::new(Event::Update, state).with_logic(normalize_labels))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::entity::EntityType;
    use crate::lifecycle::LifecycleManager;
    use crate::store::MemoryEntityStore;

    #[derive(Default)]
    struct RecordingActuator {
        calls: Mutex<Vec<&'static str>>,
    }

    impl TriggerActuator for RecordingActuator {
        fn start(&self, _trigger: &Entity) -> Result<Option<StatusFragment>> {
            self.calls.lock().unwrap().push("start");
            Ok(None)
        }

        fn stop(&self, _trigger: &Entity) -> Result<Option<StatusFragment>> {
            self.calls.lock().unwrap().push("stop");
            let mut fragment = StatusFragment::new();
            fragment.insert("stopped_by".into(), json!("actuator"));
            Ok(Some(fragment))
        }
    }

    #[tokio::test]
    async fn test_trigger_delete_from_running_stops_actuator() {
        let actuator = Arc::new(RecordingActuator::default());
        let manager = LifecycleManager::builder(
            EntityType::Trigger,
            Arc::new(MemoryEntityStore::new()),
        )
        .states(trigger_states(actuator.clone()))
        .build()
        .unwrap();

        let trigger = Entity::new(EntityType::Trigger, "demo", "cron", "nightly");
        let trigger = manager.perform(&trigger, Event::Run, None).await.unwrap();
        let deleted = manager.perform(&trigger, Event::Delete, None).await.unwrap();

        assert_eq!(deleted.state().unwrap(), State::Deleted);
        assert_eq!(deleted.status["stopped_by"], json!("actuator"));
        assert_eq!(*actuator.calls.lock().unwrap(), vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn test_labels_plugin_merges_into_uploadable_table() {
        let manager = LifecycleManager::builder(
            EntityType::DataItem,
            Arc::new(MemoryEntityStore::new()),
        )
        .states(uploadable_states())
        .states(label_states())
        .build()
        .unwrap();

        let item = Entity::new(EntityType::DataItem, "demo", "table", "t");
        let item = manager
            .update_labels(&item, &[" prod", "finance", "prod", ""])
            .await
            .unwrap();

        assert_eq!(item.state().unwrap(), State::Created);
        assert_eq!(item.metadata["labels"], json!(["finance", "prod"]));
        assert!(manager.accepts(State::Created, Event::Upload));
        assert!(!manager.accepts(State::Deleted, Event::Update));
    }

    #[tokio::test]
    async fn test_error_message_lands_in_status() {
        let manager = LifecycleManager::builder(
            EntityType::Workflow,
            Arc::new(MemoryEntityStore::new()),
        )
        .states(workflow_states())
        .build()
        .unwrap();

        let workflow = Entity::new(EntityType::Workflow, "demo", "kfp", "wf");
        let workflow = manager
            .on_error(&workflow, Some("compile failed"))
            .await
            .unwrap();

        assert_eq!(workflow.state().unwrap(), State::Error);
        assert_eq!(workflow.status["message"], json!("compile failed"));
    }
}
