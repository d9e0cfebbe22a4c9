// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle managers.
//!
//! A [`LifecycleManager`] owns one frozen transition table for one entity
//! type and moves entities through it:
//!
//! - [`LifecycleManager::perform`] applies a caller-chosen event.
//! - [`LifecycleManager::handle`] moves to an externally reported state,
//!   through the single edge that leads there. Being at the target already
//!   is a no-op.
//!
//! Both are split into a synchronous `prepare_*` step (FSM only, nothing
//! persisted) and an async [`LifecycleManager::commit`] so callers can run
//! backend side effects in between and persist only once those succeed.

use std::sync::Arc;

use orcha_fsm::{FsmFactory, FsmFactoryBuilder, FsmState, StateBuilder, Transition};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::entity::{Entity, EntityType, StatusFragment};
use crate::error::{Error, Result};
use crate::runnable::RunnableCommand;
use crate::state::{Event, State};
use crate::store::EntityStore;

pub mod kind_aware;
pub mod run;
pub mod tables;

pub use kind_aware::KindAwareLifecycleManager;
pub use run::{RunFsmState, RunLifecycleManager, run_states};
pub use tables::{
    NoopTriggerActuator, TriggerActuator, label_states, trigger_states, uploadable_states,
    workflow_states,
};

/// Transition table over entities.
pub type EntityFsmFactory<I, O> = FsmFactory<State, Event, Entity, I, O>;
/// One source state of an entity table.
pub type EntityFsmState<I, O> = FsmState<State, Event, Entity, I, O>;
/// One edge of an entity table.
pub type EntityTransition<I, O> = Transition<State, Event, Entity, I, O>;

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 1024;

/// Output of a transition's logic.
pub trait TransitionOutput: Send + Sync + 'static {
    /// Status fragment to merge into the entity, if the output carries one.
    fn status_fragment(&self) -> Option<&StatusFragment> {
        None
    }
}

impl TransitionOutput for StatusFragment {
    fn status_fragment(&self) -> Option<&StatusFragment> {
        Some(self)
    }
}

impl TransitionOutput for RunnableCommand {}

/// Broadcast after every accepted transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    /// Entity id.
    pub id: String,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity kind.
    pub kind: String,
    /// Owning project.
    pub project: String,
    /// Owning user.
    pub user: Option<String>,
    /// Event that fired.
    pub event: Option<Event>,
    /// State left.
    pub from: State,
    /// State entered.
    pub state: State,
}

/// A transition applied in memory but not yet persisted.
#[derive(Debug)]
pub struct Transitioned<O> {
    /// Entity with status updated and positioned at `to`.
    pub entity: Entity,
    /// State before the transition.
    pub from: State,
    /// State after the transition.
    pub to: State,
    /// Event that fired; `None` when nothing was applied.
    pub event: Option<Event>,
    /// Output of the transition's logic.
    pub output: Option<O>,
    /// False when `handle` found the entity already at its target.
    pub applied: bool,
}

/// Moves entities of one type through one transition table.
pub struct LifecycleManager<I = Value, O = StatusFragment> {
    entity_type: EntityType,
    factory: EntityFsmFactory<I, O>,
    store: Arc<dyn EntityStore>,
    events: broadcast::Sender<LifecycleEvent>,
}

/// Collects tables for a [`LifecycleManager`].
pub struct LifecycleManagerBuilder<I, O> {
    entity_type: EntityType,
    store: Arc<dyn EntityStore>,
    tables: FsmFactoryBuilder<State, Event, Entity, I, O>,
    events: Option<broadcast::Sender<LifecycleEvent>>,
}

impl<I, O> LifecycleManagerBuilder<I, O> {
    /// Add states from a base table or plugin.
    pub fn states(mut self, states: impl IntoIterator<Item = EntityFsmState<I, O>>) -> Self {
        self.tables = self.tables.states(states);
        self
    }

    /// Add everything a contributor declares.
    pub fn contribute(mut self, builder: &dyn StateBuilder<State, Event, Entity, I, O>) -> Self {
        self.tables = self.tables.contribute(builder);
        self
    }

    /// Publish lifecycle events on an existing channel.
    pub fn events(mut self, events: broadcast::Sender<LifecycleEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Merge and freeze the tables.
    pub fn build(self) -> Result<LifecycleManager<I, O>> {
        let factory = self.tables.build()?;
        Ok(LifecycleManager {
            entity_type: self.entity_type,
            factory,
            store: self.store,
            events: self
                .events
                .unwrap_or_else(|| broadcast::channel(EVENT_CAPACITY).0),
        })
    }
}

impl<I, O> LifecycleManager<I, O>
where
    I: Send + Sync + 'static,
    O: TransitionOutput,
{
    /// Start assembling a manager for `entity_type`.
    pub fn builder(
        entity_type: EntityType,
        store: Arc<dyn EntityStore>,
    ) -> LifecycleManagerBuilder<I, O> {
        LifecycleManagerBuilder {
            entity_type,
            store,
            tables: FsmFactory::builder(),
            events: None,
        }
    }

    /// Entity type this manager handles.
    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// Receive lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Declared states.
    pub fn states(&self) -> Vec<State> {
        self.factory.states().copied().collect()
    }

    /// Whether a single edge leads from `from` to `to`.
    pub fn has_transition(&self, from: State, to: State) -> bool {
        self.factory.has_transition(&from, &to)
    }

    /// Whether `event` is accepted in `from`.
    pub fn accepts(&self, from: State, event: Event) -> bool {
        self.factory.accepts(&from, &event)
    }

    /// Current state of `entity`, checked against this table.
    pub fn current_state(&self, entity: &Entity) -> Result<State> {
        if entity.entity_type != self.entity_type {
            return Err(Error::InvalidRequest(format!(
                "{} lifecycle cannot manage {} {}",
                self.entity_type, entity.entity_type, entity.id
            )));
        }
        let state = entity.state()?;
        if !self.factory.contains(&state) {
            return Err(Error::InvalidState(format!(
                "{state} is not a {} state",
                self.entity_type
            )));
        }
        Ok(state)
    }

    /// Apply `event` in memory.
    pub fn prepare_perform(
        &self,
        entity: &Entity,
        event: Event,
        input: Option<&I>,
    ) -> Result<Transitioned<O>> {
        let from = self.current_state(entity)?;
        let mut fsm = self.factory.create(from, entity.clone())?;
        let output = fsm.apply_event(&event, input)?;
        let to = *fsm.current_state();
        Ok(self.finish(fsm.into_context(), from, to, Some(event), output))
    }

    /// Move to `target` in memory.
    pub fn prepare_handle(
        &self,
        entity: &Entity,
        target: State,
        input: Option<&I>,
    ) -> Result<Transitioned<O>> {
        let from = self.current_state(entity)?;
        if from == target {
            debug!(
                entity_id = %entity.id,
                state = %target,
                "Entity already at reported state"
            );
            return Ok(Transitioned {
                entity: entity.clone(),
                from,
                to: target,
                event: None,
                output: None,
                applied: false,
            });
        }

        let event = self
            .factory
            .state(&from)
            .and_then(|s| s.transitions_to(&target).next())
            .map(|t| *t.event());
        let mut fsm = self.factory.create(from, entity.clone())?;
        let output = fsm.go_to_state(&target, input)?;
        let to = *fsm.current_state();
        Ok(self.finish(fsm.into_context(), from, to, event, output))
    }

    fn finish(
        &self,
        mut entity: Entity,
        from: State,
        to: State,
        event: Option<Event>,
        output: Option<O>,
    ) -> Transitioned<O> {
        if let Some(fragment) = output.as_ref().and_then(TransitionOutput::status_fragment) {
            entity.merge_status(fragment.clone());
        }
        entity.set_state(to);
        Transitioned {
            entity,
            from,
            to,
            event,
            output,
            applied: true,
        }
    }

    /// Persist a prepared transition and announce it.
    ///
    /// Entering `DELETED` removes the entity from the store. Returns the
    /// entity as stored (or as it was when deleted) and the logic's output.
    pub async fn commit(&self, transitioned: Transitioned<O>) -> Result<(Entity, Option<O>)> {
        let Transitioned {
            entity,
            from,
            to,
            event,
            output,
            applied,
        } = transitioned;

        if !applied {
            return Ok((entity, output));
        }

        let entity = if to == State::Deleted {
            self.store.delete(&entity.id, entity.version).await?;
            entity
        } else {
            self.store.save(&entity).await?
        };

        info!(
            entity_type = %self.entity_type,
            entity_id = %entity.id,
            from = %from,
            to = %to,
            event = event.map(|e| e.as_str()).unwrap_or("-"),
            "Lifecycle transition"
        );

        // No subscribers is fine.
        let _ = self.events.send(LifecycleEvent {
            id: entity.id.clone(),
            entity_type: entity.entity_type,
            kind: entity.kind.clone(),
            project: entity.project.clone(),
            user: entity.user.clone(),
            event,
            from,
            state: to,
        });

        Ok((entity, output))
    }

    /// Apply `event` and persist.
    pub async fn perform(&self, entity: &Entity, event: Event, input: Option<&I>) -> Result<Entity> {
        let transitioned = self.prepare_perform(entity, event, input)?;
        Ok(self.commit(transitioned).await?.0)
    }

    /// Move to `target` and persist; no-op when already there.
    pub async fn handle(&self, entity: &Entity, target: State, input: Option<&I>) -> Result<Entity> {
        let transitioned = self.prepare_handle(entity, target, input)?;
        Ok(self.commit(transitioned).await?.0)
    }
}

/// Convenience operations for uploadable entities.
impl LifecycleManager<Value, StatusFragment> {
    /// Start an upload.
    pub async fn upload(&self, entity: &Entity) -> Result<Entity> {
        self.perform(entity, Event::Upload, None).await
    }

    /// Delete.
    pub async fn delete(&self, entity: &Entity) -> Result<Entity> {
        self.perform(entity, Event::Delete, None).await
    }

    /// Upload reported as started.
    pub async fn on_uploading(&self, entity: &Entity) -> Result<Entity> {
        self.handle(entity, State::Uploading, None).await
    }

    /// Content reported as available.
    pub async fn on_ready(&self, entity: &Entity) -> Result<Entity> {
        self.handle(entity, State::Ready, None).await
    }

    /// Failure reported, with an optional message stored in status.
    pub async fn on_error(&self, entity: &Entity, message: Option<&str>) -> Result<Entity> {
        let input = message.map(|m| Value::String(m.to_string()));
        self.handle(entity, State::Error, input.as_ref()).await
    }

    /// Replace labels (plugin-provided `UPDATE` transition).
    pub async fn update_labels(&self, entity: &Entity, labels: &[&str]) -> Result<Entity> {
        let input = serde_json::json!({ "labels": labels });
        self.perform(entity, Event::Update, Some(&input)).await
    }
}
