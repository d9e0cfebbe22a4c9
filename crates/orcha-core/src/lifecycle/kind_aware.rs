// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-kind dispatch of lifecycle operations.

use std::collections::HashMap;
use std::sync::Arc;

use super::{LifecycleManager, TransitionOutput};
use crate::entity::{Entity, EntityType};
use crate::error::{Error, Result};
use crate::state::{Event, State};

/// Routes each entity to the lifecycle manager registered for its kind.
///
/// Runs use one table per runtime, so a `python` run and a `kfp` run are
/// moved by different managers.
pub struct KindAwareLifecycleManager<I, O> {
    entity_type: EntityType,
    registry: &'static str,
    managers: HashMap<String, Arc<LifecycleManager<I, O>>>,
}

impl<I, O> KindAwareLifecycleManager<I, O>
where
    I: Send + Sync + 'static,
    O: TransitionOutput,
{
    /// Empty dispatcher for `entity_type`. `registry` names the kind space
    /// in unknown-kind errors, e.g. `runtime`.
    pub fn new(entity_type: EntityType, registry: &'static str) -> Self {
        Self {
            entity_type,
            registry,
            managers: HashMap::new(),
        }
    }

    /// Register the manager for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, manager: Arc<LifecycleManager<I, O>>) {
        self.managers.insert(kind.into(), manager);
    }

    /// Manager for `kind`.
    pub fn get(&self, kind: &str) -> Result<&Arc<LifecycleManager<I, O>>> {
        self.managers
            .get(kind)
            .ok_or_else(|| Error::unknown_kind(self.registry, kind))
    }

    /// Manager responsible for `entity`.
    pub fn for_entity(&self, entity: &Entity) -> Result<&Arc<LifecycleManager<I, O>>> {
        if entity.entity_type != self.entity_type {
            return Err(Error::InvalidRequest(format!(
                "expected {} but got {} {}",
                self.entity_type, entity.entity_type, entity.id
            )));
        }
        self.get(&entity.kind)
    }

    /// Registered kinds.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.managers.keys().map(String::as_str)
    }

    /// [`LifecycleManager::perform`] on the entity's manager.
    pub async fn perform(&self, entity: &Entity, event: Event, input: Option<&I>) -> Result<Entity> {
        self.for_entity(entity)?.perform(entity, event, input).await
    }

    /// [`LifecycleManager::handle`] on the entity's manager.
    pub async fn handle(&self, entity: &Entity, target: State, input: Option<&I>) -> Result<Entity> {
        self.for_entity(entity)?.handle(entity, target, input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lifecycle::{RunLifecycleManager, run_states};
    use crate::runnable::{Runnable, RunnableCommand};
    use crate::runtime::{Runtime, container_runtime};
    use crate::store::MemoryEntityStore;

    #[tokio::test]
    async fn test_unknown_kind_is_reported() {
        let runtime: Arc<dyn Runtime> = Arc::new(container_runtime(&Config::default()));
        let manager: RunLifecycleManager =
            LifecycleManager::builder(EntityType::Run, Arc::new(MemoryEntityStore::new()))
                .states(run_states(runtime))
                .build()
                .unwrap();
        let mut dispatcher: KindAwareLifecycleManager<Runnable, RunnableCommand> =
            KindAwareLifecycleManager::new(EntityType::Run, "runtime");
        dispatcher.register("container", Arc::new(manager));

        let known = Entity::new(EntityType::Run, "demo", "container", "a");
        let built = dispatcher.perform(&known, Event::Build, None).await.unwrap();
        assert_eq!(built.state().unwrap(), State::Built);

        let unknown = Entity::new(EntityType::Run, "demo", "spark", "b");
        let err = dispatcher
            .perform(&unknown, Event::Build, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_KIND");
        assert!(err.to_string().contains("spark"));
    }
}
