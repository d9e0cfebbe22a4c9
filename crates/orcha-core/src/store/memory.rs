// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory stores for development and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{EntityStore, RunnableStore, StoreError};
use crate::entity::{Entity, EntityType};
use crate::runnable::Runnable;

/// Entity store backed by a map.
#[derive(Clone, Default)]
pub struct MemoryEntityStore {
    entities: Arc<RwLock<HashMap<String, Entity>>>,
}

impl MemoryEntityStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn find(&self, id: &str) -> Result<Option<Entity>, StoreError> {
        Ok(self.entities.read().await.get(id).cloned())
    }

    async fn save(&self, entity: &Entity) -> Result<Entity, StoreError> {
        let mut entities = self.entities.write().await;
        match (entities.get(&entity.id), entity.version) {
            (Some(_), 0) => return Err(StoreError::AlreadyExists(entity.id.clone())),
            (None, 0) => {}
            (None, _) => return Err(StoreError::NotFound(entity.id.clone())),
            (Some(stored), version) if stored.version != version => {
                return Err(StoreError::Conflict {
                    id: entity.id.clone(),
                    expected: version,
                    found: stored.version,
                });
            }
            (Some(_), _) => {}
        }

        let mut saved = entity.clone();
        saved.version += 1;
        saved.updated_at = Utc::now();
        entities.insert(saved.id.clone(), saved.clone());
        Ok(saved)
    }

    async fn delete(&self, id: &str, version: i64) -> Result<(), StoreError> {
        let mut entities = self.entities.write().await;
        match entities.get(id) {
            Some(stored) if stored.version != version => Err(StoreError::Conflict {
                id: id.to_string(),
                expected: version,
                found: stored.version,
            }),
            Some(_) => {
                entities.remove(id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn list(
        &self,
        entity_type: EntityType,
        project: Option<&str>,
    ) -> Result<Vec<Entity>, StoreError> {
        let mut found: Vec<Entity> = self
            .entities
            .read()
            .await
            .values()
            .filter(|e| e.entity_type == entity_type)
            .filter(|e| project.is_none_or(|p| e.project == p))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }
}

/// Runnable store backed by a map.
#[derive(Clone, Default)]
pub struct MemoryRunnableStore {
    runnables: Arc<RwLock<HashMap<String, Runnable>>>,
}

impl MemoryRunnableStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunnableStore for MemoryRunnableStore {
    async fn find(&self, id: &str) -> Result<Option<Runnable>, StoreError> {
        Ok(self.runnables.read().await.get(id).cloned())
    }

    async fn find_all(&self) -> Result<Vec<Runnable>, StoreError> {
        let mut all: Vec<Runnable> = self.runnables.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn store(&self, runnable: &Runnable) -> Result<(), StoreError> {
        self.runnables
            .write()
            .await
            .insert(runnable.id.clone(), runnable.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.runnables.write().await.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    #[tokio::test]
    async fn test_save_increments_version() {
        let store = MemoryEntityStore::new();
        let entity = Entity::new(EntityType::Artifact, "demo", "file", "a");

        let saved = store.save(&entity).await.unwrap();
        assert_eq!(saved.version, 1);

        let saved = store.save(&saved).await.unwrap();
        assert_eq!(saved.version, 2);
        assert_eq!(store.find(&entity.id).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let store = MemoryEntityStore::new();
        let first = store
            .save(&Entity::new(EntityType::Run, "demo", "python", "r"))
            .await
            .unwrap();

        let mut winner = first.clone();
        winner.metadata.insert("winner".into(), true.into());
        store.save(&winner).await.unwrap();

        let err = store.save(&first).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 1,
                found: 2,
                ..
            }
        ));

        // A delete read from the stale copy loses too.
        assert!(matches!(
            store.delete(&first.id, first.version).await,
            Err(StoreError::Conflict { found: 2, .. })
        ));
        assert!(store.find(&first.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_insert_twice_rejected() {
        let store = MemoryEntityStore::new();
        let entity = Entity::new(EntityType::Model, "demo", "sklearn", "m");
        store.save(&entity).await.unwrap();

        assert!(matches!(
            store.save(&entity).await.unwrap_err(),
            StoreError::AlreadyExists(_)
        ));
    }

    #[tokio::test]
    async fn test_list_filters_type_and_project() {
        let store = MemoryEntityStore::new();
        store
            .save(&Entity::new(EntityType::DataItem, "a", "table", "x"))
            .await
            .unwrap();
        store
            .save(&Entity::new(EntityType::DataItem, "b", "table", "y"))
            .await
            .unwrap();
        store
            .save(&Entity::new(EntityType::Artifact, "a", "file", "z"))
            .await
            .unwrap();

        assert_eq!(store.list(EntityType::DataItem, None).await.unwrap().len(), 2);
        assert_eq!(store.list(EntityType::DataItem, Some("a")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_runnable_upsert_and_remove() {
        let store = MemoryRunnableStore::new();
        let runnable = Runnable::new("run-1", "k8sjob", "python", "job", "demo");

        store.store(&runnable).await.unwrap();
        store
            .store(&runnable.clone().with_state(State::Running, "started"))
            .await
            .unwrap();

        let found = store.find("run-1").await.unwrap().unwrap();
        assert_eq!(found.state, State::Running);
        assert_eq!(store.find_all().await.unwrap().len(), 1);

        store.remove("run-1").await.unwrap();
        store.remove("run-1").await.unwrap();
        assert!(store.find("run-1").await.unwrap().is_none());
    }
}
