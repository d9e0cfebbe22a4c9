// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Post-commit listeners.
//!
//! [`HookedEntityStore`] delegates to an inner store and, after each
//! successful write, hands every listener the previous and the new snapshot
//! of the entity (`new` is `None` on delete). Listener failures are logged
//! and never reach the writer.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{EntityStore, StoreError};
use crate::entity::{Entity, EntityType};
use crate::error::Result;

/// Observer of committed entity writes.
#[async_trait]
pub trait EntityListener: Send + Sync {
    /// Listener name, for logs.
    fn name(&self) -> &str;

    /// Called after a write has been committed.
    async fn on_committed(&self, old: Option<&Entity>, new: Option<&Entity>) -> Result<()>;
}

/// Entity store that notifies listeners after each commit.
#[derive(Clone)]
pub struct HookedEntityStore {
    inner: Arc<dyn EntityStore>,
    listeners: Vec<Arc<dyn EntityListener>>,
}

impl HookedEntityStore {
    /// Wrap `inner` with no listeners.
    pub fn new(inner: Arc<dyn EntityStore>) -> Self {
        Self {
            inner,
            listeners: Vec::new(),
        }
    }

    /// Add a listener; listeners run in registration order.
    pub fn with_listener(mut self, listener: Arc<dyn EntityListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    async fn notify(&self, old: Option<&Entity>, new: Option<&Entity>) {
        for listener in &self.listeners {
            if let Err(e) = listener.on_committed(old, new).await {
                warn!(
                    listener = listener.name(),
                    entity_id = old.or(new).map(|e| e.id.as_str()).unwrap_or_default(),
                    error = %e,
                    "Entity listener failed"
                );
            }
        }
    }
}

#[async_trait]
impl EntityStore for HookedEntityStore {
    async fn find(&self, id: &str) -> std::result::Result<Option<Entity>, StoreError> {
        self.inner.find(id).await
    }

    async fn save(&self, entity: &Entity) -> std::result::Result<Entity, StoreError> {
        let old = if self.listeners.is_empty() {
            None
        } else {
            self.inner.find(&entity.id).await?
        };
        let saved = self.inner.save(entity).await?;
        self.notify(old.as_ref(), Some(&saved)).await;
        Ok(saved)
    }

    async fn delete(&self, id: &str, version: i64) -> std::result::Result<(), StoreError> {
        let old = self.inner.find(id).await?;
        self.inner.delete(id, version).await?;
        if old.is_some() {
            self.notify(old.as_ref(), None).await;
        }
        Ok(())
    }

    async fn list(
        &self,
        entity_type: EntityType,
        project: Option<&str>,
    ) -> std::result::Result<Vec<Entity>, StoreError> {
        self.inner.list(entity_type, project).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::Error;
    use crate::store::MemoryEntityStore;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(Option<i64>, Option<i64>)>>,
    }

    #[async_trait]
    impl EntityListener for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_committed(&self, old: Option<&Entity>, new: Option<&Entity>) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((old.map(|e| e.version), new.map(|e| e.version)));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EntityListener for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_committed(&self, _: Option<&Entity>, _: Option<&Entity>) -> Result<()> {
            Err(Error::InvalidRequest("index offline".into()))
        }
    }

    #[tokio::test]
    async fn test_listeners_see_old_and_new() {
        let recorder = Arc::new(Recorder::default());
        let store = HookedEntityStore::new(Arc::new(MemoryEntityStore::new()))
            .with_listener(Arc::new(Failing))
            .with_listener(recorder.clone());

        let saved = store
            .save(&Entity::new(EntityType::Artifact, "demo", "file", "a"))
            .await
            .unwrap();
        let saved = store.save(&saved).await.unwrap();
        store.delete(&saved.id, saved.version).await.unwrap();
        store.delete(&saved.id, saved.version).await.unwrap();

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![(None, Some(1)), (Some(1), Some(2)), (Some(2), None)]
        );
    }

    #[tokio::test]
    async fn test_failed_write_does_not_notify() {
        let recorder = Arc::new(Recorder::default());
        let store = HookedEntityStore::new(Arc::new(MemoryEntityStore::new()))
            .with_listener(recorder.clone());

        let entity = Entity::new(EntityType::Artifact, "demo", "file", "a");
        store.save(&entity).await.unwrap();
        assert!(store.save(&entity).await.is_err());

        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
    }
}
