// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity and runnable persistence.
//!
//! Two stores sit behind traits so lifecycle code never depends on a
//! backend:
//!
//! - [`EntityStore`] holds lifecycle entities and enforces optimistic
//!   concurrency through [`Entity::version`].
//! - [`RunnableStore`] holds submitted runnables for recovery after a
//!   restart.
//!
//! [`memory`] and [`sqlite`] provide both; [`HookedEntityStore`] wraps any
//! entity store with post-commit listeners.

use async_trait::async_trait;
use thiserror::Error;

use crate::entity::{Entity, EntityType};
use crate::runnable::Runnable;

pub mod hooks;
pub mod memory;
pub mod sqlite;

pub use hooks::{EntityListener, HookedEntityStore};
pub use memory::{MemoryEntityStore, MemoryRunnableStore};
pub use sqlite::{SqliteEntityStore, SqliteRunnableStore};

/// Persistence errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The stored version differs from the one being saved.
    #[error("entity {id} was modified concurrently (expected version {expected}, found {found})")]
    Conflict {
        /// Entity id.
        id: String,
        /// Version the writer read.
        expected: i64,
        /// Version currently stored.
        found: i64,
    },

    /// No entity with this id.
    #[error("entity {0} not found")]
    NotFound(String),

    /// A new entity reused an existing id.
    #[error("entity {0} already exists")]
    AlreadyExists(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failed.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A stored document could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store could not be opened.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Lifecycle entity storage.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Entity by id.
    async fn find(&self, id: &str) -> Result<Option<Entity>, StoreError>;

    /// Insert (version `0`) or update (stored version must equal
    /// `entity.version`). Returns the entity as stored, with its version
    /// incremented.
    async fn save(&self, entity: &Entity) -> Result<Entity, StoreError>;

    /// Remove by id when the stored version equals `version`. Removing a
    /// missing entity succeeds.
    async fn delete(&self, id: &str, version: i64) -> Result<(), StoreError>;

    /// Entities of one type, optionally within one project.
    async fn list(
        &self,
        entity_type: EntityType,
        project: Option<&str>,
    ) -> Result<Vec<Entity>, StoreError>;
}

/// Submitted runnable storage.
#[async_trait]
pub trait RunnableStore: Send + Sync {
    /// Runnable by id.
    async fn find(&self, id: &str) -> Result<Option<Runnable>, StoreError>;

    /// Every stored runnable.
    async fn find_all(&self) -> Result<Vec<Runnable>, StoreError>;

    /// Insert or replace.
    async fn store(&self, runnable: &Runnable) -> Result<(), StoreError>;

    /// Remove by id. Removing a missing runnable succeeds.
    async fn remove(&self, id: &str) -> Result<(), StoreError>;
}
