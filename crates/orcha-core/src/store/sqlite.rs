// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed stores.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{EntityStore, RunnableStore, StoreError};
use crate::entity::{Entity, EntityType};
use crate::runnable::Runnable;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Connect to `url` and run migrations.
pub async fn connect(url: &str) -> Result<SqlitePool, StoreError> {
    if let Some(path) = url
        .strip_prefix("sqlite:")
        .map(|rest| rest.split('?').next().unwrap_or(rest))
        .filter(|p| !p.is_empty() && !p.starts_with(':'))
        && let Some(parent) = Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            StoreError::Unavailable(format!("failed to create directory {parent:?}: {e}"))
        })?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: String,
    entity_type: String,
    kind: String,
    project: String,
    name: String,
    user_id: Option<String>,
    spec: String,
    status: String,
    metadata: String,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EntityRow> for Entity {
    type Error = StoreError;

    fn try_from(row: EntityRow) -> Result<Self, Self::Error> {
        let entity_type: EntityType = row
            .entity_type
            .parse()
            .map_err(|e| StoreError::Unavailable(format!("corrupt entity {}: {e}", row.id)))?;
        Ok(Entity {
            entity_type,
            kind: row.kind,
            project: row.project,
            name: row.name,
            user: row.user_id,
            spec: serde_json::from_str(&row.spec)?,
            status: serde_json::from_str(&row.status)?,
            metadata: serde_json::from_str(&row.metadata)?,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            id: row.id,
        })
    }
}

const SELECT_ENTITY: &str = r#"
    SELECT id, entity_type, kind, project, name, user_id, spec, status, metadata,
           version, created_at, updated_at
    FROM entities
"#;

/// Entity store on SQLite.
#[derive(Clone)]
pub struct SqliteEntityStore {
    pool: SqlitePool,
}

impl SqliteEntityStore {
    /// Store over an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert(&self, entity: &Entity, saved: &Entity) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO entities (id, entity_type, kind, project, name, user_id, spec, status,
                                  metadata, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&saved.id)
        .bind(saved.entity_type.as_str())
        .bind(&saved.kind)
        .bind(&saved.project)
        .bind(&saved.name)
        .bind(&saved.user)
        .bind(serde_json::to_string(&saved.spec)?)
        .bind(serde_json::to_string(&saved.status)?)
        .bind(serde_json::to_string(&saved.metadata)?)
        .bind(saved.version)
        .bind(saved.created_at)
        .bind(saved.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists(entity.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, entity: &Entity, saved: &Entity) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE entities
            SET kind = ?, name = ?, user_id = ?, spec = ?, status = ?, metadata = ?,
                version = ?, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&saved.kind)
        .bind(&saved.name)
        .bind(&saved.user)
        .bind(serde_json::to_string(&saved.spec)?)
        .bind(serde_json::to_string(&saved.status)?)
        .bind(serde_json::to_string(&saved.metadata)?)
        .bind(saved.version)
        .bind(saved.updated_at)
        .bind(&entity.id)
        .bind(entity.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let found: Option<i64> = sqlx::query_scalar("SELECT version FROM entities WHERE id = ?")
            .bind(&entity.id)
            .fetch_optional(&self.pool)
            .await?;
        match found {
            Some(found) => Err(StoreError::Conflict {
                id: entity.id.clone(),
                expected: entity.version,
                found,
            }),
            None => Err(StoreError::NotFound(entity.id.clone())),
        }
    }
}

#[async_trait]
impl EntityStore for SqliteEntityStore {
    async fn find(&self, id: &str) -> Result<Option<Entity>, StoreError> {
        let row = sqlx::query_as::<_, EntityRow>(&format!("{SELECT_ENTITY} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Entity::try_from).transpose()
    }

    async fn save(&self, entity: &Entity) -> Result<Entity, StoreError> {
        let mut saved = entity.clone();
        saved.version = entity.version + 1;
        saved.updated_at = Utc::now();

        if entity.version == 0 {
            self.insert(entity, &saved).await?;
        } else {
            self.update(entity, &saved).await?;
        }
        Ok(saved)
    }

    async fn delete(&self, id: &str, version: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM entities WHERE id = ? AND version = ?")
            .bind(id)
            .bind(version)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }

        let found: Option<i64> = sqlx::query_scalar("SELECT version FROM entities WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match found {
            Some(found) => Err(StoreError::Conflict {
                id: id.to_string(),
                expected: version,
                found,
            }),
            None => Ok(()),
        }
    }

    async fn list(
        &self,
        entity_type: EntityType,
        project: Option<&str>,
    ) -> Result<Vec<Entity>, StoreError> {
        let rows = match project {
            Some(project) => {
                sqlx::query_as::<_, EntityRow>(&format!(
                    "{SELECT_ENTITY} WHERE entity_type = ? AND project = ? ORDER BY created_at, id"
                ))
                .bind(entity_type.as_str())
                .bind(project)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, EntityRow>(&format!(
                    "{SELECT_ENTITY} WHERE entity_type = ? ORDER BY created_at, id"
                ))
                .bind(entity_type.as_str())
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(Entity::try_from).collect()
    }
}

/// Runnable store on SQLite.
#[derive(Clone)]
pub struct SqliteRunnableStore {
    pool: SqlitePool,
}

impl SqliteRunnableStore {
    /// Store over an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunnableStore for SqliteRunnableStore {
    async fn find(&self, id: &str) -> Result<Option<Runnable>, StoreError> {
        let document: Option<String> =
            sqlx::query_scalar("SELECT document FROM runnables WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(document.map(|d| serde_json::from_str(&d)).transpose()?)
    }

    async fn find_all(&self) -> Result<Vec<Runnable>, StoreError> {
        let documents: Vec<String> =
            sqlx::query_scalar("SELECT document FROM runnables ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        documents
            .iter()
            .map(|d| serde_json::from_str(d).map_err(StoreError::from))
            .collect()
    }

    async fn store(&self, runnable: &Runnable) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO runnables (id, framework, state, document, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE
            SET framework = excluded.framework,
                state = excluded.state,
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&runnable.id)
        .bind(&runnable.framework)
        .bind(runnable.state.as_str())
        .bind(serde_json::to_string(runnable)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM runnables WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::state::State;

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    #[tokio::test]
    async fn test_save_and_find_entity() {
        let store = SqliteEntityStore::new(test_pool().await);
        let mut entity = Entity::new(EntityType::DataItem, "demo", "table", "customers")
            .with_user("alice");
        entity.spec.insert("path".into(), json!("s3://bucket/customers.csv"));

        let saved = store.save(&entity).await.expect("Failed to save");
        assert_eq!(saved.version, 1);

        let found = store
            .find(&entity.id)
            .await
            .expect("Failed to find")
            .expect("Entity should exist");
        assert_eq!(found.entity_type, EntityType::DataItem);
        assert_eq!(found.user.as_deref(), Some("alice"));
        assert_eq!(found.spec["path"], json!("s3://bucket/customers.csv"));
        assert_eq!(found.state().unwrap(), State::Created);
        assert_eq!(found.version, 1);
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = SqliteEntityStore::new(test_pool().await);
        let saved = store
            .save(&Entity::new(EntityType::Run, "demo", "python", "r"))
            .await
            .unwrap();

        store.save(&saved).await.expect("first update");
        let err = store.save(&saved).await.unwrap_err();

        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 1,
                found: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_insert_and_missing_update() {
        let store = SqliteEntityStore::new(test_pool().await);
        let entity = Entity::new(EntityType::Artifact, "demo", "file", "a");
        store.save(&entity).await.unwrap();

        assert!(matches!(
            store.save(&entity).await.unwrap_err(),
            StoreError::AlreadyExists(_)
        ));

        let mut ghost = Entity::new(EntityType::Artifact, "demo", "file", "ghost");
        ghost.version = 4;
        assert!(matches!(
            store.save(&ghost).await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let store = SqliteEntityStore::new(test_pool().await);
        let a = store
            .save(&Entity::new(EntityType::Model, "p1", "sklearn", "a"))
            .await
            .unwrap();
        store
            .save(&Entity::new(EntityType::Model, "p2", "sklearn", "b"))
            .await
            .unwrap();

        assert_eq!(store.list(EntityType::Model, None).await.unwrap().len(), 2);
        assert_eq!(store.list(EntityType::Model, Some("p1")).await.unwrap().len(), 1);

        assert!(matches!(
            store.delete(&a.id, a.version - 1).await,
            Err(StoreError::Conflict { expected: 0, found: 1, .. })
        ));
        store.delete(&a.id, a.version).await.unwrap();
        assert!(store.find(&a.id).await.unwrap().is_none());
        store.delete(&a.id, a.version).await.unwrap();
        assert_eq!(store.list(EntityType::Model, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_runnable_store_upsert() {
        let store = SqliteRunnableStore::new(test_pool().await);
        let mut runnable = Runnable::new("run-1", "k8sjob", "python", "job", "demo");
        runnable.image = Some("python:3.12".into());

        store.store(&runnable).await.unwrap();
        store
            .store(&runnable.clone().with_state(State::Running, "pod started"))
            .await
            .unwrap();

        let found = store.find("run-1").await.unwrap().unwrap();
        assert_eq!(found.state, State::Running);
        assert_eq!(found.image.as_deref(), Some("python:3.12"));
        assert_eq!(store.find_all().await.unwrap().len(), 1);

        store.remove("run-1").await.unwrap();
        assert!(store.find("run-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_creates_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("orcha.db");
        let url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = connect(&url).await.expect("Failed to connect");
        let store = SqliteEntityStore::new(pool);
        store
            .save(&Entity::new(EntityType::Workflow, "demo", "kfp", "wf"))
            .await
            .unwrap();

        assert!(path.exists());
    }
}
