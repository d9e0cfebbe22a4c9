// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control plane over file-backed SQLite stores.

mod common;

use std::sync::Arc;

use sqlx::SqlitePool;

use common::{TestContext, container_request};
use orcha_core::control_plane::ControlPlane;
use orcha_core::entity::{Entity, EntityType};
use orcha_core::state::State;
use orcha_core::store::sqlite::{self, SqliteEntityStore, SqliteRunnableStore};
use orcha_core::store::{EntityStore, RunnableStore, StoreError};

fn database_url(dir: &tempfile::TempDir) -> String {
    format!("sqlite:{}?mode=rwc", dir.path().join("nested/orcha.db").display())
}

async fn plane_over(ctx: &TestContext, pool: SqlitePool) -> ControlPlane {
    ControlPlane::builder()
        .config(TestContext::config())
        .entity_store(Arc::new(SqliteEntityStore::new(pool.clone())))
        .runnable_store(Arc::new(SqliteRunnableStore::new(pool)))
        .kube_api(ctx.cluster.clone())
        .secrets(ctx.secrets.clone())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_connect_creates_directory_and_migrates() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite::connect(&database_url(&dir)).await.unwrap();
    let store = SqliteEntityStore::new(pool);

    let entity = store
        .save(&Entity::new(EntityType::Model, "demo", "sklearn", "churn"))
        .await
        .unwrap();
    assert_eq!(entity.version, 1);

    let stale = Entity {
        version: 0,
        ..entity.clone()
    };
    assert!(matches!(
        store.save(&stale).await,
        Err(StoreError::AlreadyExists(_))
    ));
    let updated = store.save(&entity).await.unwrap();
    assert!(matches!(
        store.save(&entity).await,
        Err(StoreError::Conflict { expected: 1, found: 2, .. })
    ));
    assert_eq!(updated.version, 2);

    assert!(dir.path().join("nested/orcha.db").exists());
}

#[tokio::test]
async fn test_runs_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = database_url(&dir);
    let ctx = TestContext::new();

    let pool = sqlite::connect(&url).await.unwrap();
    let plane = plane_over(&ctx, pool.clone()).await;
    let run = plane.runs().create(container_request("busybox")).await.unwrap();
    plane.runs().run(&run.id).await.unwrap();
    plane.shutdown().await.unwrap();
    pool.close().await;

    let pool = sqlite::connect(&url).await.unwrap();
    let entities = SqliteEntityStore::new(pool.clone());
    let runnables = SqliteRunnableStore::new(pool);

    let stored = entities.find(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.state().unwrap(), State::Ready);
    assert_eq!(stored.spec_str("image"), Some("busybox"));
    assert_eq!(
        entities
            .list(EntityType::Run, Some("demo"))
            .await
            .unwrap()
            .len(),
        1
    );

    let runnable = runnables.find(&run.id).await.unwrap().unwrap();
    assert_eq!(runnable.state, State::Ready);
    assert_eq!(runnable.image.as_deref(), Some("busybox"));
}

#[tokio::test]
async fn test_deleted_run_leaves_no_rows() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = TestContext::new();
    let pool = sqlite::connect(&database_url(&dir)).await.unwrap();
    let plane = plane_over(&ctx, pool.clone()).await;
    let run = plane.runs().create(container_request("busybox")).await.unwrap();
    plane.runs().run(&run.id).await.unwrap();

    plane.runs().delete(&run.id).await.unwrap();

    assert!(
        SqliteEntityStore::new(pool.clone())
            .find(&run.id)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        SqliteRunnableStore::new(pool)
            .find_all()
            .await
            .unwrap()
            .is_empty()
    );
    plane.shutdown().await.unwrap();
}
