// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run operations through an assembled control plane.

mod common;

use common::{TestContext, container_request, job_name, local_request};
use orcha_core::entity::{Entity, EntityType};
use orcha_core::error::Error;
use orcha_core::spec::{FunctionSpec, TaskSpec};
use orcha_core::state::State;
use orcha_core::store::{EntityStore, RunnableStore};

#[tokio::test]
async fn test_create_and_run_submits_job() {
    let ctx = TestContext::new();
    let plane = ctx.start().await;

    let run = plane.runs().create(container_request("busybox")).await.unwrap();
    assert_eq!(run.state().unwrap(), State::Built);
    assert_eq!(run.user.as_deref(), Some("alice"));

    let run = plane.runs().run(&run.id).await.unwrap();

    assert_eq!(run.state().unwrap(), State::Ready);
    let job = ctx
        .cluster
        .resource("Job", common::NAMESPACE, &job_name(&run.id))
        .expect("job applied");
    assert_eq!(job.labels["orcha/run-id"], run.id);
    let runnable = ctx.runnables.find(&run.id).await.unwrap().unwrap();
    assert_eq!(runnable.state, State::Ready);
    assert_eq!(runnable.user.as_deref(), Some("alice"));
    assert!(
        runnable
            .envs
            .iter()
            .any(|e| e.name == "RUN_ID" && e.value == run.id)
    );

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_spec_precedence_run_over_task_over_function() {
    let ctx = TestContext::new();
    let plane = ctx.start().await;

    let mut request = container_request("run-image");
    request.function = FunctionSpec {
        image: Some("function-image".into()),
        command: Some("function-command".into()),
        args: Some(vec!["--function".into()]),
        ..FunctionSpec::default()
    };
    request.task = TaskSpec {
        image: Some("task-image".into()),
        args: Some(vec!["--task".into()]),
        backoff_limit: Some(2),
        ..TaskSpec::default()
    };

    let run = plane.runs().create(request).await.unwrap();

    assert_eq!(run.spec_str("image"), Some("run-image"));
    assert_eq!(run.spec["args"], serde_json::json!(["--task"]));
    assert_eq!(run.spec_str("command"), Some("function-command"));
    assert_eq!(run.spec["backoff_limit"], serde_json::json!(2));

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handle_has_no_multi_hop_path() {
    let ctx = TestContext::new();
    let plane = ctx.start().await;
    let run = ctx
        .entities
        .save(&Entity::new(EntityType::Run, "demo", "container", "fresh"))
        .await
        .unwrap();

    let err = plane
        .runs()
        .handle(&run, State::Running, None)
        .await
        .unwrap_err();

    assert!(err.is_invalid_transition(), "{err}");
    let stored = ctx.stored(&run.id).await.unwrap();
    assert_eq!(stored.state().unwrap(), State::Created);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_kinds_name_the_kind() {
    let ctx = TestContext::new();
    let plane = ctx.start().await;

    let mut request = container_request("busybox");
    request.kind = "spark".into();
    let err = plane.runs().create(request).await.unwrap_err();
    assert!(matches!(err, Error::UnknownKind { registry: "runtime", .. }));
    assert_eq!(err.error_code(), "UNKNOWN_KIND");
    assert!(err.to_string().contains("spark"));

    let mut request = container_request("busybox");
    request.run.task = "notebook".into();
    let err = plane.runs().create(request).await.unwrap_err();
    assert!(err.to_string().contains("notebook"), "{err}");

    let err = plane.frameworks().get("slurm").err().unwrap();
    assert!(matches!(err, Error::UnknownKind { registry: "framework", .. }));
    assert!(err.to_string().contains("slurm"));

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delete_remote_run_tears_down_once() {
    let ctx = TestContext::new();
    let plane = ctx.start().await;
    let run = plane.runs().create(container_request("busybox")).await.unwrap();
    plane.runs().run(&run.id).await.unwrap();

    let deleted = plane.runs().delete(&run.id).await.unwrap();

    assert_eq!(deleted.state().unwrap(), State::Deleted);
    assert_eq!(ctx.cluster.calls("delete"), 1);
    assert!(ctx.stored(&run.id).await.is_none());
    assert!(ctx.runnables.find(&run.id).await.unwrap().is_none());

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_local_run_never_reaches_backend() {
    let ctx = TestContext::new();
    let plane = ctx.start().await;
    let run = plane.runs().create(local_request("busybox")).await.unwrap();

    let run = plane.runs().run(&run.id).await.unwrap();
    assert_eq!(run.state().unwrap(), State::Ready);

    let deleted = plane.runs().delete(&run.id).await.unwrap();

    assert_eq!(deleted.state().unwrap(), State::Deleted);
    assert_eq!(ctx.cluster.calls("apply"), 0);
    assert_eq!(ctx.cluster.calls("delete"), 0);
    assert!(ctx.runnables.find(&run.id).await.unwrap().is_none());

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delete_before_run_needs_no_backend() {
    let ctx = TestContext::new();
    let plane = ctx.start().await;
    let run = plane.runs().create(container_request("busybox")).await.unwrap();

    let deleted = plane.runs().delete(&run.id).await.unwrap();

    assert_eq!(deleted.state().unwrap(), State::Deleted);
    assert_eq!(ctx.cluster.calls("delete"), 0);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_secrets_are_grouped_on_the_runnable() {
    let ctx = TestContext::new();
    ctx.secrets.insert("demo", "warehouse", ["user", "password"]);
    let plane = ctx.start().await;

    let mut request = container_request("busybox");
    request.run.secrets = Some(vec!["warehouse".into()]);
    let run = plane.runs().create(request).await.unwrap();
    plane.runs().run(&run.id).await.unwrap();

    let runnable = ctx.runnables.find(&run.id).await.unwrap().unwrap();
    let keys: Vec<&str> = runnable.secrets["warehouse"]
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(keys, vec!["password", "user"]);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_secret_keeps_run_built() {
    let ctx = TestContext::new();
    let plane = ctx.start().await;

    let mut request = container_request("busybox");
    request.run.secrets = Some(vec!["missing".into()]);
    let run = plane.runs().create(request).await.unwrap();

    assert!(plane.runs().run(&run.id).await.is_err());

    let stored = ctx.stored(&run.id).await.unwrap();
    assert_eq!(stored.state().unwrap(), State::Built);
    assert_eq!(ctx.cluster.calls("apply"), 0);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_then_resume_resubmits() {
    let ctx = TestContext::new();
    let plane = ctx.start().await;
    let run = plane.runs().create(container_request("busybox")).await.unwrap();
    plane.runs().run(&run.id).await.unwrap();

    let stopped = plane.runs().stop(&run.id).await.unwrap();
    assert_eq!(stopped.state().unwrap(), State::Stopped);
    assert!(
        ctx.cluster
            .resource("Job", common::NAMESPACE, &job_name(&run.id))
            .is_none()
    );

    let resumed = plane.runs().resume(&run.id).await.unwrap();
    assert_eq!(resumed.state().unwrap(), State::Resume);
    assert!(
        ctx.cluster
            .resource("Job", common::NAMESPACE, &job_name(&run.id))
            .is_some()
    );

    plane.shutdown().await.unwrap();
}
