// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run transition table.
//!
//! ```text
//! CREATED --BUILD--> BUILT --RUN--> READY --SCHEDULE--> PENDING
//!                                     |                    |
//!                                     +------EXECUTE-------+--> RUNNING --COMPLETE--> COMPLETED
//!                                                                 |  ^
//!                                                                 +--+ LOOP
//! READY|PENDING|RUNNING --STOP--> STOP --STOP--> STOPPED --RESUME--> RESUME --EXECUTE--> RUNNING
//! any live state --ERROR--> ERROR
//! any state but DELETING|DELETED --DELETE--> DELETING --DELETE--> DELETED
//! ```
//!
//! Logic reads the runtime's callbacks into status and returns the command
//! the owning framework must execute. Runs marked `local_execution` never
//! produce a command and never run a callback.

use std::sync::Arc;

use orcha_fsm::{BoxError, Transition};
use serde_json::Value;

use super::{EntityFsmState, LifecycleManager};
use crate::entity::{Entity, StatusFragment};
use crate::runnable::{Runnable, RunnableCommand};
use crate::runtime::Runtime;
use crate::state::{Event, State};

/// One source state of the run table.
pub type RunFsmState = EntityFsmState<Runnable, RunnableCommand>;
/// Lifecycle manager for runs of one kind.
pub type RunLifecycleManager = LifecycleManager<Runnable, RunnableCommand>;

type RunTransition = Transition<State, Event, Entity, Runnable, RunnableCommand>;
type LogicResult = Result<Option<RunnableCommand>, BoxError>;

fn is_local(run: &Entity) -> bool {
    run.spec
        .get("local_execution")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn merge(run: &mut Entity, fragment: Option<StatusFragment>) {
    if let Some(fragment) = fragment {
        run.merge_status(fragment);
    }
}

/// Edge whose logic is skipped for local runs.
fn edge<F>(event: Event, target: State, runtime: &Arc<dyn Runtime>, logic: F) -> RunTransition
where
    F: Fn(&dyn Runtime, Option<&Runnable>, &mut Entity) -> LogicResult + Send + Sync + 'static,
{
    let runtime = runtime.clone();
    Transition::new(event, target).with_logic(move |step, run: &mut Entity| {
        if is_local(run) {
            return Ok(None);
        }
        logic(runtime.as_ref(), step.input, run)
    })
}

fn to_ready(runtime: &dyn Runtime, runnable: Option<&Runnable>, run: &mut Entity) -> LogicResult {
    let runnable = runnable.ok_or_else(|| format!("run {} has no runnable to submit", run.id))?;
    let fragment = runtime.on_ready(run, Some(runnable));
    merge(run, fragment);
    Ok(Some(RunnableCommand::Submit(runnable.clone())))
}

fn to_running(runtime: &dyn Runtime, runnable: Option<&Runnable>, run: &mut Entity) -> LogicResult {
    let fragment = runtime.on_running(run, runnable);
    merge(run, fragment);
    Ok(None)
}

fn to_completed(
    runtime: &dyn Runtime,
    runnable: Option<&Runnable>,
    run: &mut Entity,
) -> LogicResult {
    let fragment = runtime.on_complete(run, runnable);
    merge(run, fragment);
    Ok(runnable
        .and_then(|r| runtime.delete(r))
        .map(RunnableCommand::Delete))
}

fn to_error(runtime: &dyn Runtime, runnable: Option<&Runnable>, run: &mut Entity) -> LogicResult {
    let fragment = runtime.on_error(run, runnable);
    merge(run, fragment);
    Ok(runnable
        .and_then(|r| runtime.delete(r))
        .map(RunnableCommand::Delete))
}

fn to_stop(runtime: &dyn Runtime, runnable: Option<&Runnable>, _run: &mut Entity) -> LogicResult {
    Ok(runnable
        .and_then(|r| runtime.stop(r))
        .map(RunnableCommand::Stop))
}

fn to_stopped(runtime: &dyn Runtime, runnable: Option<&Runnable>, run: &mut Entity) -> LogicResult {
    let fragment = runtime.on_stopped(run, runnable);
    merge(run, fragment);
    Ok(None)
}

fn to_resume(runtime: &dyn Runtime, runnable: Option<&Runnable>, _run: &mut Entity) -> LogicResult {
    Ok(runnable
        .and_then(|r| runtime.resume(r))
        .map(RunnableCommand::Resume))
}

fn to_deleting(
    runtime: &dyn Runtime,
    runnable: Option<&Runnable>,
    _run: &mut Entity,
) -> LogicResult {
    Ok(runnable
        .and_then(|r| runtime.delete(r))
        .map(RunnableCommand::Delete))
}

fn to_deleted(runtime: &dyn Runtime, runnable: Option<&Runnable>, run: &mut Entity) -> LogicResult {
    let fragment = runtime.on_deleted(run, runnable);
    merge(run, fragment);
    Ok(None)
}

/// Run table wired to `runtime`'s callbacks.
pub fn run_states(runtime: Arc<dyn Runtime>) -> Vec<RunFsmState> {
    let rt = &runtime;
    let error = || edge(Event::Error, State::Error, rt, to_error);
    let delete = || edge(Event::Delete, State::Deleting, rt, to_deleting);
    let stop = || edge(Event::Stop, State::Stop, rt, to_stop);
    let execute = || edge(Event::Execute, State::Running, rt, to_running);

    vec![
        RunFsmState::new(State::Created)
            .transition(Transition::new(Event::Build, State::Built))
            .transition(error())
            .transition(delete()),
        RunFsmState::new(State::Built)
            .transition(edge(Event::Run, State::Ready, rt, to_ready))
            .transition(error())
            .transition(delete()),
        RunFsmState::new(State::Ready)
            .transition(Transition::new(Event::Schedule, State::Pending))
            .transition(execute())
            .transition(stop())
            .transition(error())
            .transition(delete()),
        RunFsmState::new(State::Pending)
            .transition(execute())
            .transition(stop())
            .transition(error())
            .transition(delete()),
        RunFsmState::new(State::Running)
            .transition(Transition::new(Event::Loop, State::Running))
            .transition(edge(Event::Complete, State::Completed, rt, to_completed))
            .transition(stop())
            .transition(error())
            .transition(delete()),
        RunFsmState::new(State::Stop)
            .transition(edge(Event::Stop, State::Stopped, rt, to_stopped))
            .transition(error())
            .transition(delete()),
        RunFsmState::new(State::Stopped)
            .transition(edge(Event::Resume, State::Resume, rt, to_resume))
            .transition(error())
            .transition(delete()),
        RunFsmState::new(State::Resume)
            .transition(execute())
            .transition(error())
            .transition(delete()),
        RunFsmState::new(State::Completed).transition(delete()),
        RunFsmState::new(State::Error).transition(delete()),
        RunFsmState::new(State::Deleting)
            .transition(edge(Event::Delete, State::Deleted, rt, to_deleted)),
        RunFsmState::new(State::Deleted),
    ]
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::entity::EntityType;
    use crate::framework::ids;
    use crate::runtime::container_runtime;
    use crate::spec::RunSpec;
    use crate::store::MemoryEntityStore;

    fn manager() -> RunLifecycleManager {
        let runtime: Arc<dyn Runtime> = Arc::new(container_runtime(&Config::default()));
        LifecycleManager::builder(EntityType::Run, Arc::new(MemoryEntityStore::new()))
            .states(run_states(runtime))
            .build()
            .unwrap()
    }

    fn run_at(state: State, local: bool) -> Entity {
        let mut spec = RunSpec::new("job");
        spec.image = Some("busybox".into());
        spec.local_execution = local;
        let mut run = Entity::new(EntityType::Run, "demo", "container", "r")
            .with_spec(spec.to_map().unwrap());
        run.set_state(state);
        run
    }

    fn runnable(run: &Entity) -> Runnable {
        Runnable::new(&run.id, ids::K8S_JOB, "container", "job", "demo")
            .with_state(State::Running, "running")
    }

    #[test]
    fn test_no_edge_enters_created() {
        let manager = manager();
        for state in manager.states() {
            assert!(!manager.has_transition(state, State::Created), "{state}");
        }
    }

    #[test]
    fn test_created_to_running_is_not_one_hop() {
        let manager = manager();
        let run = run_at(State::Created, false);

        let err = manager
            .prepare_handle(&run, State::Running, None)
            .unwrap_err();

        assert!(err.is_invalid_transition());
        assert_eq!(err.error_code(), "INVALID_TRANSITION");
    }

    #[test]
    fn test_run_requires_runnable() {
        let manager = manager();
        let run = run_at(State::Built, false);

        let err = manager.prepare_perform(&run, Event::Run, None).unwrap_err();

        assert_eq!(err.error_code(), "TRANSITION_FAILED");
    }

    #[test]
    fn test_run_submits_runnable() {
        let manager = manager();
        let run = run_at(State::Built, false);
        let runnable = Runnable::new(&run.id, ids::K8S_JOB, "container", "job", "demo");

        let step = manager
            .prepare_perform(&run, Event::Run, Some(&runnable))
            .unwrap();

        assert_eq!(step.to, State::Ready);
        assert_eq!(step.output, Some(RunnableCommand::Submit(runnable)));
    }

    #[test]
    fn test_completion_requests_cleanup() {
        let manager = manager();
        let run = run_at(State::Running, false);
        let runnable = runnable(&run);

        let step = manager
            .prepare_handle(&run, State::Completed, Some(&runnable))
            .unwrap();

        assert!(step.entity.status.contains_key("finished_at"));
        match step.output {
            Some(RunnableCommand::Delete(r)) => assert_eq!(r.state, State::Deleting),
            other => panic!("expected delete command, got {other:?}"),
        }
    }

    #[test]
    fn test_local_run_never_produces_commands() {
        let manager = manager();
        let run = run_at(State::Running, true);
        let runnable = runnable(&run);

        let completed = manager
            .prepare_handle(&run, State::Completed, Some(&runnable))
            .unwrap();
        assert!(completed.output.is_none());
        assert!(!completed.entity.status.contains_key("finished_at"));

        let deleting = manager
            .prepare_perform(&run, Event::Delete, Some(&runnable))
            .unwrap();
        assert_eq!(deleting.to, State::Deleting);
        assert!(deleting.output.is_none());
    }

    #[test]
    fn test_stop_then_stopped_is_two_hops() {
        let manager = manager();
        let run = run_at(State::Running, false);
        let runnable = runnable(&run);

        let stop = manager
            .prepare_perform(&run, Event::Stop, Some(&runnable))
            .unwrap();
        assert!(matches!(stop.output, Some(RunnableCommand::Stop(_))));

        assert!(manager.has_transition(State::Stop, State::Stopped));
        assert!(!manager.has_transition(State::Running, State::Stopped));
    }
}
