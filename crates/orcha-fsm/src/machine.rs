// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Short-lived machine instances.

use std::fmt;
use std::hash::Hash;

use tracing::trace;

use crate::error::FsmError;
use crate::factory::FsmFactory;
use crate::state::{Step, Transition};

/// A machine positioned at one state and bound to a context.
///
/// The instance only moves when a transition's logic returns `Ok`; on any
/// error the current state and the context are left as the logic left them
/// and the state is unchanged.
pub struct Fsm<'f, S, E, C, I, O> {
    factory: &'f FsmFactory<S, E, C, I, O>,
    current: S,
    context: C,
}

impl<'f, S, E, C, I, O> Fsm<'f, S, E, C, I, O>
where
    S: Clone + Eq + Hash + fmt::Display,
    E: Clone + Eq + fmt::Display,
{
    pub(crate) fn new(factory: &'f FsmFactory<S, E, C, I, O>, current: S, context: C) -> Self {
        Self {
            factory,
            current,
            context,
        }
    }

    /// State the instance is at.
    pub fn current_state(&self) -> &S {
        &self.current
    }

    /// The bound context.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Release the context, consuming the instance.
    pub fn into_context(self) -> C {
        self.context
    }

    /// Fire `event` from the current state.
    pub fn apply_event(&mut self, event: &E, input: Option<&I>) -> Result<Option<O>, FsmError> {
        let transition = self
            .factory
            .state(&self.current)
            .and_then(|s| s.transition_for_event(event))
            .ok_or_else(|| FsmError::InvalidEvent {
                from: self.current.to_string(),
                event: event.to_string(),
            })?;
        self.fire(transition, input)
    }

    /// Move to `target` through the single transition that leads there.
    ///
    /// Already being at `target` is a successful no-op that runs no logic.
    /// Zero matching transitions is [`FsmError::InvalidTarget`]; more than one
    /// is [`FsmError::AmbiguousTarget`], since the instance cannot tell which
    /// event the caller meant.
    pub fn go_to_state(&mut self, target: &S, input: Option<&I>) -> Result<Option<O>, FsmError> {
        if self.current == *target {
            trace!(state = %target, "Already at target state");
            return Ok(None);
        }

        let candidates: Vec<&'f Transition<S, E, C, I, O>> = self
            .factory
            .state(&self.current)
            .map(|s| s.transitions_to(target).collect())
            .unwrap_or_default();

        match candidates.as_slice() {
            [] => Err(FsmError::InvalidTarget {
                from: self.current.to_string(),
                to: target.to_string(),
            }),
            [transition] => {
                let transition = *transition;
                self.fire(transition, input)
            }
            many => Err(FsmError::AmbiguousTarget {
                from: self.current.to_string(),
                to: target.to_string(),
                events: many.iter().map(|t| t.event().to_string()).collect(),
            }),
        }
    }

    fn fire(
        &mut self,
        transition: &'f Transition<S, E, C, I, O>,
        input: Option<&I>,
    ) -> Result<Option<O>, FsmError> {
        let output = match transition.logic() {
            Some(logic) => {
                let step = Step {
                    from: &self.current,
                    to: transition.target(),
                    event: transition.event(),
                    input,
                };
                logic(&step, &mut self.context).map_err(|source| FsmError::Logic {
                    from: self.current.to_string(),
                    to: transition.target().to_string(),
                    event: transition.event().to_string(),
                    source,
                })?
            }
            None => None,
        };

        trace!(
            from = %self.current,
            to = %transition.target(),
            event = %transition.event(),
            "Transition applied"
        );
        self.current = transition.target().clone();
        Ok(output)
    }
}

impl<S: fmt::Display, E, C, I, O> fmt::Debug for Fsm<'_, S, E, C, I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fsm")
            .field("current", &self.current.to_string())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use crate::{FsmFactory, FsmState, Transition};

    type Factory = FsmFactory<&'static str, &'static str, Vec<String>, u32, String>;

    fn record(
        step: &crate::Step<'_, &'static str, &'static str, u32>,
        log: &mut Vec<String>,
    ) -> Result<Option<String>, crate::BoxError> {
        log.push(format!("{}:{}->{}", step.event, step.from, step.to));
        Ok(step.input.map(|n| format!("input {n}")))
    }

    fn factory() -> Factory {
        Factory::builder()
            .state(
                FsmState::new("READY")
                    .transition(Transition::new("EXECUTE", "RUNNING").with_logic(record))
                    .transition(Transition::new("STOP", "STOP").with_logic(record)),
            )
            .state(
                FsmState::new("RUNNING")
                    .transition(Transition::new("LOOP", "RUNNING").with_logic(record))
                    .transition(Transition::new("COMPLETE", "COMPLETED").with_logic(record))
                    .transition(Transition::new("FAIL", "ERROR").with_logic(|_, _| {
                        Err(io::Error::other("backend refused").into())
                    })),
            )
            .state(FsmState::new("STOP"))
            .state(FsmState::new("COMPLETED"))
            .state(FsmState::new("ERROR"))
            .state(
                FsmState::new("FORK")
                    .transition(Transition::new("LEFT", "COMPLETED"))
                    .transition(Transition::new("RIGHT", "COMPLETED")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_apply_event_runs_logic_and_moves() {
        let factory = factory();
        let mut fsm = factory.create("READY", Vec::new()).unwrap();

        let output = fsm.apply_event(&"EXECUTE", Some(&7)).unwrap();

        assert_eq!(output.as_deref(), Some("input 7"));
        assert_eq!(*fsm.current_state(), "RUNNING");
        assert_eq!(fsm.into_context(), vec!["EXECUTE:READY->RUNNING"]);
    }

    #[test]
    fn test_apply_event_without_edge_fails_and_stays() {
        let factory = factory();
        let mut fsm = factory.create("READY", Vec::new()).unwrap();

        let err = fsm.apply_event(&"COMPLETE", None).unwrap_err();

        assert!(err.is_invalid_transition());
        assert_eq!(*fsm.current_state(), "READY");
        assert!(fsm.context().is_empty());
    }

    #[test]
    fn test_logic_error_keeps_state() {
        let factory = factory();
        let mut fsm = factory.create("RUNNING", Vec::new()).unwrap();

        let err = fsm.apply_event(&"FAIL", None).unwrap_err();

        assert!(!err.is_invalid_transition());
        assert!(err.to_string().contains("backend refused"));
        assert_eq!(*fsm.current_state(), "RUNNING");
    }

    #[test]
    fn test_go_to_state_fires_unique_edge() {
        let factory = factory();
        let mut fsm = factory.create("RUNNING", Vec::new()).unwrap();

        fsm.go_to_state(&"COMPLETED", None).unwrap();

        assert_eq!(*fsm.current_state(), "COMPLETED");
        assert_eq!(fsm.into_context(), vec!["COMPLETE:RUNNING->COMPLETED"]);
    }

    #[test]
    fn test_go_to_state_same_state_is_noop() {
        let factory = factory();
        let mut fsm = factory.create("RUNNING", Vec::new()).unwrap();

        let output = fsm.go_to_state(&"RUNNING", Some(&1)).unwrap();

        assert!(output.is_none());
        assert!(fsm.context().is_empty(), "self-loop logic must not run");
    }

    #[test]
    fn test_go_to_state_without_edge_fails() {
        let factory = factory();
        let mut fsm = factory.create("READY", Vec::new()).unwrap();

        let err = fsm.go_to_state(&"COMPLETED", None).unwrap_err();

        assert!(matches!(err, crate::FsmError::InvalidTarget { .. }));
        assert_eq!(*fsm.current_state(), "READY");
    }

    #[test]
    fn test_go_to_state_ambiguous_fails() {
        let factory = factory();
        let mut fsm = factory.create("FORK", Vec::new()).unwrap();

        let err = fsm.go_to_state(&"COMPLETED", None).unwrap_err();

        match err {
            crate::FsmError::AmbiguousTarget { events, .. } => {
                assert_eq!(events, vec!["LEFT", "RIGHT"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*fsm.current_state(), "FORK");
    }
}
