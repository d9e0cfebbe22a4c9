// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Frozen transition tables.
//!
//! [`FsmFactoryBuilder`] collects [`FsmState`]s from any number of
//! contributors and [`FsmFactoryBuilder::build`] merges them by state name.
//! The resulting [`FsmFactory`] is immutable and can be shared across tasks
//! without synchronization.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use tracing::{debug, warn};

use crate::error::FsmError;
use crate::machine::Fsm;
use crate::state::{FsmState, Transition};

/// Something that contributes states to a table.
///
/// Base lifecycles and optional plugins implement this; the factory builder
/// accepts any number of them.
pub trait StateBuilder<S, E, C, I, O> {
    /// States (with transitions) contributed to the table.
    fn states(&self) -> Vec<FsmState<S, E, C, I, O>>;
}

impl<S, E, C, I, O, F> StateBuilder<S, E, C, I, O> for F
where
    F: Fn() -> Vec<FsmState<S, E, C, I, O>>,
{
    fn states(&self) -> Vec<FsmState<S, E, C, I, O>> {
        self()
    }
}

/// Collects contributed states before the table is frozen.
pub struct FsmFactoryBuilder<S, E, C, I, O> {
    states: Vec<FsmState<S, E, C, I, O>>,
}

impl<S, E, C, I, O> Default for FsmFactoryBuilder<S, E, C, I, O> {
    fn default() -> Self {
        Self { states: Vec::new() }
    }
}

impl<S, E, C, I, O> FsmFactoryBuilder<S, E, C, I, O>
where
    S: Clone + Eq + Hash + fmt::Display,
    E: Clone + Eq + fmt::Display,
{
    /// Add one state.
    pub fn state(mut self, state: FsmState<S, E, C, I, O>) -> Self {
        self.states.push(state);
        self
    }

    /// Add several states.
    pub fn states(mut self, states: impl IntoIterator<Item = FsmState<S, E, C, I, O>>) -> Self {
        self.states.extend(states);
        self
    }

    /// Add everything a contributor declares.
    pub fn contribute(self, builder: &dyn StateBuilder<S, E, C, I, O>) -> Self {
        self.states(builder.states())
    }

    /// Merge contributions per state and freeze the table.
    ///
    /// Transition lists for the same state are concatenated in contribution
    /// order. Fails on a repeated (state, event) pair or on a transition whose
    /// target is never declared as a state.
    pub fn build(self) -> Result<FsmFactory<S, E, C, I, O>, FsmError> {
        let mut order: Vec<S> = Vec::new();
        let mut merged: HashMap<S, Vec<Transition<S, E, C, I, O>>> = HashMap::new();

        for fsm_state in self.states {
            let (state, transitions) = fsm_state.into_parts();
            let entry = merged.entry(state.clone()).or_insert_with(|| {
                order.push(state.clone());
                Vec::new()
            });
            for transition in transitions {
                if entry.iter().any(|t| t.event() == transition.event()) {
                    return Err(FsmError::DuplicateTransition {
                        state: state.to_string(),
                        event: transition.event().to_string(),
                    });
                }
                entry.push(transition);
            }
        }

        for (state, transitions) in &merged {
            for transition in transitions {
                if !merged.contains_key(transition.target()) {
                    return Err(FsmError::UndeclaredTarget {
                        from: state.to_string(),
                        event: transition.event().to_string(),
                        to: transition.target().to_string(),
                    });
                }
                let sharing = transitions
                    .iter()
                    .filter(|t| t.target() == transition.target())
                    .count();
                if sharing > 1 && transition.target() != state {
                    warn!(
                        state = %state,
                        target = %transition.target(),
                        "Several events share one target; go_to_state will refuse it"
                    );
                }
            }
        }

        let table = order
            .into_iter()
            .filter_map(|state| {
                let transitions = merged.remove(&state)?;
                let fsm_state = transitions
                    .into_iter()
                    .fold(FsmState::new(state.clone()), FsmState::transition);
                Some((state, fsm_state))
            })
            .collect::<Vec<_>>();

        debug!(states = table.len(), "FSM table built");

        Ok(FsmFactory {
            index: table
                .iter()
                .enumerate()
                .map(|(i, (s, _))| (s.clone(), i))
                .collect(),
            table: table.into_iter().map(|(_, fsm_state)| fsm_state).collect(),
        })
    }
}

/// An immutable transition table that creates machine instances.
pub struct FsmFactory<S, E, C, I, O> {
    table: Vec<FsmState<S, E, C, I, O>>,
    index: HashMap<S, usize>,
}

impl<S, E, C, I, O> FsmFactory<S, E, C, I, O>
where
    S: Clone + Eq + Hash + fmt::Display,
    E: Clone + Eq + fmt::Display,
{
    /// Start collecting contributions.
    pub fn builder() -> FsmFactoryBuilder<S, E, C, I, O> {
        FsmFactoryBuilder::default()
    }

    /// Create an instance positioned at `start` and bound to `context`.
    pub fn create(&self, start: S, context: C) -> Result<Fsm<'_, S, E, C, I, O>, FsmError> {
        if !self.index.contains_key(&start) {
            return Err(FsmError::UnknownState(start.to_string()));
        }
        Ok(Fsm::new(self, start, context))
    }

    /// The merged entry for `state`.
    pub fn state(&self, state: &S) -> Option<&FsmState<S, E, C, I, O>> {
        self.index.get(state).map(|&i| &self.table[i])
    }

    /// Declared states, in first-contribution order.
    pub fn states(&self) -> impl Iterator<Item = &S> {
        self.table.iter().map(FsmState::state)
    }

    /// Whether `state` is declared.
    pub fn contains(&self, state: &S) -> bool {
        self.index.contains_key(state)
    }

    /// Whether some single transition leads from `from` to `to`.
    pub fn has_transition(&self, from: &S, to: &S) -> bool {
        self.state(from)
            .is_some_and(|s| s.transitions_to(to).next().is_some())
    }

    /// Whether `event` is accepted in `from`.
    pub fn accepts(&self, from: &S, event: &E) -> bool {
        self.state(from)
            .is_some_and(|s| s.transition_for_event(event).is_some())
    }
}

impl<S: fmt::Display, E: fmt::Display, C, I, O> fmt::Debug for FsmFactory<S, E, C, I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.table.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Factory = FsmFactory<&'static str, &'static str, (), (), ()>;
    type State = FsmState<&'static str, &'static str, (), (), ()>;

    fn base() -> Vec<State> {
        vec![
            FsmState::new("CREATED")
                .transition(Transition::new("UPLOAD", "UPLOADING"))
                .transition(Transition::new("DELETE", "DELETED")),
            FsmState::new("UPLOADING").transition(Transition::new("READY", "READY")),
            FsmState::new("READY"),
            FsmState::new("DELETED"),
        ]
    }

    #[test]
    fn test_build_merges_contributions_per_state() {
        let plugin = || vec![State::new("READY").transition(Transition::new("UPDATE", "READY"))];

        let factory = Factory::builder()
            .states(base())
            .contribute(&plugin)
            .build()
            .unwrap();

        assert!(factory.accepts(&"READY", &"UPDATE"));
        assert!(factory.accepts(&"CREATED", &"UPLOAD"));
        assert_eq!(factory.states().count(), 4);
    }

    #[test]
    fn test_build_keeps_contribution_order() {
        let plugin = || {
            vec![State::new("CREATED").transition(Transition::new("UPDATE", "CREATED"))]
        };
        let factory = Factory::builder()
            .states(base())
            .contribute(&plugin)
            .build()
            .unwrap();

        let events: Vec<_> = factory
            .state(&"CREATED")
            .unwrap()
            .transitions()
            .iter()
            .map(|t| *t.event())
            .collect();
        assert_eq!(events, vec!["UPLOAD", "DELETE", "UPDATE"]);
    }

    #[test]
    fn test_build_rejects_duplicate_event() {
        let plugin = || vec![State::new("CREATED").transition(Transition::new("UPLOAD", "READY"))];

        let err = Factory::builder()
            .states(base())
            .contribute(&plugin)
            .build()
            .unwrap_err();

        match err {
            FsmError::DuplicateTransition { state, event } => {
                assert_eq!(state, "CREATED");
                assert_eq!(event, "UPLOAD");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_build_rejects_undeclared_target() {
        let err = Factory::builder()
            .state(State::new("CREATED").transition(Transition::new("BUILD", "BUILT")))
            .build()
            .unwrap_err();

        assert!(matches!(err, FsmError::UndeclaredTarget { .. }));
    }

    #[test]
    fn test_create_rejects_unknown_start() {
        let factory = Factory::builder().states(base()).build().unwrap();
        let err = factory.create("RUNNING", ()).unwrap_err();
        assert!(err.is_invalid_transition());
    }

    #[test]
    fn test_has_transition() {
        let factory = Factory::builder().states(base()).build().unwrap();
        assert!(factory.has_transition(&"CREATED", &"UPLOADING"));
        assert!(!factory.has_transition(&"CREATED", &"READY"));
        assert!(!factory.has_transition(&"MISSING", &"READY"));
    }
}
