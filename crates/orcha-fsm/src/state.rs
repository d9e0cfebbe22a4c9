// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Source states, transitions and side-effect logic.

use std::fmt;
use std::sync::Arc;

use crate::error::BoxError;

/// What a side-effect logic sees of the transition being taken.
#[derive(Debug)]
pub struct Step<'a, S, E, I> {
    /// State the instance is leaving.
    pub from: &'a S,
    /// State the instance moves to if the logic succeeds.
    pub to: &'a S,
    /// Event that selected the transition.
    pub event: &'a E,
    /// Optional caller-supplied input.
    pub input: Option<&'a I>,
}

/// Side-effect logic attached to a transition.
///
/// Receives the step and the instance's bound context. It may mutate the
/// context and return an output for the caller; it has no handle on the
/// machine, so it cannot fire a second transition.
pub type TransitionLogic<S, E, C, I, O> =
    Arc<dyn Fn(&Step<'_, S, E, I>, &mut C) -> Result<Option<O>, BoxError> + Send + Sync>;

/// One outgoing edge of a source state.
pub struct Transition<S, E, C, I, O> {
    event: E,
    target: S,
    logic: Option<TransitionLogic<S, E, C, I, O>>,
}

impl<S, E, C, I, O> Transition<S, E, C, I, O> {
    /// Create an edge without side-effect logic.
    pub fn new(event: E, target: S) -> Self {
        Self {
            event,
            target,
            logic: None,
        }
    }

    /// Attach side-effect logic, replacing any previous one.
    pub fn with_logic<F>(mut self, logic: F) -> Self
    where
        F: Fn(&Step<'_, S, E, I>, &mut C) -> Result<Option<O>, BoxError> + Send + Sync + 'static,
    {
        self.logic = Some(Arc::new(logic));
        self
    }

    /// Attach shared logic, e.g. one closure reused by several edges.
    pub fn with_shared_logic(mut self, logic: TransitionLogic<S, E, C, I, O>) -> Self {
        self.logic = Some(logic);
        self
    }

    /// Event name of this edge.
    pub fn event(&self) -> &E {
        &self.event
    }

    /// Target state of this edge.
    pub fn target(&self) -> &S {
        &self.target
    }

    pub(crate) fn logic(&self) -> Option<&TransitionLogic<S, E, C, I, O>> {
        self.logic.as_ref()
    }
}

impl<S: Clone, E: Clone, C, I, O> Clone for Transition<S, E, C, I, O> {
    fn clone(&self) -> Self {
        Self {
            event: self.event.clone(),
            target: self.target.clone(),
            logic: self.logic.clone(),
        }
    }
}

impl<S: fmt::Display, E: fmt::Display, C, I, O> fmt::Debug for Transition<S, E, C, I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("event", &self.event.to_string())
            .field("target", &self.target.to_string())
            .field("has_logic", &self.logic.is_some())
            .finish()
    }
}

/// A source state and its outgoing transitions.
///
/// A contributor may return an `FsmState` with no transitions at all; that
/// still declares the state (terminal states are declared this way).
pub struct FsmState<S, E, C, I, O> {
    state: S,
    transitions: Vec<Transition<S, E, C, I, O>>,
}

impl<S, E, C, I, O> FsmState<S, E, C, I, O> {
    /// Declare `state` with no outgoing transitions.
    pub fn new(state: S) -> Self {
        Self {
            state,
            transitions: Vec::new(),
        }
    }

    /// Append an outgoing transition.
    pub fn transition(mut self, transition: Transition<S, E, C, I, O>) -> Self {
        self.transitions.push(transition);
        self
    }

    /// The source state.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Outgoing transitions in declaration order.
    pub fn transitions(&self) -> &[Transition<S, E, C, I, O>] {
        &self.transitions
    }

    pub(crate) fn into_parts(self) -> (S, Vec<Transition<S, E, C, I, O>>) {
        (self.state, self.transitions)
    }
}

impl<S, E: PartialEq, C, I, O> FsmState<S, E, C, I, O> {
    /// The transition fired by `event`, if any.
    pub fn transition_for_event(&self, event: &E) -> Option<&Transition<S, E, C, I, O>> {
        self.transitions.iter().find(|t| t.event == *event)
    }
}

impl<S: PartialEq, E, C, I, O> FsmState<S, E, C, I, O> {
    /// Every transition whose target is `target`.
    pub fn transitions_to<'a>(
        &'a self,
        target: &S,
    ) -> impl Iterator<Item = &'a Transition<S, E, C, I, O>> {
        self.transitions.iter().filter(move |t| t.target == *target)
    }
}

impl<S: Clone, E: Clone, C, I, O> Clone for FsmState<S, E, C, I, O> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            transitions: self.transitions.clone(),
        }
    }
}

impl<S: fmt::Display, E: fmt::Display, C, I, O> fmt::Debug for FsmState<S, E, C, I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsmState")
            .field("state", &self.state.to_string())
            .field("transitions", &self.transitions)
            .finish()
    }
}
