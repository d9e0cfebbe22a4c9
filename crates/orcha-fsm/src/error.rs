// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for orcha-fsm.
//!
//! States and events are carried as their display strings so the error type
//! stays independent of the machine's type parameters.

use thiserror::Error;

/// Boxed error returned by transition side-effect logic.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Engine errors.
///
/// Every variant except [`FsmError::Logic`] is a permanent domain failure:
/// retrying the same call against the same table cannot succeed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FsmError {
    /// No transition leaves `from` on `event`.
    #[error("no transition from state {from} on event {event}")]
    InvalidEvent {
        /// Current state of the instance.
        from: String,
        /// Event that was applied.
        event: String,
    },

    /// No transition leads from `from` to `to`.
    #[error("no transition from state {from} to state {to}")]
    InvalidTarget {
        /// Current state of the instance.
        from: String,
        /// Requested target state.
        to: String,
    },

    /// More than one transition leads from `from` to `to`.
    #[error("ambiguous target {to} from state {from}: reachable via events {events:?}")]
    AmbiguousTarget {
        /// Current state of the instance.
        from: String,
        /// Requested target state.
        to: String,
        /// Events whose transitions share the target.
        events: Vec<String>,
    },

    /// The starting state is not declared in the table.
    #[error("unknown state {0}")]
    UnknownState(String),

    /// Two contributors declared a transition for the same state and event.
    #[error("duplicate transition from state {state} on event {event}")]
    DuplicateTransition {
        /// Source state.
        state: String,
        /// Event declared twice.
        event: String,
    },

    /// A transition targets a state that the table never declares.
    #[error("transition from {from} on {event} targets undeclared state {to}")]
    UndeclaredTarget {
        /// Source state.
        from: String,
        /// Event of the offending transition.
        event: String,
        /// Target that has no entry in the table.
        to: String,
    },

    /// Side-effect logic failed; the instance did not move.
    #[error("transition {from} -> {to} on {event} failed: {source}")]
    Logic {
        /// Current state of the instance.
        from: String,
        /// Target of the failed transition.
        to: String,
        /// Event that triggered it.
        event: String,
        /// Error returned by the logic.
        #[source]
        source: BoxError,
    },
}

impl FsmError {
    /// True when no edge matched the request (as opposed to a logic failure
    /// or a malformed table).
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            FsmError::InvalidEvent { .. }
                | FsmError::InvalidTarget { .. }
                | FsmError::AmbiguousTarget { .. }
                | FsmError::UnknownState(_)
        )
    }
}
