// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orcha FSM - Generic Finite-State-Machine Engine
//!
//! This crate provides the transition-table engine every orcha lifecycle is
//! built on. It knows nothing about entities, runs or backends: states,
//! events, the bound context, the optional input and the optional output are
//! all type parameters.
//!
//! # Model
//!
//! ```text
//!   FsmState (plugin A) ─┐
//!   FsmState (plugin B) ─┼──► FsmFactory::builder().build() ──► FsmFactory (frozen)
//!   FsmState (base)     ─┘          merge per state,                  │
//!                                   reject duplicates                 │ create(state, ctx)
//!                                                                     ▼
//!                                                             Fsm instance
//!                                                   apply_event / go_to_state
//! ```
//!
//! A table is a list of [`FsmState`]s, each a source state plus its outgoing
//! [`Transition`]s. Several contributors may describe the same source state;
//! the factory concatenates their transition lists once, at build time, and
//! refuses two transitions for the same (state, event) pair.
//!
//! Instances are cheap and short-lived: create one per invocation, seeded
//! with the persisted state and a context value, attempt one transition, then
//! take the context back with [`Fsm::into_context`].
//!
//! # Example
//!
//! ```
//! use orcha_fsm::{FsmFactory, FsmState, Transition};
//!
//! let factory = FsmFactory::<&str, &str, Vec<String>, (), ()>::builder()
//!     .state(FsmState::new("CREATED").transition(
//!         Transition::new("UPLOAD", "UPLOADING").with_logic(|step, log: &mut Vec<String>| {
//!             log.push(format!("{} -> {}", step.from, step.to));
//!             Ok(None)
//!         }),
//!     ))
//!     .state(FsmState::new("UPLOADING"))
//!     .build()
//!     .unwrap();
//!
//! let mut fsm = factory.create("CREATED", Vec::new()).unwrap();
//! fsm.apply_event(&"UPLOAD", None).unwrap();
//! assert_eq!(*fsm.current_state(), "UPLOADING");
//! assert_eq!(fsm.into_context(), vec!["CREATED -> UPLOADING".to_string()]);
//! ```

#![deny(missing_docs)]

/// Engine error types
pub mod error;
/// Frozen transition tables and their builder
pub mod factory;
/// Short-lived machine instances
pub mod machine;
/// Source states, transitions and side-effect logic
pub mod state;

pub use error::{BoxError, FsmError};
pub use factory::{FsmFactory, FsmFactoryBuilder, StateBuilder};
pub use machine::Fsm;
pub use state::{FsmState, Step, Transition, TransitionLogic};
