// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orcha Core - Lifecycle Orchestration Control Plane
//!
//! This crate drives data-platform entities (artifacts, data items, models,
//! workflows, triggers and runs) through persisted lifecycles, and turns
//! run transitions into work on execution backends.
//!
//! # Architecture
//!
//! ```text
//!   caller ──► RunManager ──► RunLifecycleManager ──► Runtime ──► Framework ──► backend
//!                  ▲           (transition table,      (kind)      (k8sjob,       (cluster,
//!                  │            persisted state)                    k8skaniko,     scheduler)
//!                  │                                                k8sargo,
//!                  │                                                hpcdl)            │
//!                  │                                                                  │ watch /
//!                  │                                                                  │ poll
//!                  │                                                                  ▼
//!             RunMonitor ◄────────── EventBus<ChangeEvent> ◄────────── ResourceWatcher /
//!           (worker pool)                                              HpcMonitor
//! ```
//!
//! Caller-initiated operations fire events on the run's lifecycle. A
//! transition's side effect may produce a [`RunnableCommand`]; the run
//! manager dispatches it to the owning framework and only then persists the
//! new state. Backend-observed changes flow back through the event bus and
//! are replayed with [`RunManager::handle`], which finds the one edge
//! leading to the reported state.
//!
//! # Modules
//!
//! | Module | Role |
//! |--------|------|
//! | [`state`] | Lifecycle states and events |
//! | [`entity`] | Persisted entity record |
//! | [`lifecycle`] | Transition tables and the persisted state machine |
//! | [`spec`] | Run specs and their precedence merge |
//! | [`runtime`] | Per-kind builders and runners |
//! | [`framework`] | Execution backends |
//! | [`processor`] | Stage-scoped status enrichment |
//! | [`run_manager`] | Run operations and command dispatch |
//! | [`watcher`] / [`monitor`] | Backend feedback path |
//! | [`control_plane`] | Assembly and background tasks |
//!
//! [`RunnableCommand`]: runnable::RunnableCommand
//! [`RunManager::handle`]: run_manager::RunManager::handle

#![deny(missing_docs)]

/// Retry and backoff policies for backend calls
pub mod backoff;
/// Change-event bus and worker pool
pub mod bus;
/// Environment configuration
pub mod config;
/// Assembled control plane and background tasks
pub mod control_plane;
/// Persisted entity record
pub mod entity;
/// Crate error type
pub mod error;
/// Execution backends
pub mod framework;
/// Transition tables and lifecycle managers
pub mod lifecycle;
/// Backend feedback handler
pub mod monitor;
/// Post-transition status enrichment
pub mod processor;
/// Run operations
pub mod run_manager;
/// Backend-neutral description of submitted work
pub mod runnable;
/// Per-kind run builders and runners
pub mod runtime;
/// Secret resolution
pub mod secrets;
/// Function, task and run specs
pub mod spec;
/// Lifecycle states and events
pub mod state;
/// Entity and runnable persistence
pub mod store;
/// Cluster watch loops
pub mod watcher;

pub use config::Config;
pub use control_plane::{ControlPlane, ControlPlaneBuilder};
pub use entity::{Entity, EntityType};
pub use error::{Error, Result};
pub use run_manager::{RunManager, RunRequest};
pub use runnable::{Runnable, RunnableCommand};
pub use state::{Event, State};
