// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for orcha-core.

use orcha_fsm::FsmError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::framework::BackendError;
use crate::store::StoreError;

/// Control-plane errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The state machine refused the request or a transition's logic failed.
    #[error("Transition error: {0}")]
    Fsm(#[from] FsmError),

    /// Entity or runnable persistence failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A cluster or scheduler call failed.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Nothing is registered under the requested kind.
    #[error("Unknown {registry} kind: {kind}")]
    UnknownKind {
        /// Registry that was consulted (runtime, task, framework, ...).
        registry: &'static str,
        /// Unrecognized kind string.
        kind: String,
    },

    /// An entity's persisted state is malformed or not in its declared set.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An effective spec failed runtime validation.
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    /// Entity was not found.
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// Shorthand for [`Error::UnknownKind`].
    pub fn unknown_kind(registry: &'static str, kind: impl Into<String>) -> Self {
        Error::UnknownKind {
            registry,
            kind: kind.into(),
        }
    }

    /// Stable code for callers mapping errors onto their own surface.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIGURATION_ERROR",
            Error::Fsm(e) if e.is_invalid_transition() => "INVALID_TRANSITION",
            Error::Fsm(FsmError::Logic { source, .. }) => match source.downcast_ref::<Error>() {
                Some(inner) => inner.error_code(),
                None => "TRANSITION_FAILED",
            },
            Error::Fsm(_) => "INVALID_TRANSITION_TABLE",
            Error::Store(StoreError::Conflict { .. }) => "CONCURRENT_MODIFICATION",
            Error::Store(StoreError::NotFound(_)) => "NOT_FOUND",
            Error::Store(_) => "PERSISTENCE_ERROR",
            Error::Backend(e) if e.is_retryable() => "BACKEND_UNAVAILABLE",
            Error::Backend(_) => "BACKEND_REJECTED",
            Error::Json(_) => "SERIALIZATION_ERROR",
            Error::UnknownKind { .. } => "UNKNOWN_KIND",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::InvalidSpec(_) => "INVALID_SPEC",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }

    /// Transient failures worth retrying: backend outages and timeouts, and
    /// optimistic-concurrency conflicts.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Backend(e) => e.is_retryable(),
            Error::Store(StoreError::Conflict { .. }) => true,
            Error::Fsm(FsmError::Logic { source, .. }) => source
                .downcast_ref::<Error>()
                .is_some_and(Error::is_retryable),
            _ => false,
        }
    }

    /// No edge matched the requested event or target state.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Error::Fsm(e) if e.is_invalid_transition())
    }

    /// The store refused a write because the entity changed underneath.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Store(StoreError::Conflict { .. }))
    }
}

/// Result type using orcha-core Error.
pub type Result<T> = std::result::Result<T, Error>;
