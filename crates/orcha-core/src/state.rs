// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle state and event names.
//!
//! One enum covers every entity kind; each lifecycle table declares the
//! subset it uses, and membership is checked against that table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Entity exists; nothing has happened yet.
    Created,
    /// Effective spec is built.
    Built,
    /// Uploadable content is being transferred.
    Uploading,
    /// Ready (content available, or runnable submitted).
    Ready,
    /// Waiting for backend capacity.
    Pending,
    /// Executing.
    Running,
    /// Stop requested.
    Stop,
    /// Execution halted.
    Stopped,
    /// Resume requested.
    Resume,
    /// Finished successfully.
    Completed,
    /// Failed.
    Error,
    /// Teardown in progress.
    Deleting,
    /// Gone.
    Deleted,
}

impl State {
    /// Every state, in declaration order.
    pub const ALL: [State; 13] = [
        State::Created,
        State::Built,
        State::Uploading,
        State::Ready,
        State::Pending,
        State::Running,
        State::Stop,
        State::Stopped,
        State::Resume,
        State::Completed,
        State::Error,
        State::Deleting,
        State::Deleted,
    ];

    /// Wire name, e.g. `RUNNING`.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Created => "CREATED",
            State::Built => "BUILT",
            State::Uploading => "UPLOADING",
            State::Ready => "READY",
            State::Pending => "PENDING",
            State::Running => "RUNNING",
            State::Stop => "STOP",
            State::Stopped => "STOPPED",
            State::Resume => "RESUME",
            State::Completed => "COMPLETED",
            State::Error => "ERROR",
            State::Deleting => "DELETING",
            State::Deleted => "DELETED",
        }
    }

    /// Processor stage reached on entering this state: `"on"` followed by
    /// the capitalized lowercase name (`RUNNING` is `onRunning`).
    pub fn stage(&self) -> String {
        let lower = self.as_str().to_ascii_lowercase();
        let mut chars = lower.chars();
        match chars.next() {
            Some(first) => format!("on{}{}", first.to_ascii_uppercase(), chars.as_str()),
            None => "on".to_string(),
        }
    }

    /// States a run never leaves except through deletion.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Completed | State::Error | State::Deleted)
    }

    /// States in which work is submitted and may still report progress.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            State::Ready | State::Pending | State::Running | State::Resume
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidState(format!("unrecognized state {s:?}")))
    }
}

/// A lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    /// Build the effective spec.
    Build,
    /// Produce and submit the runnable.
    Run,
    /// Backend queued the work.
    Schedule,
    /// Backend started the work.
    Execute,
    /// Another iteration of running work.
    Loop,
    /// Work finished.
    Complete,
    /// Something failed.
    Error,
    /// Halt.
    Stop,
    /// Continue after a halt.
    Resume,
    /// Start an upload.
    Upload,
    /// Content became available.
    Ready,
    /// Metadata update (plugin event).
    Update,
    /// Remove.
    Delete,
}

impl Event {
    /// Every event, in declaration order.
    pub const ALL: [Event; 13] = [
        Event::Build,
        Event::Run,
        Event::Schedule,
        Event::Execute,
        Event::Loop,
        Event::Complete,
        Event::Error,
        Event::Stop,
        Event::Resume,
        Event::Upload,
        Event::Ready,
        Event::Update,
        Event::Delete,
    ];

    /// Wire name, e.g. `DELETE`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Build => "BUILD",
            Event::Run => "RUN",
            Event::Schedule => "SCHEDULE",
            Event::Execute => "EXECUTE",
            Event::Loop => "LOOP",
            Event::Complete => "COMPLETE",
            Event::Error => "ERROR",
            Event::Stop => "STOP",
            Event::Resume => "RESUME",
            Event::Upload => "UPLOAD",
            Event::Ready => "READY",
            Event::Update => "UPDATE",
            Event::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Event {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Event::ALL
            .iter()
            .copied()
            .find(|event| event.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidRequest(format!("unrecognized event {s:?}")))
    }
}
