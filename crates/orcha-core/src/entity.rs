// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted entities.
//!
//! Every lifecycle-managed record shares one shape: immutable identity, a
//! `kind` that selects its runtime, an open `spec`, a `status` map whose
//! `state` key positions it in its lifecycle table, and free-form metadata.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::state::State;

/// Partial status map merged into an entity's status.
pub type StatusFragment = Map<String, Value>;

/// Key holding the lifecycle state inside `status`.
pub const STATE_KEY: &str = "state";

/// Entity types with a lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// One execution request.
    Run,
    /// Uploaded artifact.
    Artifact,
    /// Uploaded data item.
    DataItem,
    /// Uploaded model.
    Model,
    /// Workflow definition.
    Workflow,
    /// Event trigger.
    Trigger,
}

impl EntityType {
    /// Wire name, e.g. `dataitem`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Run => "run",
            EntityType::Artifact => "artifact",
            EntityType::DataItem => "dataitem",
            EntityType::Model => "model",
            EntityType::Workflow => "workflow",
            EntityType::Trigger => "trigger",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "run" => Ok(EntityType::Run),
            "artifact" => Ok(EntityType::Artifact),
            "dataitem" => Ok(EntityType::DataItem),
            "model" => Ok(EntityType::Model),
            "workflow" => Ok(EntityType::Workflow),
            "trigger" => Ok(EntityType::Trigger),
            other => Err(Error::unknown_kind("entity type", other)),
        }
    }
}

/// A lifecycle-managed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Immutable identifier.
    pub id: String,
    /// Entity type.
    pub entity_type: EntityType,
    /// Kind (runtime for runs, e.g. `python`; free-form otherwise).
    pub kind: String,
    /// Owning project.
    pub project: String,
    /// Display name.
    pub name: String,
    /// Owning user, if any.
    pub user: Option<String>,
    /// Spec payload.
    pub spec: Map<String, Value>,
    /// Status payload; always carries [`STATE_KEY`].
    pub status: Map<String, Value>,
    /// Free-form metadata (labels, annotations).
    pub metadata: Map<String, Value>,
    /// Optimistic-concurrency version; `0` until first saved.
    pub version: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last successful save.
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// A new entity in `CREATED` with a fresh id.
    pub fn new(
        entity_type: EntityType,
        project: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let mut status = Map::new();
        status.insert(
            STATE_KEY.to_string(),
            Value::String(State::Created.to_string()),
        );
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type,
            kind: kind.into(),
            project: project.into(),
            name: name.into(),
            user: None,
            spec: Map::new(),
            status,
            metadata: Map::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the owning user.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Replace the spec.
    pub fn with_spec(mut self, spec: Map<String, Value>) -> Self {
        self.spec = spec;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Result<State> {
        match self.status.get(STATE_KEY) {
            Some(Value::String(s)) => s.parse(),
            Some(other) => Err(Error::InvalidState(format!(
                "{} {} has non-string state {other}",
                self.entity_type, self.id
            ))),
            None => Err(Error::InvalidState(format!(
                "{} {} has no state",
                self.entity_type, self.id
            ))),
        }
    }

    /// Position the entity at `state`. Only lifecycle managers call this,
    /// after a transition has been accepted.
    pub(crate) fn set_state(&mut self, state: State) {
        self.status
            .insert(STATE_KEY.to_string(), Value::String(state.to_string()));
    }

    /// Shallow-merge `fragment` into status. The fragment cannot move the
    /// entity: any `state` key it carries is ignored.
    pub fn merge_status(&mut self, fragment: StatusFragment) {
        for (key, value) in fragment {
            if key != STATE_KEY {
                self.status.insert(key, value);
            }
        }
    }

    /// A string field of the spec.
    pub fn spec_str(&self, key: &str) -> Option<&str> {
        self.spec.get(key).and_then(Value::as_str)
    }
}

/// Build a status fragment from `(key, value)` pairs.
pub fn fragment<I, K>(pairs: I) -> StatusFragment
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
