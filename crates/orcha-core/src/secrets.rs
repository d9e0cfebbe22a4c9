// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Secret resolution.
//!
//! Runners never see secret values. They receive, per secret name, the set
//! of keys it holds, and the framework mounts them by reference.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Secret name to the keys it holds.
pub type GroupedSecrets = BTreeMap<String, BTreeSet<String>>;

/// Resolves project secrets to their key sets.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Group `names` for `project`. Unknown names are an error.
    async fn resolve(&self, project: &str, names: &[String]) -> Result<GroupedSecrets>;
}

/// In-memory secret catalogue.
#[derive(Clone, Default)]
pub struct MemorySecretResolver {
    secrets: Arc<Mutex<HashMap<(String, String), BTreeSet<String>>>>,
}

impl MemorySecretResolver {
    /// Empty catalogue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalogue from JSON shaped `{"project": {"secret": ["key", ...]}}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let catalogue: HashMap<String, HashMap<String, Vec<String>>> = serde_json::from_str(json)?;
        let resolver = Self::new();
        for (project, secrets) in catalogue {
            for (name, keys) in secrets {
                resolver.insert(&project, &name, keys);
            }
        }
        Ok(resolver)
    }

    /// Number of registered secrets.
    pub fn len(&self) -> usize {
        self.secrets.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Whether no secret is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register secret `name` in `project` holding `keys`.
    pub fn insert<I, K>(&self, project: &str, name: &str, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys = keys.into_iter().map(Into::into).collect();
        if let Ok(mut secrets) = self.secrets.lock() {
            secrets.insert((project.to_string(), name.to_string()), keys);
        }
    }
}

#[async_trait]
impl SecretResolver for MemorySecretResolver {
    async fn resolve(&self, project: &str, names: &[String]) -> Result<GroupedSecrets> {
        let secrets = self
            .secrets
            .lock()
            .map_err(|_| Error::InvalidRequest("secret catalogue unavailable".into()))?;

        names
            .iter()
            .map(|name| {
                secrets
                    .get(&(project.to_string(), name.clone()))
                    .map(|keys| (name.clone(), keys.clone()))
                    .ok_or_else(|| {
                        Error::InvalidRequest(format!("unknown secret {name} in project {project}"))
                    })
            })
            .collect()
    }
}
