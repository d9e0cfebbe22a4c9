// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for orcha-core.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where cluster and HPC calls go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// In-process cluster and HPC scheduler. Objects live only as long as
    /// the process, and nothing runs unless statuses are driven from
    /// outside.
    Simulated,
}

impl BackendMode {
    /// Value accepted in `ORCHA_BACKEND`.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendMode::Simulated => "simulated",
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulated" => Ok(BackendMode::Simulated),
            _ => Err(()),
        }
    }
}

/// Control-plane configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite URL for the entity and runnable stores
    pub database_url: String,
    /// Namespace in which cluster resources are created and watched
    pub namespace: String,
    /// Image used by python jobs
    pub python_image: String,
    /// Image used by dbt transforms
    pub dbt_image: String,
    /// Image builder (kaniko executor) image
    pub kaniko_image: String,
    /// Image used to compile and launch kfp pipelines
    pub kfp_image: String,
    /// Size of the monitor worker pool
    pub monitor_workers: usize,
    /// Bound on each backend call
    pub backend_timeout: Duration,
    /// Retries of transient backend errors
    pub backend_max_retries: u32,
    /// HPC status polling interval
    pub hpc_poll_interval: Duration,
    /// Backend the binary talks to; unset until chosen
    pub backend: Option<BackendMode>,
    /// JSON secret catalogue (`{project: {secret: [keys]}}`)
    pub secrets_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:.data/orcha.db?mode=rwc".to_string(),
            namespace: "default".to_string(),
            python_image: "ghcr.io/orcha/python-runtime:latest".to_string(),
            dbt_image: "ghcr.io/orcha/dbt-runtime:latest".to_string(),
            kaniko_image: "gcr.io/kaniko-project/executor:latest".to_string(),
            kfp_image: "ghcr.io/orcha/kfp-runtime:latest".to_string(),
            monitor_workers: 2,
            backend_timeout: Duration::from_secs(30),
            backend_max_retries: 3,
            hpc_poll_interval: Duration::from_secs(60),
            backend: None,
            secrets_file: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |var: &str, default: String| lookup(var).unwrap_or(default);

        let monitor_workers: usize = parse(&lookup, "ORCHA_MONITOR_WORKERS", defaults.monitor_workers)?;
        if monitor_workers == 0 {
            return Err(ConfigError::InvalidValue {
                var: "ORCHA_MONITOR_WORKERS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            database_url: string("ORCHA_DATABASE_URL", defaults.database_url),
            namespace: string("ORCHA_NAMESPACE", defaults.namespace),
            python_image: string("ORCHA_PYTHON_IMAGE", defaults.python_image),
            dbt_image: string("ORCHA_DBT_IMAGE", defaults.dbt_image),
            kaniko_image: string("ORCHA_KANIKO_IMAGE", defaults.kaniko_image),
            kfp_image: string("ORCHA_KFP_IMAGE", defaults.kfp_image),
            monitor_workers,
            backend_timeout: Duration::from_secs(parse(
                &lookup,
                "ORCHA_BACKEND_TIMEOUT_SECS",
                defaults.backend_timeout.as_secs(),
            )?),
            backend_max_retries: parse(
                &lookup,
                "ORCHA_BACKEND_MAX_RETRIES",
                defaults.backend_max_retries,
            )?,
            hpc_poll_interval: Duration::from_secs(parse(
                &lookup,
                "ORCHA_HPC_POLL_SECS",
                defaults.hpc_poll_interval.as_secs(),
            )?),
            backend: lookup("ORCHA_BACKEND")
                .map(|value| {
                    value.parse::<BackendMode>().map_err(|_| ConfigError::InvalidValue {
                        var: "ORCHA_BACKEND",
                        value,
                    })
                })
                .transpose()?,
            secrets_file: lookup("ORCHA_SECRETS_FILE").map(PathBuf::from),
        })
    }
}

fn parse<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable holds a value that cannot be used.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}
