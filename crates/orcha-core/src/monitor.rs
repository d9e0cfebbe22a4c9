// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replays backend-reported states into run lifecycles.
//!
//! The monitor never fails: every error is logged and the event dropped, so
//! one bad event cannot stop state propagation for other runs. A duplicate
//! of an applied state only brings a lagging runnable record up to date.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::bus::{ChangeEvent, EventHandler};
use crate::run_manager::RunManager;

/// Attempts per event when the run keeps changing underneath.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Handler turning change events into `handle` calls.
pub struct RunMonitor {
    runs: Arc<RunManager>,
    max_attempts: u32,
}

impl RunMonitor {
    /// Monitor driving `runs`.
    pub fn new(runs: Arc<RunManager>) -> Self {
        Self {
            runs,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Override the attempts made on concurrent modification.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

#[async_trait]
impl EventHandler<ChangeEvent> for RunMonitor {
    async fn handle(&self, event: ChangeEvent) {
        let run_id = event.entity_id.as_str();
        let target = event.target_state;

        for attempt in 1..=self.max_attempts {
            let run = match self.runs.find(run_id).await {
                Ok(Some(run)) => run,
                Ok(None) => {
                    debug!(run_id, state = %target, "Run is gone, dropping event");
                    return;
                }
                Err(e) => {
                    error!(run_id, error = %e, "Failed to load run");
                    return;
                }
            };

            match run.state() {
                Ok(current) if current == target => {
                    debug!(run_id, state = %target, "Run already at reported state");
                    if let Some(runnable) = &event.runnable
                        && let Err(e) = self.runs.acknowledge(runnable).await
                    {
                        warn!(run_id, error = %e, "Failed to record applied observation");
                    }
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(run_id, error = %e, "Run has no usable state, dropping event");
                    return;
                }
            }

            match self.runs.handle(&run, target, event.runnable.clone()).await {
                Ok(_) => return,
                Err(e) if e.is_conflict() && attempt < self.max_attempts => {
                    debug!(run_id, attempt, "Run modified concurrently, reloading");
                }
                Err(e) if e.is_invalid_transition() => {
                    warn!(
                        run_id,
                        state = %target,
                        error = %e,
                        "Reported state is not reachable, dropping event"
                    );
                    return;
                }
                Err(e) => {
                    error!(
                        run_id,
                        state = %target,
                        code = e.error_code(),
                        error = %e,
                        "Failed to apply reported state"
                    );
                    return;
                }
            }
        }
    }
}
