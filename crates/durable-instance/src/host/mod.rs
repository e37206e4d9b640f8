// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contract required from the hosting instance.
//!
//! The host owns the durable reminder service and knows whether the hosted
//! program can still make progress. Reminder registration is assumed to be
//! idempotent: registering an existing name updates it, unregistering a
//! missing name succeeds.

pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Execution state of the hosted program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Has work to do but is not idle yet.
    Runnable,
    /// Waiting on bookmarks.
    Idle,
    /// Finished.
    Complete,
}

impl ExecutionState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Runnable => "runnable",
            Self::Idle => "idle",
            Self::Complete => "complete",
        }
    }
}

/// Hosting instance as seen by the reminder table.
#[async_trait]
pub trait InstanceHost: Send + Sync {
    /// Register a durable reminder, or move an existing one to a new due time.
    async fn register_or_update_reminder(&self, name: &str, due_time: Duration) -> Result<()>;

    /// Remove a durable reminder.
    async fn unregister_reminder(&self, name: &str) -> Result<()>;

    /// Names of every reminder currently registered for this instance.
    async fn list_reminders(&self) -> Result<Vec<String>>;

    /// Current execution state of the hosted program.
    fn current_execution_state(&self) -> ExecutionState;

    /// Due time of the reactivation marker.
    fn reactivation_period(&self) -> Duration;
}
