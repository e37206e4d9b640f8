// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock host for testing.
//!
//! Keeps an in-memory reminder service and records every call made against
//! it, so tests can assert on exactly which registrations and cancellations
//! reached the "external" side.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ExecutionState, InstanceHost};
use crate::config::InstanceConfig;
use crate::error::{InstanceError, Result};

/// A call observed by the mock reminder service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReminderCall {
    /// `register_or_update_reminder`
    Register {
        /// Reminder name.
        name: String,
        /// Requested due time.
        due_time: Duration,
    },
    /// `unregister_reminder`
    Unregister {
        /// Reminder name.
        name: String,
    },
    /// `list_reminders`
    List,
}

#[derive(Debug)]
struct MockState {
    live: BTreeMap<String, Duration>,
    calls: Vec<ReminderCall>,
    execution_state: ExecutionState,
    failing: Option<String>,
}

/// Mock host for testing.
#[derive(Debug)]
pub struct MockHost {
    state: Mutex<MockState>,
    reactivation_period: Duration,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    /// Create an idle host with a 60 second reactivation period.
    pub fn new() -> Self {
        Self::with_reactivation_period(Duration::from_secs(60))
    }

    /// Create an idle host with the given reactivation period.
    pub fn with_reactivation_period(reactivation_period: Duration) -> Self {
        Self {
            state: Mutex::new(MockState {
                live: BTreeMap::new(),
                calls: Vec::new(),
                execution_state: ExecutionState::Idle,
                failing: None,
            }),
            reactivation_period,
        }
    }

    /// Create an idle host using the configured reactivation period.
    pub fn from_config(config: &InstanceConfig) -> Self {
        Self::with_reactivation_period(config.reactivation_period)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panicking test must not poison every later assertion.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Change what `current_execution_state` reports.
    pub fn set_execution_state(&self, state: ExecutionState) {
        self.lock().execution_state = state;
    }

    /// Make every reminder call fail with `message` until cleared with `None`.
    pub fn set_failing(&self, message: Option<&str>) {
        self.lock().failing = message.map(str::to_string);
    }

    /// Every call observed so far, in order.
    pub fn calls(&self) -> Vec<ReminderCall> {
        self.lock().calls.clone()
    }

    /// Register and unregister calls only, in order.
    pub fn mutations(&self) -> Vec<ReminderCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| !matches!(call, ReminderCall::List))
            .cloned()
            .collect()
    }

    /// Forget the recorded calls, keeping live reminders.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Names of the currently registered reminders.
    pub fn live_reminders(&self) -> Vec<String> {
        self.lock().live.keys().cloned().collect()
    }

    /// Due time the given reminder was last registered with.
    pub fn due_time(&self, name: &str) -> Option<Duration> {
        self.lock().live.get(name).copied()
    }

    /// Place a reminder in the service without recording a call, as if a
    /// previous activation had registered it.
    pub fn insert_live_reminder(&self, name: &str, due_time: Duration) {
        self.lock().live.insert(name.to_string(), due_time);
    }

    fn check_failing(state: &MockState, operation: &str) -> Result<()> {
        match &state.failing {
            Some(message) => Err(InstanceError::host(operation, message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl InstanceHost for MockHost {
    async fn register_or_update_reminder(&self, name: &str, due_time: Duration) -> Result<()> {
        let mut state = self.lock();
        Self::check_failing(&state, "register_or_update_reminder")?;
        state.calls.push(ReminderCall::Register {
            name: name.to_string(),
            due_time,
        });
        state.live.insert(name.to_string(), due_time);
        Ok(())
    }

    async fn unregister_reminder(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check_failing(&state, "unregister_reminder")?;
        state.calls.push(ReminderCall::Unregister {
            name: name.to_string(),
        });
        state.live.remove(name);
        Ok(())
    }

    async fn list_reminders(&self) -> Result<Vec<String>> {
        let mut state = self.lock();
        Self::check_failing(&state, "list_reminders")?;
        state.calls.push(ReminderCall::List);
        Ok(state.live.keys().cloned().collect())
    }

    fn current_execution_state(&self) -> ExecutionState {
        self.lock().execution_state
    }

    fn reactivation_period(&self) -> Duration {
        self.reactivation_period
    }
}
