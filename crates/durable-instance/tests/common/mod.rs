// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for durable-instance integration tests.
//!
//! Provides TestContext wiring a mock host and an in-memory snapshot store.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use durable_instance::host::mock::{MockHost, ReminderCall};
use durable_instance::reminders::reminder_name;
use durable_instance::{DurableInstance, InstanceConfig, MemorySnapshotStore, Participant};

/// Shared host and store for one simulated instance identity.
pub struct TestContext {
    pub host: Arc<MockHost>,
    pub store: Arc<MemorySnapshotStore>,
    pub config: InstanceConfig,
}

impl TestContext {
    /// Create a context with an idle host and an empty store.
    pub fn new() -> Self {
        let config = InstanceConfig::new(format!("test-{}", Uuid::new_v4()))
            .with_reactivation_period(Duration::from_secs(30));
        Self {
            host: Arc::new(MockHost::from_config(&config)),
            store: Arc::new(MemorySnapshotStore::new()),
            config,
        }
    }

    /// Build an instance (not yet activated) sharing this context's host and store.
    pub fn instance(&self) -> DurableInstance {
        self.instance_with(Vec::new())
    }

    /// Build an instance with extra participants.
    pub fn instance_with(&self, participants: Vec<Participant>) -> DurableInstance {
        let mut builder = DurableInstance::builder()
            .config(self.config.clone())
            .host(self.host.clone())
            .store(self.store.clone());
        for participant in participants {
            builder = builder.participant(participant);
        }
        builder.build().expect("Failed to build instance")
    }

    /// Build and activate an instance.
    pub async fn activated(&self) -> DurableInstance {
        let mut instance = self.instance();
        instance.activate().await.expect("Failed to activate instance");
        instance
    }
}

/// Register call for a bookmark reminder.
pub fn register_call(bookmark: &str, due_time: Duration) -> ReminderCall {
    ReminderCall::Register {
        name: reminder_name(bookmark),
        due_time,
    }
}

/// Unregister call for a bookmark reminder.
pub fn unregister_call(bookmark: &str) -> ReminderCall {
    ReminderCall::Unregister {
        name: reminder_name(bookmark),
    }
}

/// Returns true if the recorded due time is within one second below `expected`.
pub fn approximately(actual: Duration, expected: Duration) -> bool {
    actual <= expected && expected - actual < Duration::from_secs(1)
}
