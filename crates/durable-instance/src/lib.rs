// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable Instance - reminder reconciliation and checkpoint participants
//!
//! This crate keeps a long-running, checkpointable instance consistent across
//! crashes and reactivations. Three things can fail independently and share
//! no transaction:
//!
//! - the durable reminder service of the host,
//! - the snapshot store,
//! - external callers replaying requests after a crash.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      DurableInstance                         │
//! │          activate() / idle() / reminder_fired()              │
//! └──────────────────────────────────────────────────────────────┘
//!        │ on_paused                    │ collect/map/on_save/on_saved
//!        ▼                              ▼
//! ┌──────────────────────┐   ┌───────────────────────────────────┐
//! │ NotificationPipeline │   │        PersistencePipeline        │
//! └──────────────────────┘   └───────────────────────────────────┘
//!        │                      │              │              │
//!        ▼                      ▼              ▼              ▼
//! ┌─────────────────────────────────┐  ┌──────────────┐ ┌──────────────┐
//! │          ReminderTable          │  │ResponseCache │ │  extension   │
//! └─────────────────────────────────┘  └──────────────┘ │ participants │
//!        │                                              └──────────────┘
//!        ▼
//! ┌───────────────┐                    ┌───────────────┐
//! │ InstanceHost  │                    │ SnapshotStore │◄── DurableInstance::idle
//! └───────────────┘                    └───────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use durable_instance::host::mock::MockHost;
//! use durable_instance::{DurableInstance, InstanceConfig, MemorySnapshotStore};
//!
//! # async fn run() -> durable_instance::Result<()> {
//! let mut instance = DurableInstance::builder()
//!     .config(InstanceConfig::new("order-42"))
//!     .host(Arc::new(MockHost::new()))
//!     .store(Arc::new(MemorySnapshotStore::new()))
//!     .build()?;
//!
//! instance.activate().await?;
//! instance
//!     .reminders_mut()
//!     .register_or_update("payment-timeout", Duration::from_secs(300))?;
//! instance.idle().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`reminders`]: the reminder reconciliation state machine
//! - [`pipeline`]: the persistence pipeline and its phases
//! - [`notification`]: the "about to idle" notification pipeline
//! - [`responses`]: the idempotent response cache
//! - [`instance`]: orchestration of the above per instance

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod host;
pub mod instance;
pub mod notification;
pub mod participant;
pub mod pipeline;
pub mod reminders;
pub mod responses;
pub mod store;
pub mod values;

pub use config::{ConfigError, InstanceConfig};
pub use error::{InstanceError, ReplayError, Result};
pub use host::{ExecutionState, InstanceHost};
pub use instance::{DurableInstance, DurableInstanceBuilder, FiredReminder};
pub use notification::NotificationPipeline;
pub use participant::{
    CollectedValues, IoParticipant, NotificationParticipant, Participant, ParticipantMut,
    PersistenceParticipant,
};
pub use pipeline::{PersistencePipeline, PipelinePhase};
pub use reminders::{PersistedReminder, ReminderEntry, ReminderState, ReminderTable};
pub use responses::{ReplayOutcome, ResponseCache, ResponseRecord};
pub use store::{MemorySnapshotStore, SnapshotStore};
pub use values::{ValueEntry, ValueKey, ValueMap, ValueView, Visibility};
