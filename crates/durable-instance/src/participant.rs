// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence and notification participant contracts.
//!
//! Persistence participants come in two shapes:
//!
//! | Shape | Trait | Phases |
//! |-------|-------|--------|
//! | Basic | [`PersistenceParticipant`] | collect, map, publish |
//! | I/O   | [`IoParticipant`] | basic phases + on_save, on_saved, on_load, abort |
//!
//! The pipeline receives them tagged as [`ParticipantMut::Basic`] or
//! [`ParticipantMut::Io`] and only dispatches the phases a shape implements.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::values::{ValueKey, ValueView};

/// Values returned by a participant from the collect phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedValues {
    /// Values loaded back on reactivation.
    pub read_write: Vec<(ValueKey, Value)>,
    /// Diagnostic values that are never loaded.
    pub write_only: Vec<(ValueKey, Value)>,
}

impl CollectedValues {
    /// Nothing to persist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a read-write value.
    pub fn with_read_write(mut self, key: ValueKey, value: Value) -> Self {
        self.read_write.push((key, value));
        self
    }

    /// Add a write-only value.
    pub fn with_write_only(mut self, key: ValueKey, value: Value) -> Self {
        self.write_only.push((key, value));
        self
    }

    /// Returns true if no values were contributed.
    pub fn is_empty(&self) -> bool {
        self.read_write.is_empty() && self.write_only.is_empty()
    }
}

/// Minimal synchronous persistence participant.
pub trait PersistenceParticipant: Send {
    /// Name used in logs and collision errors.
    fn name(&self) -> &str;

    /// Contribute values to the snapshot.
    fn collect_values(&mut self) -> Result<CollectedValues> {
        Ok(CollectedValues::default())
    }

    /// Derive additional write-only values from the collected partitions.
    fn map_values(
        &mut self,
        _read_write: &ValueView<'_>,
        _write_only: &ValueView<'_>,
    ) -> Result<Vec<(ValueKey, Value)>> {
        Ok(Vec::new())
    }

    /// Rehydrate in-memory state from a loaded snapshot.
    fn publish_values(&mut self, _read_write: &ValueView<'_>) -> Result<()> {
        Ok(())
    }
}

/// Persistence participant that also performs asynchronous I/O around the
/// snapshot write.
#[async_trait]
pub trait IoParticipant: PersistenceParticipant {
    /// Final I/O before the snapshot is written.
    async fn on_save(
        &mut self,
        _read_write: &ValueView<'_>,
        _write_only: &ValueView<'_>,
        _timeout: Duration,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once the snapshot was durably committed.
    async fn on_saved(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    /// Fetch out-of-band data before [`PersistenceParticipant::publish_values`].
    async fn on_load(&mut self, _read_write: &ValueView<'_>, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    /// The current pipeline run failed. Errors are logged and dropped.
    fn abort(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Owned participant tagged with its capability shape.
pub enum Participant {
    /// Synchronous collect/map/publish participant.
    Basic(Box<dyn PersistenceParticipant>),
    /// Participant with async save/load hooks.
    Io(Box<dyn IoParticipant>),
}

impl Participant {
    /// Wrap a basic participant.
    pub fn basic(participant: impl PersistenceParticipant + 'static) -> Self {
        Self::Basic(Box::new(participant))
    }

    /// Wrap an I/O participant.
    pub fn io(participant: impl IoParticipant + 'static) -> Self {
        Self::Io(Box::new(participant))
    }

    /// Borrow as a pipeline participant.
    pub fn as_participant_mut(&mut self) -> ParticipantMut<'_> {
        match self {
            Self::Basic(p) => ParticipantMut::Basic(p.as_mut()),
            Self::Io(p) => ParticipantMut::Io(p.as_mut()),
        }
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic(p) => f.debug_tuple("Basic").field(&p.name()).finish(),
            Self::Io(p) => f.debug_tuple("Io").field(&p.name()).finish(),
        }
    }
}

/// Borrowed participant as the pipeline sees it for one run.
pub enum ParticipantMut<'a> {
    /// Synchronous collect/map/publish participant.
    Basic(&'a mut dyn PersistenceParticipant),
    /// Participant with async save/load hooks.
    Io(&'a mut dyn IoParticipant),
}

impl ParticipantMut<'_> {
    /// Participant name.
    pub fn name(&self) -> &str {
        match self {
            Self::Basic(p) => p.name(),
            Self::Io(p) => p.name(),
        }
    }

    /// Returns true if the participant implements the async hooks.
    pub fn supports_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// The async hooks, if this participant has them.
    pub fn io(&mut self) -> Option<&mut dyn IoParticipant> {
        match self {
            Self::Basic(_) => None,
            Self::Io(p) => Some(&mut **p),
        }
    }

    pub(crate) fn collect_values(&mut self) -> Result<CollectedValues> {
        match self {
            Self::Basic(p) => p.collect_values(),
            Self::Io(p) => p.collect_values(),
        }
    }

    pub(crate) fn map_values(
        &mut self,
        read_write: &ValueView<'_>,
        write_only: &ValueView<'_>,
    ) -> Result<Vec<(ValueKey, Value)>> {
        match self {
            Self::Basic(p) => p.map_values(read_write, write_only),
            Self::Io(p) => p.map_values(read_write, write_only),
        }
    }

    pub(crate) fn publish_values(&mut self, read_write: &ValueView<'_>) -> Result<()> {
        match self {
            Self::Basic(p) => p.publish_values(read_write),
            Self::Io(p) => p.publish_values(read_write),
        }
    }
}

/// Participant notified when the instance is about to go idle, before the
/// persistence pipeline collects values.
#[async_trait]
pub trait NotificationParticipant: Send {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Batch async work before the idle transition completes.
    async fn on_paused(&mut self, timeout: Duration) -> Result<()>;

    /// A participant failed during the notification run.
    fn abort(&mut self) -> Result<()> {
        Ok(())
    }
}
