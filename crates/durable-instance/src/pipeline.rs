// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence pipeline.
//!
//! Runs the participant phases around one snapshot write or one snapshot
//! load. Every phase visits participants sequentially in registration order.
//!
//! ```text
//!  save:  Created ─collect─▶ Collected ─map─▶ Mapped ─on_save─▶ Saved ─on_saved─▶ Finished
//!                                                         (snapshot written here)
//!  load:  Loaded ─on_load─▶ Fetched ─publish─▶ Published
//!
//!  any failure ─▶ Aborted (abort() on every I/O participant)
//! ```
//!
//! Collected and mapped values land in the pipeline's own map. The caller only
//! reads it once `on_save` succeeded, so a failed run never leaks a partial
//! snapshot.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::{InstanceError, Result};
use crate::participant::ParticipantMut;
use crate::values::{ValueEntry, ValueKey, ValueMap};

/// Progress of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    /// Save run created, nothing collected yet.
    Created,
    /// Participant values collected.
    Collected,
    /// Write-only values derived.
    Mapped,
    /// `on_save` completed; the snapshot may be written.
    Saved,
    /// `on_saved` completed after the snapshot was committed.
    Finished,
    /// Load run created from a stored snapshot.
    Loaded,
    /// `on_load` completed.
    Fetched,
    /// Participants rehydrated.
    Published,
    /// A phase failed and participants were aborted.
    Aborted,
}

impl PipelinePhase {
    /// Returns the string representation of the phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Collected => "collected",
            Self::Mapped => "mapped",
            Self::Saved => "saved",
            Self::Finished => "finished",
            Self::Loaded => "loaded",
            Self::Fetched => "fetched",
            Self::Published => "published",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One save or load run across an ordered participant list.
pub struct PersistencePipeline<'p> {
    participants: Vec<ParticipantMut<'p>>,
    values: ValueMap,
    persist_write_only_values: bool,
    timeout: Duration,
    phase: PipelinePhase,
}

impl<'p> PersistencePipeline<'p> {
    /// Create a save run that merges into `target`.
    ///
    /// Write-only values returned from collect are dropped unless
    /// `persist_write_only_values` is set. `timeout` applies to each async
    /// participant call on its own.
    pub fn for_save(
        participants: Vec<ParticipantMut<'p>>,
        target: ValueMap,
        persist_write_only_values: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            participants,
            values: target,
            persist_write_only_values,
            timeout,
            phase: PipelinePhase::Created,
        }
    }

    /// Create a load run over a stored snapshot.
    pub fn for_load(
        participants: Vec<ParticipantMut<'p>>,
        values: ValueMap,
        timeout: Duration,
    ) -> Self {
        Self {
            participants,
            values,
            persist_write_only_values: false,
            timeout,
            phase: PipelinePhase::Loaded,
        }
    }

    /// The phase last completed.
    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    /// Values gathered (save) or loaded (load) so far.
    pub fn values(&self) -> &ValueMap {
        &self.values
    }

    /// Consume the pipeline, returning its values.
    pub fn into_values(self) -> ValueMap {
        self.values
    }

    /// Gather every participant's values.
    ///
    /// A key contributed twice, or already present in the target map, fails
    /// the run with [`InstanceError::KeyCollision`] and leaves the target
    /// untouched.
    pub fn collect(&mut self) -> Result<()> {
        self.enter(PipelinePhase::Created, PipelinePhase::Collected)?;

        let mut staged = self.values.clone();
        let persist_write_only = self.persist_write_only_values;
        let mut result = Ok(());
        for participant in self.participants.iter_mut() {
            let collected = match participant.collect_values() {
                Ok(collected) => collected,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };
            let name = participant.name();
            let mut merged = merge(
                &mut staged,
                name,
                collected.read_write.into_iter(),
                ValueEntry::read_write,
            );
            if merged.is_ok() && persist_write_only {
                merged = merge(
                    &mut staged,
                    name,
                    collected.write_only.into_iter(),
                    ValueEntry::write_only,
                );
            }
            if let Err(e) = merged {
                result = Err(e);
                break;
            }
        }

        match result {
            Ok(()) => {
                debug!(values = staged.len(), "Collected participant values");
                self.values = staged;
                self.advance(PipelinePhase::Collected);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Let participants derive write-only values from the collected views.
    ///
    /// Mapped values are always persisted, regardless of
    /// `persist_write_only_values`.
    pub fn map(&mut self) -> Result<()> {
        self.enter(PipelinePhase::Collected, PipelinePhase::Mapped)?;

        let mut mapped: Vec<(String, Vec<(ValueKey, Value)>)> = Vec::new();
        let mut result = Ok(());
        {
            let read_write = self.values.read_write_view();
            let write_only = self.values.write_only_view();
            for participant in self.participants.iter_mut() {
                match participant.map_values(&read_write, &write_only) {
                    Ok(values) if values.is_empty() => {}
                    Ok(values) => mapped.push((participant.name().to_string(), values)),
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
        }

        if result.is_ok() {
            let mut staged = self.values.clone();
            for (name, values) in mapped {
                if let Err(e) = merge(&mut staged, &name, values.into_iter(), ValueEntry::write_only)
                {
                    result = Err(e);
                    break;
                }
            }
            if result.is_ok() {
                self.values = staged;
            }
        }

        match result {
            Ok(()) => {
                self.advance(PipelinePhase::Mapped);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Final asynchronous I/O before the snapshot is written.
    #[instrument(skip(self), fields(participants = self.participants.len()))]
    pub async fn on_save(&mut self) -> Result<()> {
        self.enter(PipelinePhase::Mapped, PipelinePhase::Saved)?;
        let result = run_on_save(&mut self.participants, &self.values, self.timeout).await;
        self.complete(result, PipelinePhase::Saved)
    }

    /// Release resources reserved during `on_save`; only call once the
    /// snapshot was durably committed.
    #[instrument(skip(self), fields(participants = self.participants.len()))]
    pub async fn on_saved(&mut self) -> Result<()> {
        self.enter(PipelinePhase::Saved, PipelinePhase::Finished)?;
        let result = run_on_saved(&mut self.participants, self.timeout).await;
        self.complete(result, PipelinePhase::Finished)
    }

    /// Let I/O participants fetch out-of-band data for the loaded snapshot.
    #[instrument(skip(self), fields(participants = self.participants.len()))]
    pub async fn on_load(&mut self) -> Result<()> {
        self.enter(PipelinePhase::Loaded, PipelinePhase::Fetched)?;
        let result = run_on_load(&mut self.participants, &self.values, self.timeout).await;
        self.complete(result, PipelinePhase::Fetched)
    }

    /// Hand every participant its read-write view to rehydrate from.
    pub fn publish(&mut self) -> Result<()> {
        self.enter(PipelinePhase::Fetched, PipelinePhase::Published)?;
        let mut result = Ok(());
        {
            let read_write = self.values.read_write_view();
            for participant in self.participants.iter_mut() {
                if let Err(e) = participant.publish_values(&read_write) {
                    result = Err(e);
                    break;
                }
            }
        }
        self.complete(result, PipelinePhase::Published)
    }

    /// Notify every I/O participant that the run failed.
    ///
    /// Abort failures are logged and swallowed.
    pub fn abort(&mut self) {
        for participant in self.participants.iter_mut() {
            if let Some(io) = participant.io()
                && let Err(e) = io.abort()
            {
                debug!(participant = io.name(), error = %e, "Participant abort failed");
            }
        }
        self.phase = PipelinePhase::Aborted;
    }

    fn enter(&self, expected: PipelinePhase, requested: PipelinePhase) -> Result<()> {
        if self.phase != expected {
            return Err(InstanceError::PhaseOrder {
                requested,
                current: self.phase,
            });
        }
        Ok(())
    }

    fn advance(&mut self, phase: PipelinePhase) {
        debug!(phase = %phase, "Pipeline phase completed");
        self.phase = phase;
    }

    fn complete(&mut self, result: Result<()>, phase: PipelinePhase) -> Result<()> {
        match result {
            Ok(()) => {
                self.advance(phase);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, error: InstanceError) -> InstanceError {
        warn!(phase = %self.phase, error = %error, "Persistence pipeline failed, aborting participants");
        self.abort();
        error
    }
}

fn merge(
    target: &mut ValueMap,
    participant: &str,
    values: impl Iterator<Item = (ValueKey, Value)>,
    entry: fn(Value) -> ValueEntry,
) -> Result<()> {
    for (key, value) in values {
        if target.contains_key(&key) {
            return Err(InstanceError::KeyCollision {
                key,
                participant: participant.to_string(),
            });
        }
        target.insert(key, entry(value));
    }
    Ok(())
}

fn timed_out(participant: &str, phase: &'static str, timeout: Duration) -> InstanceError {
    InstanceError::Timeout {
        participant: participant.to_string(),
        phase,
        timeout,
    }
}

async fn run_on_save(
    participants: &mut [ParticipantMut<'_>],
    values: &ValueMap,
    timeout: Duration,
) -> Result<()> {
    let read_write = values.read_write_view();
    let write_only = values.write_only_view();
    for participant in participants.iter_mut() {
        if let Some(io) = participant.io() {
            let name = io.name().to_string();
            tokio::time::timeout(timeout, io.on_save(&read_write, &write_only, timeout))
                .await
                .map_err(|_| timed_out(&name, "on_save", timeout))??;
        }
    }
    Ok(())
}

async fn run_on_saved(participants: &mut [ParticipantMut<'_>], timeout: Duration) -> Result<()> {
    for participant in participants.iter_mut() {
        if let Some(io) = participant.io() {
            let name = io.name().to_string();
            tokio::time::timeout(timeout, io.on_saved(timeout))
                .await
                .map_err(|_| timed_out(&name, "on_saved", timeout))??;
        }
    }
    Ok(())
}

async fn run_on_load(
    participants: &mut [ParticipantMut<'_>],
    values: &ValueMap,
    timeout: Duration,
) -> Result<()> {
    let read_write = values.read_write_view();
    for participant in participants.iter_mut() {
        if let Some(io) = participant.io() {
            let name = io.name().to_string();
            tokio::time::timeout(timeout, io.on_load(&read_write, timeout))
                .await
                .map_err(|_| timed_out(&name, "on_load", timeout))??;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::{CollectedValues, PersistenceParticipant};
    use crate::values::ValueView;
    use serde_json::json;

    struct Emitter {
        name: &'static str,
        key: ValueKey,
        published: Option<Value>,
    }

    impl Emitter {
        fn new(name: &'static str, namespace: &str) -> Self {
            Self {
                name,
                key: ValueKey::new(namespace, "state"),
                published: None,
            }
        }
    }

    impl PersistenceParticipant for Emitter {
        fn name(&self) -> &str {
            self.name
        }

        fn collect_values(&mut self) -> Result<CollectedValues> {
            Ok(CollectedValues::new()
                .with_read_write(self.key.clone(), json!(self.name))
                .with_write_only(ValueKey::new(self.key.namespace(), "debug"), json!(true)))
        }

        fn map_values(
            &mut self,
            read_write: &ValueView<'_>,
            _write_only: &ValueView<'_>,
        ) -> Result<Vec<(ValueKey, Value)>> {
            let display = read_write
                .get(&self.key)
                .map(|v| json!(format!("state={}", v)))
                .unwrap_or(Value::Null);
            Ok(vec![(ValueKey::new(self.key.namespace(), "display"), display)])
        }

        fn publish_values(&mut self, read_write: &ValueView<'_>) -> Result<()> {
            self.published = read_write.get(&self.key).cloned();
            Ok(())
        }
    }

    #[test]
    fn test_phase_as_str() {
        assert_eq!(PipelinePhase::Created.as_str(), "created");
        assert_eq!(PipelinePhase::Aborted.to_string(), "aborted");
    }

    #[test]
    fn test_collect_and_map() {
        let mut a = Emitter::new("a", "alpha");
        let mut b = Emitter::new("b", "beta");
        let mut pipeline = PersistencePipeline::for_save(
            vec![ParticipantMut::Basic(&mut a), ParticipantMut::Basic(&mut b)],
            ValueMap::new(),
            true,
            Duration::from_secs(1),
        );

        pipeline.collect().unwrap();
        pipeline.map().unwrap();
        assert_eq!(pipeline.phase(), PipelinePhase::Mapped);

        let values = pipeline.into_values();
        assert_eq!(values.len(), 6);
        let display = values.get(&ValueKey::new("alpha", "display")).unwrap();
        assert!(display.is_write_only());
        assert_eq!(display.value, json!("state=\"a\""));
    }

    #[test]
    fn test_write_only_values_dropped_when_disabled() {
        let mut a = Emitter::new("a", "alpha");
        let mut pipeline = PersistencePipeline::for_save(
            vec![ParticipantMut::Basic(&mut a)],
            ValueMap::new(),
            false,
            Duration::from_secs(1),
        );

        pipeline.collect().unwrap();
        assert!(!pipeline.values().contains_key(&ValueKey::new("alpha", "debug")));

        // mapped values are inherently write-only and always kept
        pipeline.map().unwrap();
        assert!(pipeline.values().contains_key(&ValueKey::new("alpha", "display")));
    }

    #[test]
    fn test_collision_leaves_target_untouched() {
        let mut a = Emitter::new("a", "shared");
        let mut b = Emitter::new("b", "shared");
        let mut pipeline = PersistencePipeline::for_save(
            vec![ParticipantMut::Basic(&mut a), ParticipantMut::Basic(&mut b)],
            ValueMap::new(),
            true,
            Duration::from_secs(1),
        );

        let err = pipeline.collect().unwrap_err();
        match err {
            InstanceError::KeyCollision { key, participant } => {
                assert_eq!(key, ValueKey::new("shared", "state"));
                assert_eq!(participant, "b");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(pipeline.values().is_empty());
        assert_eq!(pipeline.phase(), PipelinePhase::Aborted);
    }

    #[test]
    fn test_phases_must_run_in_order() {
        let mut a = Emitter::new("a", "alpha");
        let mut pipeline = PersistencePipeline::for_save(
            vec![ParticipantMut::Basic(&mut a)],
            ValueMap::new(),
            true,
            Duration::from_secs(1),
        );

        let err = pipeline.map().unwrap_err();
        assert!(matches!(
            err,
            InstanceError::PhaseOrder {
                requested: PipelinePhase::Mapped,
                current: PipelinePhase::Created,
            }
        ));
        // out-of-order calls do not abort the run
        assert_eq!(pipeline.phase(), PipelinePhase::Created);
        pipeline.collect().unwrap();
        assert!(pipeline.publish().is_err());
    }

    #[tokio::test]
    async fn test_load_publishes_read_write_values() {
        let mut snapshot = ValueMap::new();
        snapshot.insert(ValueKey::new("alpha", "state"), ValueEntry::read_write(json!("restored")));

        let mut a = Emitter::new("a", "alpha");
        {
            let mut pipeline = PersistencePipeline::for_load(
                vec![ParticipantMut::Basic(&mut a)],
                snapshot,
                Duration::from_secs(1),
            );
            pipeline.on_load().await.unwrap();
            pipeline.publish().unwrap();
            assert_eq!(pipeline.phase(), PipelinePhase::Published);
        }
        assert_eq!(a.published, Some(json!("restored")));
    }
}
