// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable instance orchestration.
//!
//! Owns the per-instance state (reminder table, response cache, extra
//! participants, last committed snapshot) and drives the pipelines around
//! activation and the idle transition:
//!
//! ```text
//! activate:  load snapshot ─▶ on_load ─▶ publish
//! idle:      on_paused ─▶ collect ─▶ map ─▶ on_save ─▶ save snapshot ─▶ on_saved
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, InstanceConfig};
use crate::error::Result;
use crate::host::InstanceHost;
use crate::notification::NotificationPipeline;
use crate::participant::{NotificationParticipant, Participant, ParticipantMut};
use crate::pipeline::PersistencePipeline;
use crate::reminders::{self, ReminderTable};
use crate::responses::ResponseCache;
use crate::store::SnapshotStore;
use crate::values::ValueMap;

/// What a fired reminder resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiredReminder {
    /// Resume the given bookmark.
    Bookmark(String),
    /// The reactivation marker fired; the instance should continue running.
    Reactivation,
    /// The reminder no longer refers to anything. Ignore it.
    Stale,
}

/// One hosted execution instance.
pub struct DurableInstance {
    config: InstanceConfig,
    store: Arc<dyn SnapshotStore>,
    reminders: ReminderTable,
    responses: ResponseCache,
    extensions: Vec<Participant>,
    notifications: Vec<Box<dyn NotificationParticipant>>,
    snapshot: ValueMap,
}

impl DurableInstance {
    /// Create a new builder.
    pub fn builder() -> DurableInstanceBuilder {
        DurableInstanceBuilder::new()
    }

    /// Instance identity.
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Active configuration.
    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// The reminder table.
    pub fn reminders(&self) -> &ReminderTable {
        &self.reminders
    }

    /// The reminder table, for registering and cancelling reminders.
    pub fn reminders_mut(&mut self) -> &mut ReminderTable {
        &mut self.reminders
    }

    /// The response cache.
    pub fn responses(&self) -> &ResponseCache {
        &self.responses
    }

    /// The response cache, for recording responses.
    pub fn responses_mut(&mut self) -> &mut ResponseCache {
        &mut self.responses
    }

    /// The last snapshot loaded or committed.
    pub fn snapshot(&self) -> &ValueMap {
        &self.snapshot
    }

    fn timeout(&self) -> Duration {
        self.config.phase_timeout
    }

    /// Load the stored snapshot and rehydrate every participant.
    ///
    /// A missing snapshot (first activation) still runs the load phases over
    /// an empty map, which reconciles the host's reminders with an empty
    /// table.
    #[instrument(skip(self), fields(instance_id = %self.config.instance_id))]
    pub async fn activate(&mut self) -> Result<()> {
        let snapshot = match self.store.load_snapshot(&self.config.instance_id).await? {
            Some(snapshot) => {
                info!(values = snapshot.len(), "Restoring instance from snapshot");
                snapshot
            }
            None => {
                info!("No snapshot found, activating fresh instance");
                ValueMap::new()
            }
        };

        let timeout = self.timeout();
        let mut pipeline = PersistencePipeline::for_load(
            persistence_participants(&mut self.reminders, &mut self.responses, &mut self.extensions),
            snapshot,
            timeout,
        );
        pipeline.on_load().await?;
        pipeline.publish()?;
        self.snapshot = pipeline.into_values();
        debug!(reminders = self.reminders.len(), responses = self.responses.len(), "Instance activated");
        Ok(())
    }

    /// Run the idle transition and commit a new snapshot.
    ///
    /// Any failure aborts the participants of the running pipeline and is
    /// returned; the previously committed snapshot stays in place unless the
    /// store write itself succeeded.
    #[instrument(skip(self), fields(instance_id = %self.config.instance_id))]
    pub async fn idle(&mut self) -> Result<()> {
        let timeout = self.timeout();

        {
            let mut participants: Vec<&mut dyn NotificationParticipant> = vec![&mut self.reminders];
            participants.extend(
                self.notifications
                    .iter_mut()
                    .map(|p| &mut **p as &mut dyn NotificationParticipant),
            );
            NotificationPipeline::new(participants, timeout)
                .on_paused()
                .await?;
        }

        let mut pipeline = PersistencePipeline::for_save(
            persistence_participants(&mut self.reminders, &mut self.responses, &mut self.extensions),
            ValueMap::new(),
            self.config.persist_write_only_values,
            timeout,
        );
        pipeline.collect()?;
        pipeline.map()?;
        pipeline.on_save().await?;

        let committed = pipeline.values().clone();
        if let Err(e) = self
            .store
            .save_snapshot(&self.config.instance_id, &committed)
            .await
        {
            warn!(error = %e, "Snapshot write failed, aborting participants");
            pipeline.abort();
            return Err(e);
        }
        info!(values = committed.len(), "Snapshot committed");
        self.snapshot = committed;

        pipeline.on_saved().await
    }

    /// Resolve a fired reminder.
    ///
    /// A bookmark reminder whose bookmark is no longer tracked (or is being
    /// cancelled) resolves to [`FiredReminder::Stale`].
    pub fn reminder_fired(&self, name: &str) -> FiredReminder {
        if reminders::is_reactivation_reminder(name) {
            return FiredReminder::Reactivation;
        }
        match reminders::bookmark_for_reminder(name) {
            Some(bookmark)
                if self
                    .reminders
                    .state(bookmark)
                    .is_some_and(|state| state.is_persisted()) =>
            {
                FiredReminder::Bookmark(bookmark.to_string())
            }
            _ => {
                debug!(reminder = name, "Ignoring stale reminder");
                FiredReminder::Stale
            }
        }
    }
}

impl std::fmt::Debug for DurableInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableInstance")
            .field("instance_id", &self.config.instance_id)
            .field("reminders", &self.reminders)
            .field("responses", &self.responses.len())
            .field("extensions", &self.extensions)
            .finish()
    }
}

fn persistence_participants<'a>(
    reminders: &'a mut ReminderTable,
    responses: &'a mut ResponseCache,
    extensions: &'a mut [Participant],
) -> Vec<ParticipantMut<'a>> {
    let mut participants = vec![ParticipantMut::Io(reminders), ParticipantMut::Basic(responses)];
    participants.extend(extensions.iter_mut().map(Participant::as_participant_mut));
    participants
}

/// Builder for creating a [`DurableInstance`].
///
/// The reminder table and the response cache are always registered first,
/// in that order; participants added here run after them.
#[derive(Default)]
pub struct DurableInstanceBuilder {
    config: Option<InstanceConfig>,
    host: Option<Arc<dyn InstanceHost>>,
    store: Option<Arc<dyn SnapshotStore>>,
    extensions: Vec<Participant>,
    notifications: Vec<Box<dyn NotificationParticipant>>,
}

impl std::fmt::Debug for DurableInstanceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableInstanceBuilder")
            .field("config", &self.config)
            .field("host", &self.host.is_some())
            .field("store", &self.store.is_some())
            .field("extensions", &self.extensions)
            .field("notifications", &self.notifications.len())
            .finish()
    }
}

impl DurableInstanceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: InstanceConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the hosting instance (required).
    pub fn host(mut self, host: Arc<dyn InstanceHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Set the snapshot store (required).
    pub fn store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Add a persistence participant.
    pub fn participant(mut self, participant: Participant) -> Self {
        self.extensions.push(participant);
        self
    }

    /// Add a notification participant, paused after the reminder table.
    pub fn notification_participant(
        mut self,
        participant: impl NotificationParticipant + 'static,
    ) -> Self {
        self.notifications.push(Box::new(participant));
        self
    }

    /// Build the instance. Call [`DurableInstance::activate`] before use.
    pub fn build(self) -> Result<DurableInstance> {
        let config = self.config.ok_or(ConfigError::MissingComponent("config"))?;
        let host = self.host.ok_or(ConfigError::MissingComponent("host"))?;
        let store = self.store.ok_or(ConfigError::MissingComponent("store"))?;

        Ok(DurableInstance {
            config,
            store,
            reminders: ReminderTable::new(host),
            responses: ResponseCache::new(),
            extensions: self.extensions,
            notifications: self.notifications,
            snapshot: ValueMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InstanceError;
    use crate::host::mock::MockHost;
    use crate::store::MemorySnapshotStore;

    fn instance(host: &Arc<MockHost>, store: &Arc<MemorySnapshotStore>) -> DurableInstance {
        DurableInstance::builder()
            .config(InstanceConfig::new("inst-1"))
            .host(host.clone())
            .store(store.clone())
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_components() {
        let err = DurableInstance::builder()
            .config(InstanceConfig::new("inst-1"))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            InstanceError::Config(ConfigError::MissingComponent("host"))
        ));

        let builder = DurableInstance::builder().host(Arc::new(MockHost::new()));
        assert!(format!("{:?}", builder).contains("DurableInstanceBuilder"));
    }

    #[tokio::test]
    async fn test_reminder_fired_resolution() {
        let host = Arc::new(MockHost::new());
        let store = Arc::new(MemorySnapshotStore::new());
        let mut instance = instance(&host, &store);
        instance.activate().await.unwrap();

        instance
            .reminders_mut()
            .register_or_update("approval", Duration::from_secs(5))
            .unwrap();
        instance.idle().await.unwrap();

        assert_eq!(
            instance.reminder_fired("bookmark:approval"),
            FiredReminder::Bookmark("approval".to_string())
        );
        assert_eq!(
            instance.reminder_fired("reactivation"),
            FiredReminder::Reactivation
        );
        assert_eq!(
            instance.reminder_fired("bookmark:gone"),
            FiredReminder::Stale
        );

        instance.reminders_mut().unregister("approval").unwrap();
        assert_eq!(
            instance.reminder_fired("bookmark:approval"),
            FiredReminder::Stale
        );
    }
}
