// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reminder reconciliation.
//!
//! Keeps the host's durable reminders consistent with the bookmarks stored in
//! the instance snapshot, although registering a reminder and writing the
//! snapshot are two separate, non-transactional operations.
//!
//! Two rules make every crash window safe:
//!
//! - a reminder is registered **before** the snapshot that references its
//!   bookmark is written, so a saved bookmark always has a timer;
//! - a reminder is unregistered only **after** the snapshot that no longer
//!   references its bookmark is written. A reminder may therefore fire once
//!   for a bookmark that is gone; resuming such a bookmark is a no-op.
//!
//! # Entry States
//!
//! ```text
//!                   register                     on_paused
//!   (none) ───────────────────▶ RegisterAndSave ───────────▶ RegisteredButNotSaved
//!     ▲                          │      │                            │
//!     │ unregister (no I/O)      │      │ on_saving                  │ on_saving
//!     └──────────────────────────┘      ▼                            ▼
//!                                RegisteredAndSaved ◀──────── (promoted, no I/O)
//!                                       │
//!                           unregister  ▼
//!                                SaveAndUnregister ──on_saved──▶ (none, unregistered)
//! ```
//!
//! | State | Registered externally | In last snapshot |
//! |-------|-----------------------|------------------|
//! | `RegisterAndSave` | no | no |
//! | `ReregisterAndResave` | yes (stale due time) | yes, unless reverted by an abort |
//! | `RegisteredButNotSaved` | yes | no |
//! | `RegisteredButNotResaved` | yes | yes (stale due time) |
//! | `RegisteredAndSaved` | yes | yes |
//! | `SaveAndUnregister` | yes | yes |
//! | `Unregister` | yes | no |

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{InstanceError, Result};
use crate::host::{ExecutionState, InstanceHost};
use crate::participant::{
    CollectedValues, IoParticipant, NotificationParticipant, PersistenceParticipant,
};
use crate::values::{ValueKey, ValueView};

/// Prefix of every bookmark reminder name.
pub const BOOKMARK_REMINDER_PREFIX: &str = "bookmark:";

/// Name of the reactivation marker reminder.
pub const REACTIVATION_REMINDER_NAME: &str = "reactivation";

/// Snapshot namespace of the reminder table.
pub const REMINDERS_NAMESPACE: &str = "reminders";

const PARTICIPANT_NAME: &str = "reminders";

/// Key of the persisted bookmark list.
pub fn bookmarks_key() -> ValueKey {
    ValueKey::new(REMINDERS_NAMESPACE, "bookmarks")
}

/// Key of the write-only state diagnostics.
pub fn states_key() -> ValueKey {
    ValueKey::new(REMINDERS_NAMESPACE, "states")
}

/// Reminder name derived from a bookmark.
pub fn reminder_name(bookmark: &str) -> String {
    format!("{BOOKMARK_REMINDER_PREFIX}{bookmark}")
}

/// Bookmark a reminder name was derived from, if it is a bookmark reminder.
pub fn bookmark_for_reminder(name: &str) -> Option<&str> {
    name.strip_prefix(BOOKMARK_REMINDER_PREFIX)
}

/// Returns true for the reactivation marker.
pub fn is_reactivation_reminder(name: &str) -> bool {
    name == REACTIVATION_REMINDER_NAME
}

/// Lifecycle state of a reminder entry. A missing entry is the
/// `NonExistent` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReminderState {
    /// Requested, not yet registered, not yet saved.
    RegisterAndSave,
    /// Due time changed on a saved reminder; re-register and re-save.
    ReregisterAndResave,
    /// Registered during pause, waiting for the save.
    RegisteredButNotSaved,
    /// Re-registered during pause, waiting for the save.
    RegisteredButNotResaved,
    /// Registered and referenced by the snapshot.
    RegisteredAndSaved,
    /// Saved reminder that must be unregistered once the next save lands.
    SaveAndUnregister,
    /// Never-saved reminder that must be unregistered.
    Unregister,
}

impl ReminderState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegisterAndSave => "RegisterAndSave",
            Self::ReregisterAndResave => "ReregisterAndResave",
            Self::RegisteredButNotSaved => "RegisteredButNotSaved",
            Self::RegisteredButNotResaved => "RegisteredButNotResaved",
            Self::RegisteredAndSaved => "RegisteredAndSaved",
            Self::SaveAndUnregister => "SaveAndUnregister",
            Self::Unregister => "Unregister",
        }
    }

    /// Whether the bookmark survives the next save, i.e. belongs in the
    /// collected bookmark list.
    pub fn is_persisted(&self) -> bool {
        !matches!(self, Self::SaveAndUnregister | Self::Unregister)
    }
}

impl fmt::Display for ReminderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands issued by the hosted program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderCommand {
    /// `register_or_update`
    RegisterOrUpdate,
    /// `unregister`
    Unregister,
}

impl ReminderCommand {
    fn as_str(&self) -> &'static str {
        match self {
            Self::RegisterOrUpdate => "register",
            Self::Unregister => "unregister",
        }
    }
}

/// Effect of a command on an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Create or update the entry in the given state.
    Enter(ReminderState),
    /// Delete the entry without any external call.
    Remove,
    /// Leave the entry as it is.
    Unchanged,
}

/// Transition table for commands. `Err` carries the state that rejects the
/// command.
pub fn transition(
    current: Option<ReminderState>,
    command: ReminderCommand,
) -> std::result::Result<Transition, ReminderState> {
    use ReminderCommand as C;
    use ReminderState as S;

    match (current, command) {
        (None | Some(S::RegisterAndSave | S::Unregister), C::RegisterOrUpdate) => {
            Ok(Transition::Enter(S::RegisterAndSave))
        }
        (Some(S::ReregisterAndResave | S::SaveAndUnregister), C::RegisterOrUpdate) => {
            Ok(Transition::Enter(S::ReregisterAndResave))
        }
        (
            Some(
                state @ (S::RegisteredButNotSaved
                | S::RegisteredButNotResaved
                | S::RegisteredAndSaved),
            ),
            C::RegisterOrUpdate,
        ) => Err(state),

        (None | Some(S::SaveAndUnregister | S::Unregister), C::Unregister) => {
            Ok(Transition::Unchanged)
        }
        (Some(S::RegisterAndSave), C::Unregister) => Ok(Transition::Remove),
        (
            Some(S::ReregisterAndResave | S::RegisteredButNotResaved | S::RegisteredAndSaved),
            C::Unregister,
        ) => Ok(Transition::Enter(S::SaveAndUnregister)),
        (Some(S::RegisteredButNotSaved), C::Unregister) => Ok(Transition::Enter(S::Unregister)),
    }
}

/// One tracked reminder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderEntry {
    /// Bookmark the reminder resumes.
    pub bookmark: String,
    /// When the reminder should fire.
    pub due_at: DateTime<Utc>,
    /// Lifecycle state.
    pub state: ReminderState,
}

impl ReminderEntry {
    /// Time left until the reminder is due, zero if overdue.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.due_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Persisted form of a reminder entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedReminder {
    /// Bookmark the reminder resumes.
    pub bookmark: String,
    /// When the reminder should fire.
    pub due_at: DateTime<Utc>,
}

fn due_at(now: DateTime<Utc>, due_time: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(due_time)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Reminder table of one instance.
///
/// Entries are keyed by reminder name (see [`reminder_name`]). The table is
/// a persistence participant (bookmark list, save hooks) and a notification
/// participant (registration during pause).
pub struct ReminderTable {
    host: Arc<dyn InstanceHost>,
    entries: BTreeMap<String, ReminderEntry>,
    reactivation_registered: bool,
}

impl ReminderTable {
    /// Create an empty table backed by `host`.
    pub fn new(host: Arc<dyn InstanceHost>) -> Self {
        Self {
            host,
            entries: BTreeMap::new(),
            reactivation_registered: false,
        }
    }

    /// State of the entry for `bookmark`, `None` if it does not exist.
    pub fn state(&self, bookmark: &str) -> Option<ReminderState> {
        self.entries.get(&reminder_name(bookmark)).map(|e| e.state)
    }

    /// Entry for `bookmark`.
    pub fn entry(&self, bookmark: &str) -> Option<&ReminderEntry> {
        self.entries.get(&reminder_name(bookmark))
    }

    /// Every entry, in reminder name order.
    pub fn entries(&self) -> impl Iterator<Item = &ReminderEntry> {
        self.entries.values()
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entries are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the reactivation marker is believed to be registered.
    pub fn is_reactivation_registered(&self) -> bool {
        self.reactivation_registered
    }

    /// Request a reminder for `bookmark` due after `due_time`.
    pub fn register_or_update(&mut self, bookmark: &str, due_time: Duration) -> Result<()> {
        let name = reminder_name(bookmark);
        let current = self.entries.get(&name).map(|e| e.state);
        match self.apply(&name, bookmark, current, ReminderCommand::RegisterOrUpdate)? {
            Transition::Enter(state) => {
                let due = due_at(Utc::now(), due_time);
                debug!(bookmark, ?current, next = %state, "Reminder requested");
                self.entries.insert(
                    name,
                    ReminderEntry {
                        bookmark: bookmark.to_string(),
                        due_at: due,
                        state,
                    },
                );
            }
            Transition::Remove | Transition::Unchanged => {}
        }
        Ok(())
    }

    /// Cancel the reminder for `bookmark`.
    pub fn unregister(&mut self, bookmark: &str) -> Result<()> {
        let name = reminder_name(bookmark);
        let current = self.entries.get(&name).map(|e| e.state);
        match self.apply(&name, bookmark, current, ReminderCommand::Unregister)? {
            Transition::Enter(state) => {
                debug!(bookmark, ?current, next = %state, "Reminder cancellation requested");
                if let Some(entry) = self.entries.get_mut(&name) {
                    entry.state = state;
                }
            }
            Transition::Remove => {
                debug!(bookmark, "Reminder dropped before registration");
                self.entries.remove(&name);
            }
            Transition::Unchanged => {}
        }
        Ok(())
    }

    fn apply(
        &self,
        name: &str,
        bookmark: &str,
        current: Option<ReminderState>,
        command: ReminderCommand,
    ) -> Result<Transition> {
        transition(current, command).map_err(|state| {
            warn!(reminder = name, %state, command = command.as_str(), "Invalid reminder transition");
            InstanceError::InvalidReminderTransition {
                bookmark: bookmark.to_string(),
                state,
                operation: command.as_str(),
            }
        })
    }

    fn invariant(entry: &ReminderEntry, phase: &'static str) -> InstanceError {
        InstanceError::ReminderInvariant {
            bookmark: entry.bookmark.clone(),
            state: entry.state,
            phase,
        }
    }

    fn names_in(&self, states: &[ReminderState]) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| states.contains(&e.state))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn has_confirmed_reminder(&self) -> bool {
        self.entries
            .values()
            .any(|e| e.state == ReminderState::RegisteredAndSaved)
    }

    /// Register pending reminders while the instance is about to go idle.
    ///
    /// Fails with [`InstanceError::ReminderInvariant`] before any external
    /// call if an entry is still waiting for the previous save.
    #[instrument(skip(self), fields(entries = self.entries.len()))]
    pub async fn on_paused(&mut self) -> Result<()> {
        if let Some(entry) = self.entries.values().find(|e| {
            matches!(
                e.state,
                ReminderState::RegisteredButNotSaved | ReminderState::RegisteredButNotResaved
            )
        }) {
            return Err(Self::invariant(entry, "on_paused"));
        }

        let pending = self.names_in(&[
            ReminderState::RegisterAndSave,
            ReminderState::ReregisterAndResave,
            ReminderState::Unregister,
        ]);
        for name in pending {
            let Some(entry) = self.entries.get(&name) else {
                continue;
            };
            match entry.state {
                ReminderState::RegisterAndSave | ReminderState::ReregisterAndResave => {
                    let next = if entry.state == ReminderState::RegisterAndSave {
                        ReminderState::RegisteredButNotSaved
                    } else {
                        ReminderState::RegisteredButNotResaved
                    };
                    let remaining = entry.remaining(Utc::now());
                    self.host
                        .register_or_update_reminder(&name, remaining)
                        .await?;
                    if let Some(entry) = self.entries.get_mut(&name) {
                        entry.state = next;
                    }
                    debug!(reminder = %name, ?remaining, "Reminder registered on pause");
                }
                ReminderState::Unregister => {
                    self.host.unregister_reminder(&name).await?;
                    self.entries.remove(&name);
                    debug!(reminder = %name, "Unsaved reminder unregistered on pause");
                }
                ReminderState::RegisteredButNotSaved
                | ReminderState::RegisteredButNotResaved
                | ReminderState::RegisteredAndSaved
                | ReminderState::SaveAndUnregister => {
                    return Err(Self::invariant(entry, "on_paused"));
                }
            }
        }
        Ok(())
    }

    /// Confirm registrations right before the snapshot is written.
    ///
    /// Registers anything `on_paused` did not reach, promotes paused
    /// registrations to `RegisteredAndSaved` and registers the reactivation
    /// marker if the instance is runnable without any confirmed reminder.
    #[instrument(skip(self), fields(entries = self.entries.len()))]
    pub async fn on_saving(&mut self) -> Result<()> {
        let pending = self.names_in(&[
            ReminderState::RegisterAndSave,
            ReminderState::ReregisterAndResave,
            ReminderState::RegisteredButNotSaved,
            ReminderState::RegisteredButNotResaved,
            ReminderState::Unregister,
        ]);
        for name in pending {
            let Some(entry) = self.entries.get(&name) else {
                continue;
            };
            match entry.state {
                ReminderState::RegisterAndSave | ReminderState::ReregisterAndResave => {
                    let remaining = entry.remaining(Utc::now());
                    self.host
                        .register_or_update_reminder(&name, remaining)
                        .await?;
                    if let Some(entry) = self.entries.get_mut(&name) {
                        entry.state = ReminderState::RegisteredAndSaved;
                    }
                    debug!(reminder = %name, ?remaining, "Reminder registered on save");
                }
                ReminderState::RegisteredButNotSaved | ReminderState::RegisteredButNotResaved => {
                    if let Some(entry) = self.entries.get_mut(&name) {
                        entry.state = ReminderState::RegisteredAndSaved;
                    }
                }
                ReminderState::Unregister => {
                    self.host.unregister_reminder(&name).await?;
                    self.entries.remove(&name);
                    debug!(reminder = %name, "Unsaved reminder unregistered on save");
                }
                ReminderState::RegisteredAndSaved | ReminderState::SaveAndUnregister => {
                    return Err(Self::invariant(entry, "on_saving"));
                }
            }
        }

        self.reconcile_reactivation(true, false).await
    }

    /// Release cancelled reminders once the snapshot was durably written.
    #[instrument(skip(self), fields(entries = self.entries.len()))]
    pub async fn on_saved(&mut self) -> Result<()> {
        for name in self.names_in(&[ReminderState::SaveAndUnregister]) {
            self.host.unregister_reminder(&name).await?;
            self.entries.remove(&name);
            debug!(reminder = %name, "Reminder unregistered after save");
        }

        self.reconcile_reactivation(false, true).await
    }

    /// Rebuild the table from a snapshot and reconcile it with the host.
    ///
    /// Bookmark reminders the snapshot does not know about are unregistered
    /// (registered but never saved, or left behind by a crash); snapshot
    /// bookmarks without a live reminder are registered again.
    #[instrument(skip(self, persisted), fields(bookmarks = persisted.len()))]
    pub async fn load(&mut self, persisted: Vec<PersistedReminder>) -> Result<()> {
        self.entries = persisted
            .into_iter()
            .map(|p| {
                (
                    reminder_name(&p.bookmark),
                    ReminderEntry {
                        bookmark: p.bookmark,
                        due_at: p.due_at,
                        state: ReminderState::RegisteredAndSaved,
                    },
                )
            })
            .collect();

        let live = self.host.list_reminders().await?;
        self.reactivation_registered = false;
        for name in &live {
            if is_reactivation_reminder(name) {
                self.reactivation_registered = true;
            } else if bookmark_for_reminder(name).is_some() && !self.entries.contains_key(name) {
                info!(reminder = %name, "Unregistering reminder not referenced by the snapshot");
                self.host.unregister_reminder(name).await?;
            }
        }

        let now = Utc::now();
        for (name, entry) in &self.entries {
            if !live.contains(name) {
                let remaining = entry.remaining(now);
                info!(reminder = %name, ?remaining, "Re-registering missing reminder");
                self.host
                    .register_or_update_reminder(name, remaining)
                    .await?;
            }
        }

        self.reconcile_reactivation(true, true).await
    }

    async fn reconcile_reactivation(
        &mut self,
        allow_register: bool,
        allow_unregister: bool,
    ) -> Result<()> {
        let runnable = self.host.current_execution_state() == ExecutionState::Runnable;
        let needed = runnable && !self.has_confirmed_reminder();

        if needed && !self.reactivation_registered && allow_register {
            let period = self.host.reactivation_period();
            self.host
                .register_or_update_reminder(REACTIVATION_REMINDER_NAME, period)
                .await?;
            self.reactivation_registered = true;
            info!(?period, "Reactivation marker registered");
        } else if !needed && self.reactivation_registered && allow_unregister {
            self.host
                .unregister_reminder(REACTIVATION_REMINDER_NAME)
                .await?;
            self.reactivation_registered = false;
            info!("Reactivation marker unregistered");
        }
        Ok(())
    }

    /// Undo paused registrations that never reached a save.
    ///
    /// The reminders stay registered externally, so both states revert to
    /// `ReregisterAndResave`: the next pause registers them again as an
    /// update, and a cancellation goes through `SaveAndUnregister` and
    /// reaches the host.
    pub fn revert_paused(&mut self) {
        for entry in self.entries.values_mut() {
            let reverted = match entry.state {
                ReminderState::RegisteredButNotSaved | ReminderState::RegisteredButNotResaved => {
                    ReminderState::ReregisterAndResave
                }
                _ => continue,
            };
            debug!(bookmark = %entry.bookmark, from = %entry.state, to = %reverted, "Reverting paused reminder");
            entry.state = reverted;
        }
    }

    fn persisted(&self) -> Vec<PersistedReminder> {
        self.entries
            .values()
            .filter(|e| e.state.is_persisted())
            .map(|e| PersistedReminder {
                bookmark: e.bookmark.clone(),
                due_at: e.due_at,
            })
            .collect()
    }
}

impl fmt::Debug for ReminderTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReminderTable")
            .field("entries", &self.entries)
            .field("reactivation_registered", &self.reactivation_registered)
            .finish()
    }
}

impl PersistenceParticipant for ReminderTable {
    fn name(&self) -> &str {
        PARTICIPANT_NAME
    }

    fn collect_values(&mut self) -> Result<CollectedValues> {
        let states: BTreeMap<&str, &str> = self
            .entries
            .values()
            .map(|e| (e.bookmark.as_str(), e.state.as_str()))
            .collect();
        Ok(CollectedValues::new()
            .with_read_write(bookmarks_key(), serde_json::to_value(self.persisted())?)
            .with_write_only(states_key(), serde_json::to_value(states)?))
    }
}

#[async_trait]
impl IoParticipant for ReminderTable {
    async fn on_save(
        &mut self,
        _read_write: &ValueView<'_>,
        _write_only: &ValueView<'_>,
        _timeout: Duration,
    ) -> Result<()> {
        self.on_saving().await
    }

    async fn on_saved(&mut self, _timeout: Duration) -> Result<()> {
        ReminderTable::on_saved(self).await
    }

    async fn on_load(&mut self, read_write: &ValueView<'_>, _timeout: Duration) -> Result<()> {
        let persisted: Vec<PersistedReminder> =
            read_write.get_as(&bookmarks_key())?.unwrap_or_default();
        self.load(persisted).await
    }

    fn abort(&mut self) -> Result<()> {
        self.revert_paused();
        Ok(())
    }
}

#[async_trait]
impl NotificationParticipant for ReminderTable {
    fn name(&self) -> &str {
        PARTICIPANT_NAME
    }

    async fn on_paused(&mut self, _timeout: Duration) -> Result<()> {
        ReminderTable::on_paused(self).await
    }

    fn abort(&mut self) -> Result<()> {
        self.revert_paused();
        Ok(())
    }
}
