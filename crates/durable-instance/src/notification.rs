// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Notification pipeline run when an instance is about to go idle.
//!
//! Participants are paused one at a time in registration order; a later
//! participant may rely on what an earlier one did (reminders are registered
//! before anything collects the resulting bookmark list). The first failure
//! aborts every participant and is returned to the caller.

use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::error::{InstanceError, Result};
use crate::participant::NotificationParticipant;

/// One "about to idle" notification run.
pub struct NotificationPipeline<'p> {
    participants: Vec<&'p mut dyn NotificationParticipant>,
    timeout: Duration,
}

impl<'p> NotificationPipeline<'p> {
    /// Create a run; `timeout` applies to each participant call.
    pub fn new(participants: Vec<&'p mut dyn NotificationParticipant>, timeout: Duration) -> Self {
        Self {
            participants,
            timeout,
        }
    }

    /// Pause every participant sequentially.
    #[instrument(skip(self), fields(participants = self.participants.len()))]
    pub async fn on_paused(&mut self) -> Result<()> {
        let timeout = self.timeout;
        let mut result = Ok(());
        for participant in self.participants.iter_mut() {
            let name = participant.name().to_string();
            debug!(participant = %name, "Pausing participant");
            match tokio::time::timeout(timeout, participant.on_paused(timeout)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    result = Err(e);
                    break;
                }
                Err(_) => {
                    result = Err(InstanceError::Timeout {
                        participant: name,
                        phase: "on_paused",
                        timeout,
                    });
                    break;
                }
            }
        }

        if let Err(e) = result {
            warn!(error = %e, "Notification pipeline failed, aborting participants");
            self.abort();
            return Err(e);
        }
        Ok(())
    }

    /// Abort every participant, swallowing abort failures.
    pub fn abort(&mut self) {
        for participant in self.participants.iter_mut() {
            if let Err(e) = participant.abort() {
                debug!(participant = participant.name(), error = %e, "Participant abort failed");
            }
        }
    }
}
