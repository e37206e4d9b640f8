// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for durable-instance.
//!
//! [`InstanceError`] covers everything that can fail while an instance is
//! activated, paused or saved. Replayed external requests do not fail through
//! this type; they are answered with a [`crate::responses::ReplayOutcome`] or,
//! for typed callers, a [`ReplayError`].

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::pipeline::PipelinePhase;
use crate::reminders::ReminderState;
use crate::values::ValueKey;

/// Result type using InstanceError
pub type Result<T> = std::result::Result<T, InstanceError>;

/// Errors raised by the persistence, notification and reminder machinery.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InstanceError {
    /// Two participants (or one participant twice) contributed the same key.
    #[error("persistence key '{key}' from participant '{participant}' collides with an existing value")]
    KeyCollision {
        /// The colliding key.
        key: ValueKey,
        /// The participant whose contribution collided.
        participant: String,
    },

    /// A mutation was attempted through a read-only value view.
    #[error("value view is read-only, cannot modify '{key}'")]
    ImmutableView {
        /// The key the caller tried to modify.
        key: ValueKey,
    },

    /// `register_or_update` / `unregister` hit a state that does not allow it.
    #[error("cannot {operation} reminder for bookmark '{bookmark}' in state {state}")]
    InvalidReminderTransition {
        /// Bookmark the reminder belongs to.
        bookmark: String,
        /// Current state of the reminder entry.
        state: ReminderState,
        /// The requested operation.
        operation: &'static str,
    },

    /// A reminder entry reached a phase in a state that phase never expects.
    #[error("reminder for bookmark '{bookmark}' reached {phase} in state {state}")]
    ReminderInvariant {
        /// Bookmark the reminder belongs to.
        bookmark: String,
        /// Current state of the reminder entry.
        state: ReminderState,
        /// The phase that observed the state.
        phase: &'static str,
    },

    /// A pipeline phase was invoked out of order.
    #[error("pipeline phase {requested} cannot run after {current}")]
    PhaseOrder {
        /// The phase the caller tried to run.
        requested: PipelinePhase,
        /// The phase the pipeline last completed.
        current: PipelinePhase,
    },

    /// A participant did not finish a phase call in time.
    #[error("participant '{participant}' timed out after {timeout:?} during {phase}")]
    Timeout {
        /// The participant that timed out.
        participant: String,
        /// The phase being executed.
        phase: &'static str,
        /// The timeout that applied to the call.
        timeout: Duration,
    },

    /// A participant reported a failure of its own.
    #[error("participant '{participant}' failed: {message}")]
    Participant {
        /// The failing participant.
        participant: String,
        /// Failure description.
        message: String,
    },

    /// A call into the hosting instance (reminder service) failed.
    #[error("host error during '{operation}': {details}")]
    Host {
        /// The host operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The snapshot store failed.
    #[error("snapshot store error during '{operation}': {details}")]
    Store {
        /// The store operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A persisted value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Instance configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl InstanceError {
    /// Build a [`InstanceError::Participant`] error.
    pub fn participant(participant: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Participant {
            participant: participant.into(),
            message: message.into(),
        }
    }

    /// Build a [`InstanceError::Host`] error.
    pub fn host(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::Host {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Build a [`InstanceError::Store`] error.
    pub fn store(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::Store {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::KeyCollision { .. } => "PERSISTENCE_KEY_COLLISION",
            Self::ImmutableView { .. } => "IMMUTABLE_VIEW",
            Self::InvalidReminderTransition { .. } => "INVALID_REMINDER_TRANSITION",
            Self::ReminderInvariant { .. } => "REMINDER_INVARIANT_VIOLATION",
            Self::PhaseOrder { .. } => "PHASE_ORDER",
            Self::Timeout { .. } => "PARTICIPANT_TIMEOUT",
            Self::Participant { .. } => "PARTICIPANT_FAILED",
            Self::Host { .. } => "HOST_ERROR",
            Self::Store { .. } => "STORE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Protocol and invariant violations are fatal and must not be retried.
    ///
    /// Everything else is an external failure the host may retry from the
    /// same phase.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::KeyCollision { .. }
                | Self::ImmutableView { .. }
                | Self::InvalidReminderTransition { .. }
                | Self::ReminderInvariant { .. }
                | Self::PhaseOrder { .. }
                | Self::Serialization(_)
                | Self::Config(_)
        )
    }
}

/// Typed replay failures returned by [`crate::responses::ResponseCache::replay`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReplayError {
    /// No response was ever recorded for the operation.
    #[error("operation '{0}' was not expected: no previous response recorded")]
    UnexpectedOperation(String),

    /// The operation was canceled before a response was sent.
    #[error("operation '{0}' was canceled")]
    OperationCanceled(String),

    /// The recorded response has a different type than the caller expects.
    #[error("operation '{operation}' previously responded with '{actual}', expected '{expected}'")]
    ResponseTypeMismatch {
        /// The operation name.
        operation: String,
        /// The type the caller expects.
        expected: String,
        /// The type that was recorded.
        actual: String,
    },

    /// The recorded response could not be decoded into the expected type.
    #[error("failed to decode previous response of '{operation}': {source}")]
    Decode {
        /// The operation name.
        operation: String,
        /// The decoding error.
        #[source]
        source: serde_json::Error,
    },
}
