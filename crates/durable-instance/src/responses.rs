// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idempotent response cache.
//!
//! Remembers, per operation name, the response that was delivered (or that
//! the operation was canceled) so a request replayed after a crash observes
//! the same outcome instead of running its side effects again.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{ReplayError, Result};
use crate::participant::{CollectedValues, PersistenceParticipant};
use crate::values::{ValueKey, ValueView};

/// Snapshot namespace of the response cache.
pub const RESPONSES_NAMESPACE: &str = "responses";

const PARTICIPANT_NAME: &str = "responses";

/// Key of the persisted response records.
pub fn responses_key() -> ValueKey {
    ValueKey::new(RESPONSES_NAMESPACE, "previousResponseParameters")
}

/// Recorded outcome of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseRecord {
    /// The operation was canceled.
    Canceled,
    /// A response was sent.
    Sent {
        /// Name of the response type.
        type_name: String,
        /// The response payload.
        value: Value,
    },
}

/// Result of looking up a replayed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    /// Nothing was recorded for the operation.
    UnexpectedOperation(String),
    /// The operation was canceled.
    OperationCanceled(String),
    /// A response of another type was recorded.
    ResponseTypeMismatch {
        /// The operation name.
        operation: String,
        /// Type the caller asked for.
        expected: String,
        /// Type that was recorded.
        actual: String,
    },
    /// The previous response, to be returned again as is.
    Repeated(Value),
}

impl ReplayOutcome {
    /// Returns true if the previous response can be repeated.
    pub fn is_repeated(&self) -> bool {
        matches!(self, Self::Repeated(_))
    }

    /// Convert into the repeated value or the matching [`ReplayError`].
    pub fn into_result(self) -> std::result::Result<Value, ReplayError> {
        match self {
            Self::Repeated(value) => Ok(value),
            Self::UnexpectedOperation(name) => Err(ReplayError::UnexpectedOperation(name)),
            Self::OperationCanceled(name) => Err(ReplayError::OperationCanceled(name)),
            Self::ResponseTypeMismatch {
                operation,
                expected,
                actual,
            } => Err(ReplayError::ResponseTypeMismatch {
                operation,
                expected,
                actual,
            }),
        }
    }
}

/// Per-instance response cache.
#[derive(Debug, Clone, Default)]
pub struct ResponseCache {
    records: BTreeMap<String, ResponseRecord>,
}

impl ResponseCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cancellation unless the operation already has a record.
    ///
    /// Returns whether the cancellation was newly recorded, so the caller
    /// propagates it only once.
    pub fn try_set_canceled(&mut self, operation: &str) -> bool {
        if self.records.contains_key(operation) {
            return false;
        }
        debug!(operation, "Operation canceled");
        self.records
            .insert(operation.to_string(), ResponseRecord::Canceled);
        true
    }

    /// Record a sent response, replacing any previous record.
    pub fn set_response(&mut self, operation: &str, type_name: &str, value: Value) {
        debug!(operation, type_name, "Response recorded");
        self.records.insert(
            operation.to_string(),
            ResponseRecord::Sent {
                type_name: type_name.to_string(),
                value,
            },
        );
    }

    /// Record a typed response under the Rust type name of `T`.
    pub fn set_response_value<T: Serialize>(&mut self, operation: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set_response(operation, std::any::type_name::<T>(), value);
        Ok(())
    }

    /// Look up how a replayed `operation` expecting `expected_type` should be
    /// answered.
    pub fn replay_outcome(&self, operation: &str, expected_type: &str) -> ReplayOutcome {
        match self.records.get(operation) {
            None => ReplayOutcome::UnexpectedOperation(operation.to_string()),
            Some(ResponseRecord::Canceled) => ReplayOutcome::OperationCanceled(operation.to_string()),
            Some(ResponseRecord::Sent { type_name, .. }) if type_name != expected_type => {
                ReplayOutcome::ResponseTypeMismatch {
                    operation: operation.to_string(),
                    expected: expected_type.to_string(),
                    actual: type_name.clone(),
                }
            }
            Some(ResponseRecord::Sent { value, .. }) => ReplayOutcome::Repeated(value.clone()),
        }
    }

    /// Typed replay of a response recorded with [`Self::set_response_value`].
    pub fn replay<T: DeserializeOwned>(&self, operation: &str) -> std::result::Result<T, ReplayError> {
        let value = self
            .replay_outcome(operation, std::any::type_name::<T>())
            .into_result()?;
        serde_json::from_value(value).map_err(|source| ReplayError::Decode {
            operation: operation.to_string(),
            source,
        })
    }

    /// The record of `operation`.
    pub fn get(&self, operation: &str) -> Option<&ResponseRecord> {
        self.records.get(operation)
    }

    /// Number of recorded operations.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl PersistenceParticipant for ResponseCache {
    fn name(&self) -> &str {
        PARTICIPANT_NAME
    }

    fn collect_values(&mut self) -> Result<CollectedValues> {
        if self.records.is_empty() {
            return Ok(CollectedValues::new());
        }
        Ok(CollectedValues::new().with_read_write(responses_key(), serde_json::to_value(&self.records)?))
    }

    fn publish_values(&mut self, read_write: &ValueView<'_>) -> Result<()> {
        self.records = read_write.get_as(&responses_key())?.unwrap_or_default();
        debug!(records = self.records.len(), "Response cache restored");
        Ok(())
    }
}
