// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Default reactivation marker period in seconds.
pub const DEFAULT_REACTIVATION_PERIOD_SECS: u64 = 60;

/// Default per-participant phase timeout in milliseconds.
pub const DEFAULT_PHASE_TIMEOUT_MS: u64 = 30_000;

/// Environment variable holding the instance id.
pub const INSTANCE_ID_VAR: &str = "DURABLE_INSTANCE_ID";

/// Durable instance configuration
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Identity of the instance in the snapshot store
    pub instance_id: String,
    /// Due time of the reactivation marker reminder.
    ///
    /// The reminder table asks the host for the period, so this is read by
    /// host implementations (see `MockHost::from_config`), not by the
    /// pipelines.
    pub reactivation_period: Duration,
    /// Timeout applied to every async participant call
    pub phase_timeout: Duration,
    /// Whether collected write-only values are persisted
    pub persist_write_only_values: bool,
}

impl InstanceConfig {
    /// Create a configuration with default settings.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            reactivation_period: Duration::from_secs(DEFAULT_REACTIVATION_PERIOD_SECS),
            phase_timeout: Duration::from_millis(DEFAULT_PHASE_TIMEOUT_MS),
            persist_write_only_values: true,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DURABLE_INSTANCE_ID`: instance identity
    ///
    /// Optional (with defaults):
    /// - `DURABLE_REACTIVATION_PERIOD_SECS`: reactivation marker period (default: 60)
    /// - `DURABLE_PHASE_TIMEOUT_MS`: per-participant phase timeout (default: 30000)
    /// - `DURABLE_PERSIST_WRITE_ONLY_VALUES`: persist write-only values (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let instance_id = std::env::var(INSTANCE_ID_VAR)
            .map_err(|_| ConfigError::Missing(INSTANCE_ID_VAR))?;
        Self::from_env_with_instance_id(instance_id)
    }

    /// Load the optional settings from environment variables for a known
    /// instance id.
    pub fn from_env_with_instance_id(instance_id: impl Into<String>) -> Result<Self, ConfigError> {
        let instance_id = instance_id.into();

        let reactivation_secs: u64 = std::env::var("DURABLE_REACTIVATION_PERIOD_SECS")
            .unwrap_or_else(|_| DEFAULT_REACTIVATION_PERIOD_SECS.to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "DURABLE_REACTIVATION_PERIOD_SECS",
                    "must be a non-negative integer",
                )
            })?;
        if reactivation_secs == 0 {
            return Err(ConfigError::Invalid(
                "DURABLE_REACTIVATION_PERIOD_SECS",
                "must be greater than zero",
            ));
        }

        let phase_timeout_ms: u64 = std::env::var("DURABLE_PHASE_TIMEOUT_MS")
            .unwrap_or_else(|_| DEFAULT_PHASE_TIMEOUT_MS.to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("DURABLE_PHASE_TIMEOUT_MS", "must be a non-negative integer")
            })?;

        let persist_write_only_values = match std::env::var("DURABLE_PERSIST_WRITE_ONLY_VALUES") {
            Err(_) => true,
            Ok(v) => match v.as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => {
                    return Err(ConfigError::Invalid(
                        "DURABLE_PERSIST_WRITE_ONLY_VALUES",
                        "must be true, false, 1 or 0",
                    ));
                }
            },
        };

        Ok(Self {
            instance_id,
            reactivation_period: Duration::from_secs(reactivation_secs),
            phase_timeout: Duration::from_millis(phase_timeout_ms),
            persist_write_only_values,
        })
    }

    /// Set the reactivation marker period.
    pub fn with_reactivation_period(mut self, period: Duration) -> Self {
        self.reactivation_period = period;
        self
    }

    /// Set the per-participant phase timeout.
    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    /// Set whether write-only values are persisted.
    pub fn with_persist_write_only_values(mut self, persist: bool) -> Self {
        self.persist_write_only_values = persist;
        self
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),

    /// A builder was finished without a required component.
    #[error("missing required component: {0}")]
    MissingComponent(&'static str),
}
