// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable Instance Simulator
//!
//! Drives one instance against the in-process host and snapshot store:
//!
//! 1. a reminder is registered, paused, saved and confirmed;
//! 2. a response is recorded, the instance "crashes" and is reactivated,
//!    and the replayed request observes the recorded response.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{error, info};

use durable_instance::config::INSTANCE_ID_VAR;
use durable_instance::host::mock::{MockHost, ReminderCall};
use durable_instance::reminders::reminder_name;
use durable_instance::{
    DurableInstance, InstanceConfig, MemorySnapshotStore, ReminderState, ReplayOutcome,
};

const BOOKMARK: &str = "R1";
const OPERATION: &str = "Greet";
const RESPONSE_TYPE: &str = "string";

fn load_config() -> Result<InstanceConfig> {
    let config = if std::env::var(INSTANCE_ID_VAR).is_ok() {
        InstanceConfig::from_env()
    } else {
        let instance_id = uuid::Uuid::new_v4().to_string();
        info!(%instance_id, "{} not set, using a generated instance id", INSTANCE_ID_VAR);
        InstanceConfig::from_env_with_instance_id(instance_id)
    };
    config.map_err(|e| {
        error!("Configuration error: {}", e);
        e.into()
    })
}

fn build_instance(
    config: &InstanceConfig,
    host: &Arc<MockHost>,
    store: &Arc<MemorySnapshotStore>,
) -> Result<DurableInstance> {
    Ok(DurableInstance::builder()
        .config(config.clone())
        .host(host.clone())
        .store(store.clone())
        .build()?)
}

async fn reminder_lifecycle(
    config: &InstanceConfig,
    host: &Arc<MockHost>,
    store: &Arc<MemorySnapshotStore>,
) -> Result<()> {
    info!("Scenario A: reminder lifecycle");
    let mut instance = build_instance(config, host, store)?;
    instance.activate().await?;
    host.clear_calls();

    instance
        .reminders_mut()
        .register_or_update(BOOKMARK, Duration::from_secs(5))?;
    instance.idle().await?;

    let state = instance.reminders().state(BOOKMARK);
    if state != Some(ReminderState::RegisteredAndSaved) {
        bail!("unexpected reminder state after save: {:?}", state);
    }
    let unregistered = host
        .calls()
        .iter()
        .any(|call| matches!(call, ReminderCall::Unregister { .. }));
    if unregistered {
        bail!("reminder was unregistered during the save");
    }
    info!(
        bookmark = BOOKMARK,
        due_time = ?host.due_time(&reminder_name(BOOKMARK)),
        calls = host.calls().len(),
        "Reminder registered and saved"
    );
    Ok(())
}

async fn response_replay(
    config: &InstanceConfig,
    host: &Arc<MockHost>,
    store: &Arc<MemorySnapshotStore>,
) -> Result<()> {
    info!("Scenario C: response replay across reactivation");
    {
        let mut instance = build_instance(config, host, store)?;
        instance.activate().await?;
        instance
            .responses_mut()
            .set_response(OPERATION, RESPONSE_TYPE, serde_json::json!("hi"));
        instance.idle().await?;
        info!(operation = OPERATION, "Response recorded, dropping instance");
    }

    let mut instance = build_instance(config, host, store)?;
    instance.activate().await?;
    match instance.responses().replay_outcome(OPERATION, RESPONSE_TYPE) {
        ReplayOutcome::Repeated(value) => {
            info!(operation = OPERATION, %value, "Replayed request observed previous response");
            Ok(())
        }
        other => bail!("unexpected replay outcome: {:?}", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("durable_instance=info".parse()?),
        )
        .init();

    info!("Starting Durable Instance Simulator");

    let config = load_config()?;
    info!(
        instance_id = %config.instance_id,
        reactivation_period = ?config.reactivation_period,
        phase_timeout = ?config.phase_timeout,
        persist_write_only_values = config.persist_write_only_values,
        "Configuration loaded"
    );

    let host = Arc::new(MockHost::from_config(&config));
    let store = Arc::new(MemorySnapshotStore::new());

    reminder_lifecycle(&config, &host, &store)
        .await
        .context("reminder lifecycle scenario failed")?;
    response_replay(&config, &host, &store)
        .await
        .context("response replay scenario failed")?;

    info!(
        snapshots = store.save_count(),
        live_reminders = ?host.live_reminders(),
        "Simulation complete"
    );
    Ok(())
}
