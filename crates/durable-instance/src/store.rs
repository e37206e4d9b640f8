// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Snapshot storage contract and an in-process implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{InstanceError, Result};
use crate::values::ValueMap;

/// Durable snapshot storage.
///
/// `save_snapshot` must be atomic for one instance: after it returns `Ok`,
/// a later `load_snapshot` observes the whole map, and after it fails it
/// observes the previous one.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the last committed snapshot, `None` on first activation.
    async fn load_snapshot(&self, instance_id: &str) -> Result<Option<ValueMap>>;

    /// Durably replace the snapshot.
    async fn save_snapshot(&self, instance_id: &str, values: &ValueMap) -> Result<()>;
}

/// In-memory snapshot store.
///
/// Snapshots are kept JSON-encoded so loading goes through the same
/// serialization a real medium would.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves across all instances.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make subsequent saves fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Drop the stored snapshot of an instance.
    pub async fn remove(&self, instance_id: &str) {
        self.snapshots.lock().await.remove(instance_id);
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load_snapshot(&self, instance_id: &str) -> Result<Option<ValueMap>> {
        let snapshots = self.snapshots.lock().await;
        snapshots
            .get(instance_id)
            .map(|bytes| serde_json::from_slice(bytes))
            .transpose()
            .map_err(InstanceError::from)
    }

    async fn save_snapshot(&self, instance_id: &str, values: &ValueMap) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(InstanceError::store("save_snapshot", "store rejected the write"));
        }
        let bytes = serde_json::to_vec(values)?;
        debug!(instance_id, size = bytes.len(), "Snapshot saved");
        self.snapshots
            .lock()
            .await
            .insert(instance_id.to_string(), bytes);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
