// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted value map and its read-only views.
//!
//! A snapshot is a flat map from [`ValueKey`] to [`ValueEntry`]. Each entry
//! is either round-tripped on every load/save ([`Visibility::ReadWrite`]) or
//! written for diagnostics only and never read back ([`Visibility::WriteOnly`]).
//!
//! Participants never see the map directly. They get a [`ValueView`] that
//! exposes one partition of it and rejects every mutation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{InstanceError, Result};

/// Namespaced key of a persisted value, e.g. `reminders/bookmarks`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueKey {
    namespace: String,
    name: String,
}

impl ValueKey {
    /// Create a key from a participant namespace and a local name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The participant-defined namespace segment.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The local name within the namespace.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ValueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Whether a value is read back on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Round-tripped on every load/save.
    ReadWrite,
    /// Written for diagnostics, never loaded.
    WriteOnly,
}

/// A persisted value together with its visibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueEntry {
    /// The opaque value.
    pub value: Value,
    /// Which partition the value belongs to.
    pub visibility: Visibility,
}

impl ValueEntry {
    /// A value that is loaded back on reactivation.
    pub fn read_write(value: Value) -> Self {
        Self {
            value,
            visibility: Visibility::ReadWrite,
        }
    }

    /// A diagnostic value that is never loaded back.
    pub fn write_only(value: Value) -> Self {
        Self {
            value,
            visibility: Visibility::WriteOnly,
        }
    }

    /// Returns true for write-only entries.
    pub fn is_write_only(&self) -> bool {
        self.visibility == Visibility::WriteOnly
    }
}

#[derive(Serialize, Deserialize)]
struct StoredValue {
    key: ValueKey,
    value: Value,
    write_only: bool,
}

/// Flat key -> value map captured in one snapshot.
///
/// Serialized as a list of `{key, value, write_only}` records so keys do not
/// need a string encoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "Vec<StoredValue>", from = "Vec<StoredValue>")]
pub struct ValueMap {
    entries: BTreeMap<ValueKey, ValueEntry>,
}

impl ValueMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an entry regardless of visibility.
    pub fn get(&self, key: &ValueKey) -> Option<&ValueEntry> {
        self.entries.get(key)
    }

    /// Returns true if the key is present in either partition.
    pub fn contains_key(&self, key: &ValueKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert an entry, returning the previous one if the key was present.
    pub fn insert(&mut self, key: ValueKey, entry: ValueEntry) -> Option<ValueEntry> {
        self.entries.insert(key, entry)
    }

    /// Number of entries across both partitions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&ValueKey, &ValueEntry)> {
        self.entries.iter()
    }

    /// Read-only view over the read-write partition.
    pub fn read_write_view(&self) -> ValueView<'_> {
        ValueView::new(self, Visibility::ReadWrite)
    }

    /// Read-only view over the write-only partition.
    pub fn write_only_view(&self) -> ValueView<'_> {
        ValueView::new(self, Visibility::WriteOnly)
    }
}

impl From<ValueMap> for Vec<StoredValue> {
    fn from(map: ValueMap) -> Self {
        map.entries
            .into_iter()
            .map(|(key, entry)| StoredValue {
                key,
                write_only: entry.is_write_only(),
                value: entry.value,
            })
            .collect()
    }
}

impl From<Vec<StoredValue>> for ValueMap {
    fn from(stored: Vec<StoredValue>) -> Self {
        let entries = stored
            .into_iter()
            .map(|s| {
                let entry = if s.write_only {
                    ValueEntry::write_only(s.value)
                } else {
                    ValueEntry::read_write(s.value)
                };
                (s.key, entry)
            })
            .collect();
        Self { entries }
    }
}

/// Read-only projection of one partition of a [`ValueMap`].
///
/// Key and value lists are materialized lazily and cached; call
/// [`ValueView::reset_caches`] after the underlying map changed.
pub struct ValueView<'a> {
    map: &'a ValueMap,
    visibility: Visibility,
    keys: OnceLock<Vec<&'a ValueKey>>,
    values: OnceLock<Vec<&'a Value>>,
}

impl<'a> ValueView<'a> {
    /// Create a view over the given partition.
    pub fn new(map: &'a ValueMap, visibility: Visibility) -> Self {
        Self {
            map,
            visibility,
            keys: OnceLock::new(),
            values: OnceLock::new(),
        }
    }

    /// The partition this view exposes.
    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    /// Get a value, `None` if absent or in the other partition.
    pub fn get(&self, key: &ValueKey) -> Option<&'a Value> {
        self.map
            .get(key)
            .filter(|entry| entry.visibility == self.visibility)
            .map(|entry| &entry.value)
    }

    /// Decode a value into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &ValueKey) -> Result<Option<T>> {
        self.get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(InstanceError::from)
    }

    /// Returns true if the key is present in this partition.
    pub fn contains_key(&self, key: &ValueKey) -> bool {
        self.get(key).is_some()
    }

    /// Keys of this partition, in key order.
    pub fn keys(&self) -> &[&'a ValueKey] {
        self.keys.get_or_init(|| {
            let map: &'a ValueMap = self.map;
            map.iter()
                .filter(|(_, entry)| entry.visibility == self.visibility)
                .map(|(key, _)| key)
                .collect()
        })
    }

    /// Values of this partition, in key order.
    pub fn values(&self) -> &[&'a Value] {
        self.values.get_or_init(|| {
            let map: &'a ValueMap = self.map;
            map.iter()
                .filter(|(_, entry)| entry.visibility == self.visibility)
                .map(|(_, entry)| &entry.value)
                .collect()
        })
    }

    /// Number of entries in this partition.
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    /// Returns true if this partition is empty.
    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }

    /// Always fails: views are read-only.
    pub fn insert(&self, key: ValueKey, _value: Value) -> Result<()> {
        Err(InstanceError::ImmutableView { key })
    }

    /// Always fails: views are read-only.
    pub fn remove(&self, key: &ValueKey) -> Result<Value> {
        Err(InstanceError::ImmutableView { key: key.clone() })
    }

    /// Drop the materialized key/value lists.
    pub fn reset_caches(&mut self) {
        self.keys.take();
        self.values.take();
    }
}

impl fmt::Debug for ValueView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueView")
            .field("visibility", &self.visibility)
            .field("keys", &self.keys())
            .finish()
    }
}
