//! Heap storage backend implementation.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, StateError};
use crate::storage::StateStorage;
use crate::traits::{KeyStream, StateKind, StorageBackend};

use super::table::SlotSnapshot;
use super::HeapStateTable;

/// Contents of one key group across all named states.
#[derive(Debug, Serialize, Deserialize)]
struct KeyGroupSnapshot {
    key_group: u32,
    tables: Vec<TableSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TableSnapshot {
    name: String,
    kind: StateKind,
    slots: Vec<SlotSnapshot>,
}

/// In-memory storage backend for development and testing.
///
/// Keeps one [`HeapStateTable`] per named state. State is not durable
/// beyond what is written out through [`StorageBackend::write_key_group`].
pub struct HeapStorageBackend {
    tables: RwLock<HashMap<String, Arc<HeapStateTable>>>,
}

impl HeapStorageBackend {
    /// Create a new, empty heap backend.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// The table backing `name`, if it was created.
    pub fn table(&self, name: &str) -> Option<Arc<HeapStateTable>> {
        self.tables.read().get(name).cloned()
    }

    fn table_for(&self, name: &str, kind: StateKind) -> Result<Arc<HeapStateTable>> {
        let mut tables = self.tables.write();
        let table = tables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(HeapStateTable::new(kind)));
        if table.kind() != kind {
            return Err(StateError::Configuration(format!(
                "state '{name}' was created as {} and cannot be reopened as {kind}",
                table.kind()
            )));
        }
        Ok(table.clone())
    }
}

impl Default for HeapStorageBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for HeapStorageBackend {
    fn create_storage(&self, name: &str, kind: StateKind) -> Result<Arc<dyn StateStorage>> {
        let table = self.table_for(name, kind)?;
        debug!(state = name, %kind, "Created heap state table");
        Ok(table)
    }

    // Iterates a snapshot of the table's keys, see `HeapStateTable::keys`.
    fn keys(&self, name: &str, namespace: &[u8]) -> Result<KeyStream> {
        let keys: Vec<Bytes> = match self.table(name) {
            Some(table) => table.keys(namespace),
            None => Vec::new(),
        };
        Ok(Box::new(keys.into_iter().map(Ok::<Bytes, StateError>)))
    }

    fn write_key_group(&self, key_group: u32, out: &mut dyn Write) -> Result<()> {
        let snapshot = {
            let tables = self.tables.read();
            let mut snapshot = KeyGroupSnapshot {
                key_group,
                tables: Vec::with_capacity(tables.len()),
            };
            for (name, table) in tables.iter() {
                let slots = table.snapshot_key_group(key_group);
                if slots.is_empty() {
                    continue;
                }
                snapshot.tables.push(TableSnapshot {
                    name: name.clone(),
                    kind: table.kind(),
                    slots,
                });
            }
            snapshot
        }; // <- tables guard dropped here

        bincode::serialize_into(out, &snapshot)?;
        debug!(
            key_group,
            states = snapshot.tables.len(),
            "Wrote key group"
        );
        Ok(())
    }

    fn read_key_group(&self, key_group: u32, input: &mut dyn Read) -> Result<()> {
        let snapshot: KeyGroupSnapshot = bincode::deserialize_from(input)?;
        if snapshot.key_group != key_group {
            return Err(StateError::Serialization(format!(
                "stream holds key group {} but key group {key_group} was requested",
                snapshot.key_group
            )));
        }

        let mut tables = self.tables.write();
        // Nothing is touched until every state in the stream fits its table.
        for table in &snapshot.tables {
            if let Some(existing) = tables.get(&table.name) {
                if existing.kind() != table.kind {
                    return Err(StateError::Configuration(format!(
                        "state '{}' was created as {} and cannot be restored as {}",
                        table.name,
                        existing.kind(),
                        table.kind
                    )));
                }
            }
        }

        for table in tables.values() {
            table.clear_key_group(key_group);
        }
        let states = snapshot.tables.len();
        for table in snapshot.tables {
            tables
                .entry(table.name)
                .or_insert_with(|| Arc::new(HeapStateTable::new(table.kind)))
                .restore_key_group(key_group, table.slots);
        }
        drop(tables);

        debug!(key_group, states, "Restored key group");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "heap"
    }
}
