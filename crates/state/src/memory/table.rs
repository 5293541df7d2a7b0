//! Heap-resident table holding the entries of one named state.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::Result;
use crate::storage::{StateCoordinate, StateStorage};
use crate::traits::StateKind;

#[derive(Debug, Default, Clone)]
struct StateSlot {
    value: Option<Bytes>,
    entries: BTreeMap<Bytes, Bytes>,
}

impl StateSlot {
    fn is_empty(&self) -> bool {
        self.value.is_none() && self.entries.is_empty()
    }
}

/// Key -> namespace -> slot, for a single key group.
type KeyGroupEntries = BTreeMap<Bytes, HashMap<Bytes, StateSlot>>;

/// One stored (key, namespace) slot in snapshot form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SlotSnapshot {
    pub key: Bytes,
    pub namespace: Bytes,
    pub value: Option<Bytes>,
    pub entries: Vec<(Bytes, Bytes)>,
}

/// In-memory storage of one named state, partitioned by key group.
pub struct HeapStateTable {
    kind: StateKind,
    groups: RwLock<BTreeMap<u32, KeyGroupEntries>>,
}

impl HeapStateTable {
    pub fn new(kind: StateKind) -> Self {
        Self {
            kind,
            groups: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn kind(&self) -> StateKind {
        self.kind
    }

    /// Keys holding a value or entries under `namespace`, ordered by key group.
    ///
    /// The keys are copied out so no lock is held while a caller iterates them
    /// and writes state for each key.
    pub fn keys(&self, namespace: &[u8]) -> Vec<Bytes> {
        self.groups
            .read()
            .values()
            .flat_map(|keys| {
                keys.iter()
                    .filter(move |(_, namespaces)| namespaces.contains_key(namespace))
                    .map(|(key, _)| key.clone())
            })
            .collect()
    }

    /// Number of (key, namespace) slots across all key groups.
    pub fn len(&self) -> usize {
        self.groups
            .read()
            .values()
            .flat_map(BTreeMap::values)
            .map(HashMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn snapshot_key_group(&self, key_group: u32) -> Vec<SlotSnapshot> {
        let groups = self.groups.read();
        let Some(keys) = groups.get(&key_group) else {
            return Vec::new();
        };
        let mut slots = Vec::new();
        for (key, namespaces) in keys {
            for (namespace, slot) in namespaces {
                slots.push(SlotSnapshot {
                    key: key.clone(),
                    namespace: namespace.clone(),
                    value: slot.value.clone(),
                    entries: slot
                        .entries
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                });
            }
        }
        slots
    }

    /// Replace the contents of `key_group` with `slots`.
    pub(crate) fn restore_key_group(&self, key_group: u32, slots: Vec<SlotSnapshot>) {
        let mut restored = KeyGroupEntries::new();
        for snapshot in slots {
            let slot = StateSlot {
                value: snapshot.value,
                entries: snapshot.entries.into_iter().collect(),
            };
            if slot.is_empty() {
                continue;
            }
            restored
                .entry(snapshot.key)
                .or_default()
                .insert(snapshot.namespace, slot);
        }

        let mut groups = self.groups.write();
        if restored.is_empty() {
            groups.remove(&key_group);
        } else {
            groups.insert(key_group, restored);
        }
    }

    pub(crate) fn clear_key_group(&self, key_group: u32) {
        self.groups.write().remove(&key_group);
    }

    fn with_slot<T>(&self, at: &StateCoordinate<'_>, f: impl FnOnce(&StateSlot) -> T) -> Option<T> {
        let groups = self.groups.read();
        groups
            .get(&at.key_group)
            .and_then(|keys| keys.get(at.key))
            .and_then(|namespaces| namespaces.get(at.namespace))
            .map(f)
    }
}

impl StateStorage for HeapStateTable {
    fn get(&self, at: &StateCoordinate<'_>) -> Result<Option<Bytes>> {
        Ok(self
            .with_slot(at, |slot| match at.user_key {
                Some(user_key) => slot.entries.get(user_key).cloned(),
                None => slot.value.clone(),
            })
            .flatten())
    }

    fn put(&self, at: &StateCoordinate<'_>, value: Bytes) -> Result<()> {
        let mut groups = self.groups.write();
        let slot = groups
            .entry(at.key_group)
            .or_default()
            .entry(Bytes::copy_from_slice(at.key))
            .or_default()
            .entry(Bytes::copy_from_slice(at.namespace))
            .or_default();
        match at.user_key {
            Some(user_key) => {
                slot.entries.insert(Bytes::copy_from_slice(user_key), value);
            }
            None => slot.value = Some(value),
        }
        Ok(())
    }

    fn remove(&self, at: &StateCoordinate<'_>) -> Result<Option<Bytes>> {
        let mut groups = self.groups.write();
        let Some(keys) = groups.get_mut(&at.key_group) else {
            return Ok(None);
        };
        let Some(namespaces) = keys.get_mut(at.key) else {
            return Ok(None);
        };
        let Some(slot) = namespaces.get_mut(at.namespace) else {
            return Ok(None);
        };

        let removed = match at.user_key {
            Some(user_key) => slot.entries.remove(user_key),
            None => slot.value.take(),
        };

        // prune empty levels so key enumeration only sees live state
        if slot.is_empty() {
            namespaces.remove(at.namespace);
            if namespaces.is_empty() {
                keys.remove(at.key);
                if keys.is_empty() {
                    groups.remove(&at.key_group);
                }
            }
        }
        Ok(removed)
    }

    fn entries(&self, key_group: u32, key: &[u8], namespace: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let at = StateCoordinate {
            key_group,
            key,
            namespace,
            user_key: None,
        };
        Ok(self
            .with_slot(&at, |slot| {
                slot.entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default())
    }

    fn clear(&self, key_group: u32, key: &[u8], namespace: &[u8]) -> Result<()> {
        let mut groups = self.groups.write();
        let Some(keys) = groups.get_mut(&key_group) else {
            return Ok(());
        };
        let Some(namespaces) = keys.get_mut(key) else {
            return Ok(());
        };
        namespaces.remove(namespace);
        if namespaces.is_empty() {
            keys.remove(key);
            if keys.is_empty() {
                groups.remove(&key_group);
            }
        }
        Ok(())
    }
}
