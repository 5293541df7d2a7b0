//! The current-key context and key selection listeners.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tandem_core::{assign_to_key_group, KeyGroupRange};

use crate::error::{Result, StateError};
use crate::serializer::TypeSerializer;
use crate::traits::StateKey;

/// Serialized view of the current key, as seen by state handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCoordinates {
    pub key: Bytes,
    pub key_group: u32,
}

/// Source of the current key for state handles, which are not generic over
/// the backend's key type.
pub trait CurrentKeySource: Send + Sync {
    fn current_key_coordinates(&self) -> Result<KeyCoordinates>;
}

struct KeySlot<K> {
    key: Option<K>,
    key_group: Option<u32>,
    /// Lazily serialized form of `key`, reset whenever the key changes.
    serialized: Option<Bytes>,
}

/// Holds the current key and its key group.
///
/// One key is live at a time. The context is mutated before every per-key
/// operation and is only ever driven by the task thread owning the backend.
pub struct KeyContext<K> {
    slot: Mutex<KeySlot<K>>,
    number_of_key_groups: u32,
    key_group_range: KeyGroupRange,
    key_serializer: Option<Arc<dyn TypeSerializer<K>>>,
}

impl<K: StateKey> KeyContext<K> {
    pub fn new(
        number_of_key_groups: u32,
        key_group_range: KeyGroupRange,
        key_serializer: Option<Arc<dyn TypeSerializer<K>>>,
    ) -> Self {
        Self {
            slot: Mutex::new(KeySlot {
                key: None,
                key_group: None,
                serialized: None,
            }),
            number_of_key_groups,
            key_group_range,
            key_serializer,
        }
    }

    /// Set the key and recompute its key group.
    pub fn set_current_key(&self, key: K) {
        let key_group = assign_to_key_group(&key, self.number_of_key_groups);
        self.set_current_key_and_key_group(key, key_group);
    }

    /// Set the key with an already known key group.
    pub fn set_current_key_and_key_group(&self, key: K, key_group: u32) {
        let mut slot = self.slot.lock();
        slot.key = Some(key);
        slot.key_group = Some(key_group);
        slot.serialized = None;
    }

    pub fn set_current_key_group_index(&self, key_group: u32) {
        self.slot.lock().key_group = Some(key_group);
    }

    pub fn current_key(&self) -> Option<K> {
        self.slot.lock().key.clone()
    }

    pub fn current_key_group_index(&self) -> Option<u32> {
        self.slot.lock().key_group
    }

    pub fn number_of_key_groups(&self) -> u32 {
        self.number_of_key_groups
    }

    pub fn key_group_range(&self) -> KeyGroupRange {
        self.key_group_range
    }

    pub(crate) fn key_serializer(&self) -> Option<&Arc<dyn TypeSerializer<K>>> {
        self.key_serializer.as_ref()
    }
}

impl<K: StateKey> CurrentKeySource for KeyContext<K> {
    fn current_key_coordinates(&self) -> Result<KeyCoordinates> {
        let mut slot = self.slot.lock();
        let key_group = slot.key_group.ok_or(StateError::NoCurrentKey)?;
        let key = match &slot.serialized {
            Some(bytes) => bytes.clone(),
            None => {
                let key = slot.key.as_ref().ok_or(StateError::NoCurrentKey)?;
                let serializer = self.key_serializer.as_ref().ok_or_else(|| {
                    StateError::Configuration(
                        "State key serializer has not been configured".to_string(),
                    )
                })?;
                let bytes = serializer.serialize(key)?;
                slot.serialized = Some(bytes.clone());
                bytes
            }
        };
        Ok(KeyCoordinates { key, key_group })
    }
}

// ============================================================================
// Key Selection Listeners
// ============================================================================

/// Notified synchronously every time the current key changes.
///
/// Implementations must not register or deregister listeners from within
/// [`KeySelectionListener::key_selected`].
pub trait KeySelectionListener<K>: Send + Sync {
    fn key_selected(&self, key: &K);
}

impl<K, F> KeySelectionListener<K> for F
where
    F: Fn(&K) + Send + Sync,
{
    fn key_selected(&self, key: &K) {
        self(key)
    }
}

/// Ordered listener list; registration order is notification order.
pub(crate) struct KeySelectionListeners<K> {
    listeners: Vec<Arc<dyn KeySelectionListener<K>>>,
}

impl<K> KeySelectionListeners<K> {
    pub(crate) fn new() -> Self {
        Self {
            listeners: Vec::with_capacity(1),
        }
    }

    pub(crate) fn register(&mut self, listener: Arc<dyn KeySelectionListener<K>>) {
        self.listeners.push(listener);
    }

    /// Remove the first registration of `listener`. Returns whether it was found.
    pub(crate) fn deregister(&mut self, listener: &Arc<dyn KeySelectionListener<K>>) -> bool {
        match self
            .listeners
            .iter()
            .position(|registered| Arc::ptr_eq(registered, listener))
        {
            Some(index) => {
                self.listeners.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn notify(&self, key: &K) {
        // indexed loop, this runs for every record
        for i in 0..self.listeners.len() {
            self.listeners[i].key_selected(key);
        }
    }
}
