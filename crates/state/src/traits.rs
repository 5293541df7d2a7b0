//! Core traits and interfaces for keyed state.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;
use tandem_core::CheckpointId;

use crate::error::{Result, StateError};
use crate::storage::StateStorage;

// ============================================================================
// Trait Bounds
// ============================================================================

/// Trait bound for types that can be used as keys (of the backend or of a map state).
pub trait StateKey:
    Serialize + DeserializeOwned + Clone + Eq + std::hash::Hash + Send + Sync + 'static
{
}

/// Trait bound for types that can be stored as state values.
pub trait StateValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Trait bound for namespaces. Namespaces only need to be serializable
/// through the serializer handed to the backend.
pub trait Namespace: Send + Sync + 'static {}

impl<T> StateKey for T where
    T: Serialize + DeserializeOwned + Clone + Eq + std::hash::Hash + Send + Sync + 'static
{
}

impl<T> StateValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Namespace for T where T: Send + Sync + 'static {}

// ============================================================================
// State Kinds
// ============================================================================

/// The closed set of state flavors a backend materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateKind {
    Value,
    List,
    Map,
    Reducing,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Value => "value",
            StateKind::List => "list",
            StateKind::Map => "map",
            StateKind::Reducing => "reducing",
        }
    }
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Storage Backend Trait
// ============================================================================

/// Lazy, single-pass sequence of serialized keys.
///
/// Resources held by the sequence are released when it is dropped, which
/// happens on every exit path of the consumer.
pub type KeyStream = Box<dyn Iterator<Item = Result<Bytes>> + Send>;

/// Backend-specific storage: creates raw per-name storage and enumerates keys.
///
/// A storage backend only deals in bytes. Typing, namespaces and the
/// decorator chain are layered on top by [`crate::KeyedStateBackend`].
pub trait StorageBackend: Send + Sync {
    /// Create (or reopen) the raw storage for a named state.
    fn create_storage(&self, name: &str, kind: StateKind) -> Result<Arc<dyn StateStorage>>;

    /// All keys holding state under `name` and `namespace`.
    fn keys(&self, name: &str, namespace: &[u8]) -> Result<KeyStream>;

    /// Write every state entry of one key group to `out`.
    fn write_key_group(&self, key_group: u32, _out: &mut dyn Write) -> Result<()> {
        Err(StateError::IllegalState(format!(
            "backend '{}' cannot write key group {key_group}",
            self.name()
        )))
    }

    /// Restore one key group previously written by [`StorageBackend::write_key_group`],
    /// replacing whatever the group currently holds.
    fn read_key_group(&self, key_group: u32, _input: &mut dyn Read) -> Result<()> {
        Err(StateError::IllegalState(format!(
            "backend '{}' cannot read key group {key_group}",
            self.name()
        )))
    }

    /// Get the name of this backend.
    fn name(&self) -> &'static str;
}

// ============================================================================
// Internal State Interfaces
// ============================================================================

/// Type-erased view of a materialized state, used by queryable state lookups.
pub trait QueryableKvState: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> StateKind;

    /// Serialized value stored under the given key and namespace, if any.
    ///
    /// Map states return their entries bincode-encoded as `Vec<(Bytes, Bytes)>`,
    /// list states their encoded element list.
    fn get_serialized_value(
        &self,
        key_group: u32,
        key: &[u8],
        namespace: &[u8],
    ) -> Result<Option<Bytes>>;
}

/// A materialized state whose namespace can be switched in place.
pub trait InternalKvState<N>: QueryableKvState + 'static {
    fn set_current_namespace(&self, namespace: &N) -> Result<()>;
}

// ============================================================================
// Checkpoint Notifications
// ============================================================================

/// Receives checkpoint notifications from the checkpoint coordinator.
pub trait CheckpointListener {
    fn notify_checkpoint_complete(&self, checkpoint_id: CheckpointId) -> Result<()>;

    fn notify_checkpoint_aborted(&self, _checkpoint_id: CheckpointId) -> Result<()> {
        Ok(())
    }

    /// Called when a checkpoint was superseded by a newer one and anything it
    /// retained may be released. Nothing is retained by default.
    fn notify_checkpoint_subsumed(&self, _checkpoint_id: CheckpointId) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// State Interfaces
// ============================================================================

/// Single value state.
///
/// Stores a single value per key and namespace. Typical use cases include
/// counters, running totals, or any single-valued state.
pub trait ValueState<V>: Send + Sync {
    /// Get the current value, if any.
    fn get(&self) -> Result<Option<V>>;

    /// Set the value.
    fn set(&self, value: V) -> Result<()>;

    /// Clear the value.
    fn clear(&self) -> Result<()>;
}

/// List state - appends values to a list.
pub trait ListState<V>: Send + Sync {
    /// Get all values in the list.
    fn get(&self) -> Result<Vec<V>>;

    /// Add a single value to the list.
    fn add(&self, value: V) -> Result<()>;

    /// Add multiple values to the list.
    fn add_all(&self, values: Vec<V>) -> Result<()>;

    /// Replace the list contents.
    fn update(&self, values: Vec<V>) -> Result<()>;

    /// Clear the list.
    fn clear(&self) -> Result<()>;
}

/// Map state - nested key-value store.
///
/// Stores a map of values per key and namespace. Useful for maintaining
/// lookups or associations within a keyed context.
pub trait MapState<K, V>: Send + Sync {
    /// Get a value by map key.
    fn get(&self, key: &K) -> Result<Option<V>>;

    /// Put a key-value pair.
    fn put(&self, key: K, value: V) -> Result<()>;

    /// Remove a key-value pair, returning the old value if present.
    fn remove(&self, key: &K) -> Result<Option<V>>;

    /// Check if the map contains a key.
    fn contains(&self, key: &K) -> Result<bool>;

    /// Get all keys in the map.
    fn keys(&self) -> Result<Vec<K>>;

    /// Get all values in the map.
    fn values(&self) -> Result<Vec<V>>;

    /// Get all key-value pairs.
    fn entries(&self) -> Result<Vec<(K, V)>>;

    /// Clear the map.
    fn clear(&self) -> Result<()>;

    /// Check if the map is empty.
    fn is_empty(&self) -> Result<bool>;
}

/// Reducing state - aggregates values with a reduce function.
pub trait ReducingState<V>: Send + Sync {
    /// Get the current aggregated value, if any.
    fn get(&self) -> Result<Option<V>>;

    /// Add a value, combining it with the existing value using the reduce function.
    fn add(&self, value: V) -> Result<()>;

    /// Clear the aggregated value.
    fn clear(&self) -> Result<()>;
}
