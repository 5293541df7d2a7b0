//! Typed state handles over byte-level storage.
//!
//! One handle exists per named state and backend. It reads the current key
//! from the backend's key context and keeps the current namespace itself, so
//! the same handle is reused across keys and namespaces.

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::context::{CurrentKeySource, KeyCoordinates};
use crate::descriptor::{ReduceFunction, StateParts};
use crate::error::{Result, StateError};
use crate::serializer::TypeSerializer;
use crate::storage::{StateCoordinate, StateStorage};
use crate::traits::{
    InternalKvState, ListState, MapState, Namespace, QueryableKvState, ReducingState, StateKey,
    StateKind, StateValue, ValueState,
};

/// Scope of one access: the current key and the serialized current namespace.
struct Scope {
    key: KeyCoordinates,
    namespace: Bytes,
}

impl Scope {
    fn at(&self) -> StateCoordinate<'_> {
        StateCoordinate::new(&self.key, &self.namespace)
    }
}

/// Plumbing shared by all handle flavors.
pub(crate) struct StateCell<N> {
    name: String,
    kind: StateKind,
    storage: Arc<dyn StateStorage>,
    keys: Arc<dyn CurrentKeySource>,
    namespace_serializer: Arc<dyn TypeSerializer<N>>,
    namespace: RwLock<Option<Bytes>>,
}

impl<N: Namespace> StateCell<N> {
    pub(crate) fn new(parts: StateParts<N>, kind: StateKind) -> Self {
        Self {
            name: parts.name,
            kind,
            storage: parts.storage,
            keys: parts.keys,
            namespace_serializer: parts.namespace_serializer,
            namespace: RwLock::new(None),
        }
    }

    fn set_namespace(&self, namespace: &N) -> Result<()> {
        let serialized = self.namespace_serializer.serialize(namespace)?;
        *self.namespace.write() = Some(serialized);
        Ok(())
    }

    fn scope(&self) -> Result<Scope> {
        let key = self.keys.current_key_coordinates()?;
        let namespace = self
            .namespace
            .read()
            .clone()
            .ok_or_else(|| StateError::NoNamespace(self.name.clone()))?;
        Ok(Scope { key, namespace })
    }

    fn raw(&self, key_group: u32, key: &[u8], namespace: &[u8]) -> Result<Option<Bytes>> {
        self.storage.get(&StateCoordinate {
            key_group,
            key,
            namespace,
            user_key: None,
        })
    }
}

macro_rules! impl_internal_state {
    ($handle:ident < $($param:ident),+ >) => {
        impl<N: Namespace, $($param),+> InternalKvState<N> for $handle<N, $($param),+>
        where
            Self: QueryableKvState + 'static,
        {
            fn set_current_namespace(&self, namespace: &N) -> Result<()> {
                self.cell.set_namespace(namespace)
            }
        }
    };
}

// ============================================================================
// Value
// ============================================================================

pub struct KeyedValueState<N, V> {
    cell: StateCell<N>,
    serializer: Arc<dyn TypeSerializer<V>>,
}

impl<N: Namespace, V: StateValue> KeyedValueState<N, V> {
    pub(crate) fn new(cell: StateCell<N>, serializer: Arc<dyn TypeSerializer<V>>) -> Self {
        Self { cell, serializer }
    }
}

impl<N: Namespace, V: StateValue> ValueState<V> for KeyedValueState<N, V> {
    fn get(&self) -> Result<Option<V>> {
        let scope = self.cell.scope()?;
        match self.cell.storage.get(&scope.at())? {
            Some(bytes) => Ok(Some(self.serializer.deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set(&self, value: V) -> Result<()> {
        let scope = self.cell.scope()?;
        let bytes = self.serializer.serialize(&value)?;
        self.cell.storage.put(&scope.at(), bytes)
    }

    fn clear(&self) -> Result<()> {
        let scope = self.cell.scope()?;
        self.cell.storage.remove(&scope.at())?;
        Ok(())
    }
}

impl<N: Namespace, V: StateValue> QueryableKvState for KeyedValueState<N, V> {
    fn name(&self) -> &str {
        &self.cell.name
    }

    fn kind(&self) -> StateKind {
        self.cell.kind
    }

    fn get_serialized_value(
        &self,
        key_group: u32,
        key: &[u8],
        namespace: &[u8],
    ) -> Result<Option<Bytes>> {
        self.cell.raw(key_group, key, namespace)
    }
}

impl_internal_state!(KeyedValueState<V>);

// ============================================================================
// List
// ============================================================================

/// Elements are serialized one by one and stored as a bincode-encoded
/// `Vec<Bytes>` under the key and namespace.
pub struct KeyedListState<N, V> {
    cell: StateCell<N>,
    element_serializer: Arc<dyn TypeSerializer<V>>,
}

impl<N: Namespace, V: StateValue> KeyedListState<N, V> {
    pub(crate) fn new(cell: StateCell<N>, element_serializer: Arc<dyn TypeSerializer<V>>) -> Self {
        Self {
            cell,
            element_serializer,
        }
    }

    fn load(&self, scope: &Scope) -> Result<Vec<Bytes>> {
        match self.cell.storage.get(&scope.at())? {
            Some(blob) => Ok(bincode::deserialize(&blob)?),
            None => Ok(Vec::new()),
        }
    }

    fn store(&self, scope: &Scope, elements: &[Bytes]) -> Result<()> {
        if elements.is_empty() {
            self.cell.storage.remove(&scope.at())?;
            return Ok(());
        }
        let blob = Bytes::from(bincode::serialize(elements)?);
        self.cell.storage.put(&scope.at(), blob)
    }

    fn serialize_all(&self, values: Vec<V>) -> Result<Vec<Bytes>> {
        values
            .iter()
            .map(|value| self.element_serializer.serialize(value))
            .collect()
    }
}

impl<N: Namespace, V: StateValue> ListState<V> for KeyedListState<N, V> {
    fn get(&self) -> Result<Vec<V>> {
        let scope = self.cell.scope()?;
        self.load(&scope)?
            .iter()
            .map(|bytes| self.element_serializer.deserialize(bytes))
            .collect()
    }

    fn add(&self, value: V) -> Result<()> {
        self.add_all(vec![value])
    }

    fn add_all(&self, values: Vec<V>) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let scope = self.cell.scope()?;
        let mut elements = self.load(&scope)?;
        elements.extend(self.serialize_all(values)?);
        self.store(&scope, &elements)
    }

    fn update(&self, values: Vec<V>) -> Result<()> {
        let scope = self.cell.scope()?;
        let elements = self.serialize_all(values)?;
        self.store(&scope, &elements)
    }

    fn clear(&self) -> Result<()> {
        let scope = self.cell.scope()?;
        self.cell.storage.remove(&scope.at())?;
        Ok(())
    }
}

impl<N: Namespace, V: StateValue> QueryableKvState for KeyedListState<N, V> {
    fn name(&self) -> &str {
        &self.cell.name
    }

    fn kind(&self) -> StateKind {
        self.cell.kind
    }

    fn get_serialized_value(
        &self,
        key_group: u32,
        key: &[u8],
        namespace: &[u8],
    ) -> Result<Option<Bytes>> {
        self.cell.raw(key_group, key, namespace)
    }
}

impl_internal_state!(KeyedListState<V>);

// ============================================================================
// Map
// ============================================================================

pub struct KeyedMapState<N, UK, UV> {
    cell: StateCell<N>,
    key_serializer: Arc<dyn TypeSerializer<UK>>,
    value_serializer: Arc<dyn TypeSerializer<UV>>,
}

impl<N: Namespace, UK: StateKey, UV: StateValue> KeyedMapState<N, UK, UV> {
    pub(crate) fn new(
        cell: StateCell<N>,
        key_serializer: Arc<dyn TypeSerializer<UK>>,
        value_serializer: Arc<dyn TypeSerializer<UV>>,
    ) -> Self {
        Self {
            cell,
            key_serializer,
            value_serializer,
        }
    }

    fn raw_entries(&self) -> Result<Vec<(Bytes, Bytes)>> {
        let scope = self.cell.scope()?;
        self.cell
            .storage
            .entries(scope.key.key_group, &scope.key.key, &scope.namespace)
    }
}

impl<N: Namespace, UK: StateKey, UV: StateValue> MapState<UK, UV> for KeyedMapState<N, UK, UV> {
    fn get(&self, map_key: &UK) -> Result<Option<UV>> {
        let scope = self.cell.scope()?;
        let user_key = self.key_serializer.serialize(map_key)?;
        match self.cell.storage.get(&scope.at().with_user_key(&user_key))? {
            Some(bytes) => Ok(Some(self.value_serializer.deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put(&self, map_key: UK, value: UV) -> Result<()> {
        let scope = self.cell.scope()?;
        let user_key = self.key_serializer.serialize(&map_key)?;
        let bytes = self.value_serializer.serialize(&value)?;
        self.cell
            .storage
            .put(&scope.at().with_user_key(&user_key), bytes)
    }

    fn remove(&self, map_key: &UK) -> Result<Option<UV>> {
        let scope = self.cell.scope()?;
        let user_key = self.key_serializer.serialize(map_key)?;
        match self
            .cell
            .storage
            .remove(&scope.at().with_user_key(&user_key))?
        {
            Some(bytes) => Ok(Some(self.value_serializer.deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn contains(&self, map_key: &UK) -> Result<bool> {
        Ok(self.get(map_key)?.is_some())
    }

    fn keys(&self) -> Result<Vec<UK>> {
        self.raw_entries()?
            .iter()
            .map(|(k, _)| self.key_serializer.deserialize(k))
            .collect()
    }

    fn values(&self) -> Result<Vec<UV>> {
        self.raw_entries()?
            .iter()
            .map(|(_, v)| self.value_serializer.deserialize(v))
            .collect()
    }

    fn entries(&self) -> Result<Vec<(UK, UV)>> {
        self.raw_entries()?
            .iter()
            .map(|(k, v)| {
                Ok((
                    self.key_serializer.deserialize(k)?,
                    self.value_serializer.deserialize(v)?,
                ))
            })
            .collect()
    }

    fn clear(&self) -> Result<()> {
        let scope = self.cell.scope()?;
        self.cell
            .storage
            .clear(scope.key.key_group, &scope.key.key, &scope.namespace)
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.raw_entries()?.is_empty())
    }
}

impl<N: Namespace, UK: StateKey, UV: StateValue> QueryableKvState for KeyedMapState<N, UK, UV> {
    fn name(&self) -> &str {
        &self.cell.name
    }

    fn kind(&self) -> StateKind {
        self.cell.kind
    }

    fn get_serialized_value(
        &self,
        key_group: u32,
        key: &[u8],
        namespace: &[u8],
    ) -> Result<Option<Bytes>> {
        let entries = self.cell.storage.entries(key_group, key, namespace)?;
        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(Bytes::from(bincode::serialize(&entries)?)))
    }
}

impl_internal_state!(KeyedMapState<UK, UV>);

// ============================================================================
// Reducing
// ============================================================================

pub struct KeyedReducingState<N, V> {
    cell: StateCell<N>,
    serializer: Arc<dyn TypeSerializer<V>>,
    reduce_fn: ReduceFunction<V>,
}

impl<N: Namespace, V: StateValue> KeyedReducingState<N, V> {
    pub(crate) fn new(
        cell: StateCell<N>,
        serializer: Arc<dyn TypeSerializer<V>>,
        reduce_fn: ReduceFunction<V>,
    ) -> Self {
        Self {
            cell,
            serializer,
            reduce_fn,
        }
    }
}

impl<N: Namespace, V: StateValue> ReducingState<V> for KeyedReducingState<N, V> {
    fn get(&self) -> Result<Option<V>> {
        let scope = self.cell.scope()?;
        match self.cell.storage.get(&scope.at())? {
            Some(bytes) => Ok(Some(self.serializer.deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn add(&self, value: V) -> Result<()> {
        let scope = self.cell.scope()?;
        let at = scope.at();
        let reduced = match self.cell.storage.get(&at)? {
            Some(bytes) => {
                let current = self.serializer.deserialize(&bytes)?;
                (self.reduce_fn)(&current, &value)
            }
            None => value,
        };
        self.cell.storage.put(&at, self.serializer.serialize(&reduced)?)
    }

    fn clear(&self) -> Result<()> {
        let scope = self.cell.scope()?;
        self.cell.storage.remove(&scope.at())?;
        Ok(())
    }
}

impl<N: Namespace, V: StateValue> QueryableKvState for KeyedReducingState<N, V> {
    fn name(&self) -> &str {
        &self.cell.name
    }

    fn kind(&self) -> StateKind {
        self.cell.kind
    }

    fn get_serialized_value(
        &self,
        key_group: u32,
        key: &[u8],
        namespace: &[u8],
    ) -> Result<Option<Bytes>> {
        self.cell.raw(key_group, key, namespace)
    }
}

impl_internal_state!(KeyedReducingState<V>);
