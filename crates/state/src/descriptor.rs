//! State descriptors: name, TTL, queryability and value serializers of a
//! named state, plus the factory for its typed handle.

use std::sync::{Arc, OnceLock};

use crate::config::ExecutionConfig;
use crate::context::CurrentKeySource;
use crate::error::{Result, StateError};
use crate::serializer::{serializer_for, TypeSerializer};
use crate::states::{KeyedListState, KeyedMapState, KeyedReducingState, KeyedValueState, StateCell};
use crate::storage::{StateStorage, StateTtlConfig};
use crate::traits::{InternalKvState, Namespace, StateKey, StateKind, StateValue};

/// Settings shared by every descriptor flavor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub name: String,
    pub ttl: StateTtlConfig,
    /// Name under which the state is published for external lookups.
    pub queryable_name: Option<String>,
}

impl DescriptorInfo {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl: StateTtlConfig::disabled(),
            queryable_name: None,
        }
    }
}

/// Everything a descriptor needs to build a state handle.
pub struct StateParts<N> {
    pub name: String,
    /// Raw storage with the decorator chain already applied.
    pub storage: Arc<dyn StateStorage>,
    pub keys: Arc<dyn CurrentKeySource>,
    pub namespace_serializer: Arc<dyn TypeSerializer<N>>,
}

/// Describes one named state and creates its handle.
pub trait StateDescriptor {
    /// The handle materialized for namespace type `N`.
    type State<N: Namespace>: InternalKvState<N>;

    const KIND: StateKind;

    fn info(&self) -> &DescriptorInfo;

    fn info_mut(&mut self) -> &mut DescriptorInfo;

    fn name(&self) -> &str {
        &self.info().name
    }

    fn ttl_config(&self) -> &StateTtlConfig {
        &self.info().ttl
    }

    fn is_queryable(&self) -> bool {
        self.info().queryable_name.is_some()
    }

    fn queryable_name(&self) -> Option<&str> {
        self.info().queryable_name.as_deref()
    }

    fn with_ttl(mut self, ttl: StateTtlConfig) -> Self
    where
        Self: Sized,
    {
        self.info_mut().ttl = ttl;
        self
    }

    /// Publish the state for external lookups under `queryable_name`.
    fn with_queryable(mut self, queryable_name: impl Into<String>) -> Self
    where
        Self: Sized,
    {
        self.info_mut().queryable_name = Some(queryable_name.into());
        self
    }

    fn is_serializer_initialized(&self) -> bool;

    /// Initialize value serializers from `config` unless they were given explicitly.
    fn initialize_serializer_unless_set(&self, config: &ExecutionConfig);

    fn create_state<N: Namespace>(&self, parts: StateParts<N>) -> Result<Self::State<N>>;
}

fn initialized<T>(
    serializer: &OnceLock<Arc<dyn TypeSerializer<T>>>,
    name: &str,
) -> Result<Arc<dyn TypeSerializer<T>>> {
    serializer.get().cloned().ok_or_else(|| {
        StateError::Configuration(format!("serializer of state '{name}' has not been initialized"))
    })
}

// ============================================================================
// Value
// ============================================================================

pub struct ValueStateDescriptor<V> {
    info: DescriptorInfo,
    serializer: OnceLock<Arc<dyn TypeSerializer<V>>>,
}

impl<V: StateValue> ValueStateDescriptor<V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            info: DescriptorInfo::new(name),
            serializer: OnceLock::new(),
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn TypeSerializer<V>>) -> Self {
        self.serializer = OnceLock::from(serializer);
        self
    }
}

impl<V: StateValue> StateDescriptor for ValueStateDescriptor<V> {
    type State<N: Namespace> = KeyedValueState<N, V>;

    const KIND: StateKind = StateKind::Value;

    fn info(&self) -> &DescriptorInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut DescriptorInfo {
        &mut self.info
    }

    fn is_serializer_initialized(&self) -> bool {
        self.serializer.get().is_some()
    }

    fn initialize_serializer_unless_set(&self, config: &ExecutionConfig) {
        self.serializer
            .get_or_init(|| serializer_for::<V>(config.serializer_format));
    }

    fn create_state<N: Namespace>(&self, parts: StateParts<N>) -> Result<Self::State<N>> {
        let serializer = initialized(&self.serializer, &self.info.name)?;
        Ok(KeyedValueState::new(StateCell::new(parts, Self::KIND), serializer))
    }
}

// ============================================================================
// List
// ============================================================================

pub struct ListStateDescriptor<V> {
    info: DescriptorInfo,
    element_serializer: OnceLock<Arc<dyn TypeSerializer<V>>>,
}

impl<V: StateValue> ListStateDescriptor<V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            info: DescriptorInfo::new(name),
            element_serializer: OnceLock::new(),
        }
    }

    pub fn with_element_serializer(mut self, serializer: Arc<dyn TypeSerializer<V>>) -> Self {
        self.element_serializer = OnceLock::from(serializer);
        self
    }
}

impl<V: StateValue> StateDescriptor for ListStateDescriptor<V> {
    type State<N: Namespace> = KeyedListState<N, V>;

    const KIND: StateKind = StateKind::List;

    fn info(&self) -> &DescriptorInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut DescriptorInfo {
        &mut self.info
    }

    fn is_serializer_initialized(&self) -> bool {
        self.element_serializer.get().is_some()
    }

    fn initialize_serializer_unless_set(&self, config: &ExecutionConfig) {
        self.element_serializer
            .get_or_init(|| serializer_for::<V>(config.serializer_format));
    }

    fn create_state<N: Namespace>(&self, parts: StateParts<N>) -> Result<Self::State<N>> {
        let serializer = initialized(&self.element_serializer, &self.info.name)?;
        Ok(KeyedListState::new(StateCell::new(parts, Self::KIND), serializer))
    }
}

// ============================================================================
// Map
// ============================================================================

pub struct MapStateDescriptor<UK, UV> {
    info: DescriptorInfo,
    key_serializer: OnceLock<Arc<dyn TypeSerializer<UK>>>,
    value_serializer: OnceLock<Arc<dyn TypeSerializer<UV>>>,
}

impl<UK: StateKey, UV: StateValue> MapStateDescriptor<UK, UV> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            info: DescriptorInfo::new(name),
            key_serializer: OnceLock::new(),
            value_serializer: OnceLock::new(),
        }
    }

    pub fn with_serializers(
        mut self,
        key_serializer: Arc<dyn TypeSerializer<UK>>,
        value_serializer: Arc<dyn TypeSerializer<UV>>,
    ) -> Self {
        self.key_serializer = OnceLock::from(key_serializer);
        self.value_serializer = OnceLock::from(value_serializer);
        self
    }
}

impl<UK: StateKey, UV: StateValue> StateDescriptor for MapStateDescriptor<UK, UV> {
    type State<N: Namespace> = KeyedMapState<N, UK, UV>;

    const KIND: StateKind = StateKind::Map;

    fn info(&self) -> &DescriptorInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut DescriptorInfo {
        &mut self.info
    }

    fn is_serializer_initialized(&self) -> bool {
        self.key_serializer.get().is_some() && self.value_serializer.get().is_some()
    }

    fn initialize_serializer_unless_set(&self, config: &ExecutionConfig) {
        self.key_serializer
            .get_or_init(|| serializer_for::<UK>(config.serializer_format));
        self.value_serializer
            .get_or_init(|| serializer_for::<UV>(config.serializer_format));
    }

    fn create_state<N: Namespace>(&self, parts: StateParts<N>) -> Result<Self::State<N>> {
        let key_serializer = initialized(&self.key_serializer, &self.info.name)?;
        let value_serializer = initialized(&self.value_serializer, &self.info.name)?;
        Ok(KeyedMapState::new(
            StateCell::new(parts, Self::KIND),
            key_serializer,
            value_serializer,
        ))
    }
}

// ============================================================================
// Reducing
// ============================================================================

/// Combines the stored aggregate with a newly added value.
pub type ReduceFunction<V> = Arc<dyn Fn(&V, &V) -> V + Send + Sync>;

pub struct ReducingStateDescriptor<V> {
    info: DescriptorInfo,
    reduce_fn: ReduceFunction<V>,
    serializer: OnceLock<Arc<dyn TypeSerializer<V>>>,
}

impl<V: StateValue> ReducingStateDescriptor<V> {
    pub fn new<F>(name: impl Into<String>, reduce_fn: F) -> Self
    where
        F: Fn(&V, &V) -> V + Send + Sync + 'static,
    {
        Self {
            info: DescriptorInfo::new(name),
            reduce_fn: Arc::new(reduce_fn),
            serializer: OnceLock::new(),
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn TypeSerializer<V>>) -> Self {
        self.serializer = OnceLock::from(serializer);
        self
    }
}

impl<V: StateValue> StateDescriptor for ReducingStateDescriptor<V> {
    type State<N: Namespace> = KeyedReducingState<N, V>;

    const KIND: StateKind = StateKind::Reducing;

    fn info(&self) -> &DescriptorInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut DescriptorInfo {
        &mut self.info
    }

    fn is_serializer_initialized(&self) -> bool {
        self.serializer.get().is_some()
    }

    fn initialize_serializer_unless_set(&self, config: &ExecutionConfig) {
        self.serializer
            .get_or_init(|| serializer_for::<V>(config.serializer_format));
    }

    fn create_state<N: Namespace>(&self, parts: StateParts<N>) -> Result<Self::State<N>> {
        let serializer = initialized(&self.serializer, &self.info.name)?;
        Ok(KeyedReducingState::new(
            StateCell::new(parts, Self::KIND),
            serializer,
            self.reduce_fn.clone(),
        ))
    }
}
