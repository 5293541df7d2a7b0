//! The keyed state backend: current key, named states and their lifecycle.

use parking_lot::{Mutex, RwLock};
use std::io::{Read, Write};
use std::sync::Arc;
use tandem_core::{CheckpointId, KeyGroupRange};
use tracing::{debug, info, warn};

use crate::closeable::CloseableRegistry;
use crate::compression::StreamCompressionDecorator;
use crate::config::{
    ExecutionConfig, KeyedStateBackendConfig, LatencyTrackingStateConfig, SizeTrackingStateConfig,
};
use crate::context::{CurrentKeySource, KeyContext, KeySelectionListener, KeySelectionListeners};
use crate::descriptor::{StateDescriptor, StateParts};
use crate::error::{Result, StateError};
use crate::query::KvStateRegistry;
use crate::registry::{NamedStateRegistry, RegisteredState};
use crate::serializer::{serializer_for, TypeSerializer};
use crate::storage::{
    decorate, DecoratorSettings, StateMetricGroup, SystemTimeProvider, TtlTimeProvider,
};
use crate::traits::{
    CheckpointListener, InternalKvState, Namespace, QueryableKvState, StateKey, StorageBackend,
};

/// State shared between a backend and every backend created from it by
/// [`KeyedStateBackend::share`].
struct SharedState<K> {
    key_context: Arc<KeyContext<K>>,
    registry: Mutex<NamedStateRegistry>,
    listeners: RwLock<KeySelectionListeners<K>>,
}

/// Keyed state backend of one parallel task instance.
///
/// Per-key operations run on the task thread only: the current key is set,
/// then named states are fetched and read or written under it.
pub struct KeyedStateBackend<K> {
    shared: Arc<SharedState<K>>,
    storage: Arc<dyn StorageBackend>,
    execution_config: ExecutionConfig,
    compression: StreamCompressionDecorator,
    latency_tracking: LatencyTrackingStateConfig,
    size_tracking: SizeTrackingStateConfig,
    metric_group: Option<Arc<dyn StateMetricGroup>>,
    ttl_time_provider: Arc<dyn TtlTimeProvider>,
    kv_state_registry: Option<Arc<dyn KvStateRegistry>>,
    closeable_registry: Arc<CloseableRegistry>,
}

impl<K: StateKey> KeyedStateBackend<K> {
    pub fn builder(
        storage: Arc<dyn StorageBackend>,
        number_of_key_groups: u32,
        key_group_range: KeyGroupRange,
    ) -> KeyedStateBackendBuilder<K> {
        KeyedStateBackendBuilder::new(storage, number_of_key_groups, key_group_range)
    }

    // ------------------------------------------------------------------------
    // Current key
    // ------------------------------------------------------------------------

    /// Notify listeners, then make `key` current and compute its key group.
    pub fn set_current_key(&self, key: K) {
        self.shared.listeners.read().notify(&key);
        self.shared.key_context.set_current_key(key);
    }

    /// Like [`KeyedStateBackend::set_current_key`] with an already known key group.
    pub fn set_current_key_and_key_group(&self, key: K, key_group: u32) {
        self.shared.listeners.read().notify(&key);
        self.shared
            .key_context
            .set_current_key_and_key_group(key, key_group);
    }

    pub fn set_current_key_group_index(&self, key_group: u32) {
        self.shared.key_context.set_current_key_group_index(key_group);
    }

    pub fn current_key(&self) -> Option<K> {
        self.shared.key_context.current_key()
    }

    pub fn current_key_group_index(&self) -> Option<u32> {
        self.shared.key_context.current_key_group_index()
    }

    /// Listeners run in registration order on every key change. They must not
    /// register or deregister listeners themselves.
    pub fn register_key_selection_listener(&self, listener: Arc<dyn KeySelectionListener<K>>) {
        self.shared.listeners.write().register(listener);
    }

    pub fn deregister_key_selection_listener(
        &self,
        listener: &Arc<dyn KeySelectionListener<K>>,
    ) -> bool {
        self.shared.listeners.write().deregister(listener)
    }

    // ------------------------------------------------------------------------
    // Named states
    // ------------------------------------------------------------------------

    /// The state described by `descriptor`, created and published on first use.
    pub fn get_or_create_keyed_state<N, D>(
        &self,
        namespace_serializer: Arc<dyn TypeSerializer<N>>,
        descriptor: &D,
    ) -> Result<Arc<D::State<N>>>
    where
        N: Namespace,
        D: StateDescriptor,
    {
        let mut registry = self.shared.registry.lock();
        self.get_or_create_locked(&mut registry, namespace_serializer, descriptor)
    }

    fn get_or_create_locked<N, D>(
        &self,
        registry: &mut NamedStateRegistry,
        namespace_serializer: Arc<dyn TypeSerializer<N>>,
        descriptor: &D,
    ) -> Result<Arc<D::State<N>>>
    where
        N: Namespace,
        D: StateDescriptor,
    {
        let name = descriptor.name();
        if let Some(registered) = registry.get(name) {
            return registered.downcast::<D::State<N>>();
        }

        if name.is_empty() {
            return Err(StateError::Configuration(
                "state descriptor must have a non-empty name".to_string(),
            ));
        }
        if self.shared.key_context.key_serializer().is_none() {
            return Err(missing_key_serializer());
        }
        if descriptor.is_queryable() && descriptor.ttl_config().is_enabled() {
            return Err(StateError::Configuration(format!(
                "queryable state '{name}' cannot use TTL"
            )));
        }
        if !descriptor.is_serializer_initialized() {
            descriptor.initialize_serializer_unless_set(&self.execution_config);
        }

        let raw = self.storage.create_storage(name, D::KIND)?;
        let storage = decorate(
            raw,
            name,
            descriptor.ttl_config(),
            &DecoratorSettings {
                ttl_time_provider: &self.ttl_time_provider,
                latency_tracking: &self.latency_tracking,
                size_tracking: &self.size_tracking,
                metric_group: self.metric_group.as_ref(),
            },
        );
        let keys: Arc<dyn CurrentKeySource> = self.shared.key_context.clone();
        let state = Arc::new(descriptor.create_state(StateParts {
            name: name.to_string(),
            storage,
            keys,
            namespace_serializer,
        })?);

        self.publish_queryable_state_if_enabled(descriptor, state.clone())?;
        registry.insert(name, RegisteredState::new(state.clone()));

        debug!(
            state = name,
            kind = %D::KIND,
            ttl = descriptor.ttl_config().is_enabled(),
            "Created keyed state"
        );
        Ok(state)
    }

    /// Hot-path accessor: the state for `descriptor` with its namespace set to
    /// `namespace`. The same handle is returned for every namespace.
    pub fn get_partitioned_state<N, D>(
        &self,
        namespace: &N,
        namespace_serializer: Arc<dyn TypeSerializer<N>>,
        descriptor: &D,
    ) -> Result<Arc<D::State<N>>>
    where
        N: Namespace,
        D: StateDescriptor,
    {
        let mut registry = self.shared.registry.lock();
        let name = descriptor.name();

        if let Some(last) = registry.last_accessed(name) {
            let state = last.downcast::<D::State<N>>()?;
            state.set_current_namespace(namespace)?;
            return Ok(state);
        }

        let existing = registry
            .get(name)
            .map(RegisteredState::downcast::<D::State<N>>)
            .transpose()?;
        let state = match existing {
            Some(state) => state,
            None => self.get_or_create_locked(&mut registry, namespace_serializer, descriptor)?,
        };
        registry.promote(name);
        state.set_current_namespace(namespace)?;
        Ok(state)
    }

    /// Register `state` with the query registry if `descriptor` asks for it.
    pub fn publish_queryable_state_if_enabled<D: StateDescriptor>(
        &self,
        descriptor: &D,
        state: Arc<dyn QueryableKvState>,
    ) -> Result<()> {
        let Some(queryable_name) = descriptor.queryable_name() else {
            return Ok(());
        };
        let registry = self.kv_state_registry.as_ref().ok_or_else(|| {
            StateError::IllegalState(format!(
                "state '{}' is queryable but the backend has no query registry attached",
                descriptor.name()
            ))
        })?;
        registry.register_kv_state(self.key_group_range(), queryable_name, state)?;
        debug!(
            state = descriptor.name(),
            queryable_name, "Published queryable state"
        );
        Ok(())
    }

    /// Run `function` for every key holding state under `descriptor` and
    /// `namespace`.
    ///
    /// One handle, with its namespace fixed, is passed to every call. Each key
    /// is made current before its call, and it is left current afterwards: the
    /// previous key is not restored. The first error stops the iteration.
    pub fn apply_to_all_keys<N, D, F>(
        &self,
        namespace: &N,
        namespace_serializer: Arc<dyn TypeSerializer<N>>,
        descriptor: &D,
        mut function: F,
    ) -> Result<()>
    where
        N: Namespace,
        D: StateDescriptor,
        F: FnMut(&K, &D::State<N>) -> anyhow::Result<()>,
    {
        let key_serializer = self
            .shared
            .key_context
            .key_serializer()
            .cloned()
            .ok_or_else(missing_key_serializer)?;
        let serialized_namespace = namespace_serializer.serialize(namespace)?;
        let keys = self.storage.keys(descriptor.name(), &serialized_namespace)?;

        let state = self.get_partitioned_state(namespace, namespace_serializer, descriptor)?;
        for serialized in keys {
            let key = key_serializer.deserialize(&serialized?)?;
            self.set_current_key(key.clone());
            function(&key, &*state).map_err(StateError::UserFunction)?;
        }
        Ok(())
    }

    /// Keys holding state under `name` and `namespace`, deserialized lazily.
    pub fn keys<N: Namespace>(
        &self,
        name: &str,
        namespace: &N,
        namespace_serializer: &dyn TypeSerializer<N>,
    ) -> Result<Box<dyn Iterator<Item = Result<K>> + Send>> {
        let key_serializer = self
            .shared
            .key_context
            .key_serializer()
            .cloned()
            .ok_or_else(missing_key_serializer)?;
        let serialized_namespace = namespace_serializer.serialize(namespace)?;
        let keys = self.storage.keys(name, &serialized_namespace)?;
        Ok(Box::new(keys.map(move |serialized| {
            key_serializer.deserialize(&serialized?)
        })))
    }

    pub fn num_key_value_states_by_name(&self) -> usize {
        self.shared.registry.lock().len()
    }

    // ------------------------------------------------------------------------
    // Key-group streams
    // ------------------------------------------------------------------------

    /// Write every state entry of `key_group` to `out` through the selected
    /// compression decorator.
    pub fn write_key_group(&self, key_group: u32, out: &mut dyn Write) -> Result<()> {
        self.check_key_group(key_group)?;
        let mut stream = self.compression.decorate_output(out);
        self.storage.write_key_group(key_group, &mut stream)?;
        stream.flush()?;
        Ok(())
    }

    /// Restore `key_group` from a stream written by [`KeyedStateBackend::write_key_group`].
    pub fn read_key_group(&self, key_group: u32, input: &mut dyn Read) -> Result<()> {
        self.check_key_group(key_group)?;
        let mut stream = self.compression.decorate_input(input);
        self.storage.read_key_group(key_group, &mut stream)
    }

    fn check_key_group(&self, key_group: u32) -> Result<()> {
        let range = self.key_group_range();
        if !range.contains(key_group) {
            return Err(StateError::InvalidArgument(format!(
                "key group {key_group} is outside of the backend's range {range}"
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Release resources and forget every named state. The backend must not
    /// be used afterwards.
    pub fn dispose(&self) {
        if let Err(err) = self.closeable_registry.close() {
            warn!(error = %err, "Failed to close stream registry during dispose");
        }
        if let Some(registry) = &self.kv_state_registry {
            if let Err(err) = registry.unregister_all() {
                warn!(error = %err, "Failed to unregister queryable state during dispose");
            }
        }
        let states = {
            let mut registry = self.shared.registry.lock();
            let states = registry.len();
            registry.clear();
            states
        };
        info!(states, storage = self.storage.name(), "Disposed keyed state backend");
    }

    /// Close the registered streams only. Named states stay available.
    pub fn close(&self) -> Result<()> {
        self.closeable_registry.close()
    }

    /// A second backend acting on the same key context, named states and
    /// listeners. The two must be disposed as one.
    pub fn share(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            storage: self.storage.clone(),
            execution_config: self.execution_config.clone(),
            compression: self.compression,
            latency_tracking: self.latency_tracking.clone(),
            size_tracking: self.size_tracking.clone(),
            metric_group: self.metric_group.clone(),
            ttl_time_provider: self.ttl_time_provider.clone(),
            kv_state_registry: self.kv_state_registry.clone(),
            closeable_registry: self.closeable_registry.clone(),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn key_group_range(&self) -> KeyGroupRange {
        self.shared.key_context.key_group_range()
    }

    pub fn number_of_key_groups(&self) -> u32 {
        self.shared.key_context.number_of_key_groups()
    }

    pub fn key_context(&self) -> &Arc<KeyContext<K>> {
        &self.shared.key_context
    }

    pub fn key_group_compression_decorator(&self) -> StreamCompressionDecorator {
        self.compression
    }

    pub fn execution_config(&self) -> &ExecutionConfig {
        &self.execution_config
    }

    pub fn latency_tracking_config(&self) -> &LatencyTrackingStateConfig {
        &self.latency_tracking
    }

    pub fn size_tracking_config(&self) -> &SizeTrackingStateConfig {
        &self.size_tracking
    }

    pub fn closeable_registry(&self) -> &Arc<CloseableRegistry> {
        &self.closeable_registry
    }

    pub fn storage_backend_name(&self) -> &'static str {
        self.storage.name()
    }
}

impl<K: StateKey> CheckpointListener for KeyedStateBackend<K> {
    fn notify_checkpoint_complete(&self, checkpoint_id: CheckpointId) -> Result<()> {
        debug!(checkpoint_id, "Checkpoint complete");
        Ok(())
    }
}

fn missing_key_serializer() -> StateError {
    StateError::Configuration(
        "state key serializer has not been configured, partitioned state is unavailable"
            .to_string(),
    )
}

// ============================================================================
// Builder
// ============================================================================

/// Validates settings and wires a [`KeyedStateBackend`].
pub struct KeyedStateBackendBuilder<K> {
    storage: Arc<dyn StorageBackend>,
    number_of_key_groups: u32,
    key_group_range: KeyGroupRange,
    key_serializer: Option<Arc<dyn TypeSerializer<K>>>,
    execution_config: ExecutionConfig,
    latency_tracking: LatencyTrackingStateConfig,
    size_tracking: SizeTrackingStateConfig,
    metric_group: Option<Arc<dyn StateMetricGroup>>,
    ttl_time_provider: Option<Arc<dyn TtlTimeProvider>>,
    kv_state_registry: Option<Arc<dyn KvStateRegistry>>,
    closeable_registry: Option<Arc<CloseableRegistry>>,
}

impl<K: StateKey> KeyedStateBackendBuilder<K> {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        number_of_key_groups: u32,
        key_group_range: KeyGroupRange,
    ) -> Self {
        Self {
            storage,
            number_of_key_groups,
            key_group_range,
            key_serializer: None,
            execution_config: ExecutionConfig::default(),
            latency_tracking: LatencyTrackingStateConfig::default(),
            size_tracking: SizeTrackingStateConfig::default(),
            metric_group: None,
            ttl_time_provider: None,
            kv_state_registry: None,
            closeable_registry: None,
        }
    }

    /// Start from a loaded config. The key serializer follows the configured
    /// serializer format.
    pub fn from_config(storage: Arc<dyn StorageBackend>, config: &KeyedStateBackendConfig) -> Self {
        Self::new(storage, config.number_of_key_groups, config.key_group_range)
            .with_execution_config(config.execution.clone())
            .with_latency_tracking(config.latency_tracking.clone())
            .with_size_tracking(config.size_tracking.clone())
            .with_default_key_serializer()
    }

    pub fn with_key_serializer(mut self, serializer: Arc<dyn TypeSerializer<K>>) -> Self {
        self.key_serializer = Some(serializer);
        self
    }

    /// Use the serializer of the execution config's format for keys.
    pub fn with_default_key_serializer(mut self) -> Self {
        self.key_serializer = Some(serializer_for::<K>(self.execution_config.serializer_format));
        self
    }

    pub fn with_execution_config(mut self, config: ExecutionConfig) -> Self {
        self.execution_config = config;
        self
    }

    pub fn with_latency_tracking(mut self, config: LatencyTrackingStateConfig) -> Self {
        self.latency_tracking = config;
        self
    }

    pub fn with_size_tracking(mut self, config: SizeTrackingStateConfig) -> Self {
        self.size_tracking = config;
        self
    }

    pub fn with_metric_group(mut self, group: Arc<dyn StateMetricGroup>) -> Self {
        self.metric_group = Some(group);
        self
    }

    pub fn with_ttl_time_provider(mut self, provider: Arc<dyn TtlTimeProvider>) -> Self {
        self.ttl_time_provider = Some(provider);
        self
    }

    pub fn with_kv_state_registry(mut self, registry: Arc<dyn KvStateRegistry>) -> Self {
        self.kv_state_registry = Some(registry);
        self
    }

    pub fn with_closeable_registry(mut self, registry: Arc<CloseableRegistry>) -> Self {
        self.closeable_registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<KeyedStateBackend<K>> {
        if self.number_of_key_groups < 1 {
            return Err(StateError::InvalidArgument(
                "number of key groups must be at least 1".to_string(),
            ));
        }
        if self.number_of_key_groups < self.key_group_range.number_of_key_groups() {
            return Err(StateError::InvalidArgument(format!(
                "number of key groups ({}) is smaller than the key group range {}",
                self.number_of_key_groups, self.key_group_range
            )));
        }
        if self.latency_tracking.enabled {
            self.latency_tracking.validate()?;
        }
        if self.size_tracking.enabled {
            self.size_tracking.validate()?;
        }
        if (self.latency_tracking.enabled || self.size_tracking.enabled)
            && self.metric_group.is_none()
        {
            return Err(StateError::Configuration(
                "state tracking is enabled but no metric group was provided".to_string(),
            ));
        }

        let compression = StreamCompressionDecorator::for_config(&self.execution_config);
        info!(
            number_of_key_groups = self.number_of_key_groups,
            key_group_range = %self.key_group_range,
            storage = self.storage.name(),
            compression = %compression,
            latency_tracking = self.latency_tracking.enabled,
            size_tracking = self.size_tracking.enabled,
            "Created keyed state backend"
        );

        Ok(KeyedStateBackend {
            shared: Arc::new(SharedState {
                key_context: Arc::new(KeyContext::new(
                    self.number_of_key_groups,
                    self.key_group_range,
                    self.key_serializer,
                )),
                registry: Mutex::new(NamedStateRegistry::new()),
                listeners: RwLock::new(KeySelectionListeners::new()),
            }),
            storage: self.storage,
            execution_config: self.execution_config,
            compression,
            latency_tracking: self.latency_tracking,
            size_tracking: self.size_tracking,
            metric_group: self.metric_group,
            ttl_time_provider: self
                .ttl_time_provider
                .unwrap_or_else(|| Arc::new(SystemTimeProvider)),
            kv_state_registry: self.kv_state_registry,
            closeable_registry: self
                .closeable_registry
                .unwrap_or_else(|| Arc::new(CloseableRegistry::new())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closeable::Closeable;
    use crate::config::SerializerFormat;
    use crate::descriptor::{
        ListStateDescriptor, MapStateDescriptor, ReducingStateDescriptor, ValueStateDescriptor,
    };
    use crate::memory::{HeapStateTable, HeapStorageBackend};
    use crate::query::TaskKvStateRegistry;
    use crate::serializer::{BincodeSerializer, VoidNamespace};
    use crate::storage::{
        InMemoryStateMetrics, ManualTimeProvider, StateOperation, StateStorage, StateTtlConfig,
    };
    use crate::traits::{KeyStream, ListState, MapState, ReducingState, StateKind, ValueState};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn backend_with(storage: Arc<dyn StorageBackend>) -> KeyedStateBackend<String> {
        KeyedStateBackend::builder(storage, 4, KeyGroupRange::of(0, 3).unwrap())
            .with_default_key_serializer()
            .build()
            .unwrap()
    }

    fn backend() -> KeyedStateBackend<String> {
        backend_with(Arc::new(HeapStorageBackend::new()))
    }

    fn void() -> Arc<dyn TypeSerializer<VoidNamespace>> {
        Arc::new(BincodeSerializer::new())
    }

    fn windows() -> Arc<dyn TypeSerializer<u64>> {
        Arc::new(BincodeSerializer::new())
    }

    // ------------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------------

    #[test]
    fn test_construction_validates_key_groups() {
        let build = |n: u32, range: KeyGroupRange| {
            KeyedStateBackend::<String>::builder(Arc::new(HeapStorageBackend::new()), n, range)
                .build()
        };
        assert!(build(4, KeyGroupRange::of(0, 3).unwrap()).is_ok());
        assert!(build(8, KeyGroupRange::of(2, 3).unwrap()).is_ok());
        assert!(matches!(
            build(0, KeyGroupRange::empty()),
            Err(StateError::InvalidArgument(_))
        ));
        assert!(matches!(
            build(3, KeyGroupRange::of(0, 3).unwrap()),
            Err(StateError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_tracking_requires_metric_group() {
        let result = KeyedStateBackend::<String>::builder(
            Arc::new(HeapStorageBackend::new()),
            4,
            KeyGroupRange::of(0, 3).unwrap(),
        )
        .with_latency_tracking(LatencyTrackingStateConfig::enabled(10, 10))
        .build();
        assert!(matches!(result, Err(StateError::Configuration(_))));

        let result = KeyedStateBackend::<String>::builder(
            Arc::new(HeapStorageBackend::new()),
            4,
            KeyGroupRange::of(0, 3).unwrap(),
        )
        .with_size_tracking(SizeTrackingStateConfig::enabled(0, 10))
        .with_metric_group(Arc::new(InMemoryStateMetrics::new(10)))
        .build();
        assert!(matches!(result, Err(StateError::InvalidArgument(_))));
    }

    #[test]
    fn test_compression_follows_execution_config() {
        let config = KeyedStateBackendConfig::from_json(
            r#"{
                "number_of_key_groups": 4,
                "key_group_range": { "start": 0, "end": 3 },
                "execution": { "use_snapshot_compression": true }
            }"#,
        )
        .unwrap();
        let compressed: KeyedStateBackend<String> =
            KeyedStateBackendBuilder::from_config(Arc::new(HeapStorageBackend::new()), &config)
                .build()
                .unwrap();
        assert_eq!(
            compressed.key_group_compression_decorator(),
            StreamCompressionDecorator::Snappy
        );
        assert_eq!(
            backend().key_group_compression_decorator(),
            StreamCompressionDecorator::Uncompressed
        );
    }

    // ------------------------------------------------------------------------
    // Current key and listeners
    // ------------------------------------------------------------------------

    #[test]
    fn test_set_current_key() {
        let backend = backend();
        assert!(backend.current_key().is_none());

        backend.set_current_key("user-1".to_string());
        assert_eq!(backend.current_key().as_deref(), Some("user-1"));
        let key_group = backend.current_key_group_index().unwrap();
        assert!(key_group < 4);
        assert_eq!(
            key_group,
            tandem_core::assign_to_key_group(&"user-1".to_string(), 4)
        );

        backend.set_current_key_and_key_group("user-2".to_string(), 2);
        assert_eq!(backend.current_key_group_index(), Some(2));
        backend.set_current_key_group_index(1);
        assert_eq!(backend.current_key_group_index(), Some(1));
        assert_eq!(backend.current_key().as_deref(), Some("user-2"));
    }

    #[test]
    fn test_listeners_notified_in_order() {
        let backend = backend();
        let log = Arc::new(Mutex::new(Vec::new()));

        let log_a = log.clone();
        let a: Arc<dyn KeySelectionListener<String>> =
            Arc::new(move |key: &String| log_a.lock().push(format!("a:{key}")));
        let log_b = log.clone();
        let b: Arc<dyn KeySelectionListener<String>> =
            Arc::new(move |key: &String| log_b.lock().push(format!("b:{key}")));

        backend.register_key_selection_listener(a.clone());
        backend.register_key_selection_listener(b.clone());
        backend.set_current_key("x".to_string());
        assert_eq!(*log.lock(), vec!["a:x", "b:x"]);

        assert!(backend.deregister_key_selection_listener(&a));
        assert!(!backend.deregister_key_selection_listener(&a));
        backend.set_current_key_and_key_group("y".to_string(), 0);
        assert_eq!(*log.lock(), vec!["a:x", "b:x", "b:y"]);
    }

    // ------------------------------------------------------------------------
    // Named states
    // ------------------------------------------------------------------------

    #[test]
    fn test_partitioned_state_is_reused_across_namespaces() {
        let backend = backend();
        let descriptor = ValueStateDescriptor::<i64>::new("count");
        backend.set_current_key("key1".to_string());

        let first = backend
            .get_partitioned_state(&1u64, windows(), &descriptor)
            .unwrap();
        first.set(10).unwrap();
        let second = backend
            .get_partitioned_state(&2u64, windows(), &descriptor)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.get().unwrap(), None);

        // a different name evicts the cache; the map still returns the same handle
        let other = ValueStateDescriptor::<i64>::new("other");
        backend
            .get_partitioned_state(&1u64, windows(), &other)
            .unwrap();
        let third = backend
            .get_partitioned_state(&1u64, windows(), &descriptor)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(third.get().unwrap(), Some(10));
        assert_eq!(backend.num_key_value_states_by_name(), 2);
    }

    #[test]
    fn test_state_flavors_through_backend() {
        let backend = backend();
        backend.set_current_key("key1".to_string());

        let list = backend
            .get_partitioned_state(
                &VoidNamespace,
                void(),
                &ListStateDescriptor::<String>::new("events"),
            )
            .unwrap();
        list.add("a".to_string()).unwrap();
        list.add("b".to_string()).unwrap();
        assert_eq!(list.get().unwrap(), vec!["a", "b"]);

        let map = backend
            .get_partitioned_state(
                &VoidNamespace,
                void(),
                &MapStateDescriptor::<String, u32>::new("index"),
            )
            .unwrap();
        map.put("x".to_string(), 1).unwrap();
        assert_eq!(map.get(&"x".to_string()).unwrap(), Some(1));

        let sum = backend
            .get_partitioned_state(
                &VoidNamespace,
                void(),
                &ReducingStateDescriptor::<i64>::new("sum", |a: &i64, b: &i64| a + b),
            )
            .unwrap();
        sum.add(10).unwrap();
        sum.add(5).unwrap();
        assert_eq!(sum.get().unwrap(), Some(15));

        backend.set_current_key("key2".to_string());
        assert!(list.get().unwrap().is_empty());
        assert!(map.is_empty().unwrap());
        assert_eq!(sum.get().unwrap(), None);
    }

    #[test]
    fn test_same_name_with_other_type_is_rejected() {
        let backend = backend();
        backend
            .get_or_create_keyed_state(void(), &ValueStateDescriptor::<i64>::new("s"))
            .unwrap();
        let result =
            backend.get_or_create_keyed_state(void(), &ValueStateDescriptor::<String>::new("s"));
        assert!(matches!(result, Err(StateError::TypeMismatch { .. })));
    }

    #[test]
    fn test_missing_key_serializer() {
        let backend: KeyedStateBackend<String> = KeyedStateBackend::builder(
            Arc::new(HeapStorageBackend::new()),
            4,
            KeyGroupRange::of(0, 3).unwrap(),
        )
        .build()
        .unwrap();
        let result =
            backend.get_or_create_keyed_state(void(), &ValueStateDescriptor::<i64>::new("s"));
        assert!(matches!(result, Err(StateError::Configuration(_))));

        let result =
            backend.get_or_create_keyed_state(void(), &ValueStateDescriptor::<i64>::new(""));
        assert!(matches!(result, Err(StateError::Configuration(_))));
    }

    #[test]
    fn test_value_serializer_follows_execution_config() {
        let storage = Arc::new(HeapStorageBackend::new());
        let backend: KeyedStateBackend<String> = KeyedStateBackend::builder(
            storage.clone(),
            4,
            KeyGroupRange::of(0, 3).unwrap(),
        )
        .with_execution_config(ExecutionConfig {
            serializer_format: SerializerFormat::Json,
            ..Default::default()
        })
        .with_default_key_serializer()
        .build()
        .unwrap();

        let descriptor = ValueStateDescriptor::<String>::new("label");
        assert!(!descriptor.is_serializer_initialized());
        backend.set_current_key("k".to_string());
        backend
            .get_partitioned_state(&VoidNamespace, void(), &descriptor)
            .unwrap()
            .set("hi".to_string())
            .unwrap();
        assert!(descriptor.is_serializer_initialized());

        let table = storage.table("label").unwrap();
        let coordinates = backend.key_context().current_key_coordinates().unwrap();
        assert_eq!(&coordinates.key[..], b"\"k\"");
        let namespace = BincodeSerializer::<VoidNamespace>::new()
            .serialize(&VoidNamespace)
            .unwrap();
        let stored = table
            .get(&crate::storage::StateCoordinate::new(&coordinates, &namespace))
            .unwrap();
        assert_eq!(stored, Some(Bytes::from_static(b"\"hi\"")));
    }

    // ------------------------------------------------------------------------
    // Queryable state
    // ------------------------------------------------------------------------

    #[test]
    fn test_queryable_state_requires_registry() {
        let backend = backend();
        let plain = ValueStateDescriptor::<i64>::new("plain");
        assert!(backend.get_or_create_keyed_state(void(), &plain).is_ok());

        let queryable = ValueStateDescriptor::<i64>::new("queried").with_queryable("q");
        let result = backend.get_or_create_keyed_state(void(), &queryable);
        assert!(matches!(result, Err(StateError::IllegalState(_))));
        assert_eq!(backend.num_key_value_states_by_name(), 1);
    }

    #[test]
    fn test_queryable_state_is_published_and_served() {
        let registry = Arc::new(TaskKvStateRegistry::new());
        let backend: KeyedStateBackend<String> = KeyedStateBackend::builder(
            Arc::new(HeapStorageBackend::new()),
            4,
            KeyGroupRange::of(0, 3).unwrap(),
        )
        .with_default_key_serializer()
        .with_kv_state_registry(registry.clone())
        .build()
        .unwrap();

        backend
            .get_or_create_keyed_state(void(), &ValueStateDescriptor::<i64>::new("plain"))
            .unwrap();
        assert!(registry.registered_names().is_empty());

        let descriptor = ValueStateDescriptor::<i64>::new("count").with_queryable("count-q");
        backend.set_current_key("k".to_string());
        backend
            .get_partitioned_state(&VoidNamespace, void(), &descriptor)
            .unwrap()
            .set(5)
            .unwrap();
        assert_eq!(registry.registered_names(), vec!["count-q"]);

        let coordinates = backend.key_context().current_key_coordinates().unwrap();
        let namespace = void().serialize(&VoidNamespace).unwrap();
        let raw = registry
            .lookup("count-q", coordinates.key_group, &coordinates.key, &namespace)
            .unwrap()
            .unwrap();
        assert_eq!(bincode::deserialize::<i64>(&raw).unwrap(), 5);

        backend.dispose();
        assert!(registry.registered_names().is_empty());
    }

    #[test]
    fn test_queryable_state_with_ttl_is_rejected() {
        let backend = backend();
        let descriptor = ValueStateDescriptor::<i64>::new("s")
            .with_ttl(StateTtlConfig::new(Duration::from_secs(1)))
            .with_queryable("q");
        let result = backend.get_or_create_keyed_state(void(), &descriptor);
        assert!(matches!(result, Err(StateError::Configuration(_))));
    }

    // ------------------------------------------------------------------------
    // Decorators
    // ------------------------------------------------------------------------

    #[test]
    fn test_ttl_and_metrics_are_applied() {
        let time = Arc::new(ManualTimeProvider::new(0));
        let metrics = Arc::new(InMemoryStateMetrics::new(16));
        let backend: KeyedStateBackend<String> = KeyedStateBackend::builder(
            Arc::new(HeapStorageBackend::new()),
            4,
            KeyGroupRange::of(0, 3).unwrap(),
        )
        .with_default_key_serializer()
        .with_ttl_time_provider(time.clone())
        .with_latency_tracking(LatencyTrackingStateConfig::enabled(1, 16))
        .with_metric_group(metrics.clone())
        .build()
        .unwrap();

        let descriptor = ValueStateDescriptor::<i64>::new("session")
            .with_ttl(StateTtlConfig::new(Duration::from_millis(100)));
        backend.set_current_key("k".to_string());
        let state = backend
            .get_partitioned_state(&VoidNamespace, void(), &descriptor)
            .unwrap();

        state.set(1).unwrap();
        time.advance(99);
        assert_eq!(state.get().unwrap(), Some(1));
        time.advance(1);
        assert_eq!(state.get().unwrap(), None);

        let gets = metrics
            .latency_summary("session", StateOperation::Get)
            .unwrap();
        assert_eq!(gets.count, 2);
        assert!(metrics
            .latency_summary("session", StateOperation::Put)
            .is_some());
    }

    // ------------------------------------------------------------------------
    // Bulk key iteration
    // ------------------------------------------------------------------------

    /// Storage that hands out a fixed key sequence and records its release.
    struct ScriptedStorage {
        keys: Vec<String>,
        released: Arc<AtomicBool>,
    }

    struct ScriptedKeys {
        inner: std::vec::IntoIter<Result<Bytes>>,
        released: Arc<AtomicBool>,
    }

    impl Iterator for ScriptedKeys {
        type Item = Result<Bytes>;

        fn next(&mut self) -> Option<Self::Item> {
            self.inner.next()
        }
    }

    impl Drop for ScriptedKeys {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    impl StorageBackend for ScriptedStorage {
        fn create_storage(&self, _name: &str, kind: StateKind) -> Result<Arc<dyn StateStorage>> {
            Ok(Arc::new(HeapStateTable::new(kind)))
        }

        fn keys(&self, _name: &str, _namespace: &[u8]) -> Result<KeyStream> {
            let serializer = BincodeSerializer::<String>::new();
            let keys = self
                .keys
                .iter()
                .map(|key| serializer.serialize(key))
                .collect::<Vec<_>>();
            Ok(Box::new(ScriptedKeys {
                inner: keys.into_iter(),
                released: self.released.clone(),
            }))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn scripted() -> (KeyedStateBackend<String>, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        let storage = ScriptedStorage {
            keys: vec!["k1".to_string(), "k2".to_string(), "k3".to_string()],
            released: released.clone(),
        };
        (backend_with(Arc::new(storage)), released)
    }

    #[test]
    fn test_apply_to_all_keys_visits_every_key() {
        let (backend, released) = scripted();
        let descriptor = ValueStateDescriptor::<i64>::new("count");
        let mut seen = Vec::new();
        let mut handles: Vec<*const KeyedValueStateOf> = Vec::new();

        backend
            .apply_to_all_keys(&VoidNamespace, void(), &descriptor, |key, state| {
                seen.push((key.clone(), backend.current_key()));
                handles.push(state as *const _);
                state.set(key.len() as i64)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(
            seen,
            vec![
                ("k1".to_string(), Some("k1".to_string())),
                ("k2".to_string(), Some("k2".to_string())),
                ("k3".to_string(), Some("k3".to_string())),
            ]
        );
        assert!(handles.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(backend.current_key().as_deref(), Some("k3"));
        assert!(released.load(Ordering::SeqCst));
    }

    type KeyedValueStateOf = crate::states::KeyedValueState<VoidNamespace, i64>;

    #[test]
    fn test_apply_to_all_keys_stops_on_error() {
        let (backend, released) = scripted();
        let descriptor = ValueStateDescriptor::<i64>::new("count");
        let mut calls = 0;

        let result = backend.apply_to_all_keys(&VoidNamespace, void(), &descriptor, |key, _| {
            calls += 1;
            if key == "k2" {
                anyhow::bail!("cannot process {key}");
            }
            Ok(())
        });

        match result {
            Err(StateError::UserFunction(err)) => assert_eq!(err.to_string(), "cannot process k2"),
            other => panic!("expected a user function error, got {other:?}"),
        }
        assert_eq!(calls, 2);
        assert_eq!(backend.current_key().as_deref(), Some("k2"));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_keys_over_heap_storage() {
        let backend = backend();
        let descriptor = ValueStateDescriptor::<i64>::new("count");
        for key in ["a", "b"] {
            backend.set_current_key(key.to_string());
            backend
                .get_partitioned_state(&7u64, windows(), &descriptor)
                .unwrap()
                .set(1)
                .unwrap();
        }

        let mut keys = backend
            .keys("count", &7u64, &BincodeSerializer::<u64>::new())
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(
            backend
                .keys("count", &8u64, &BincodeSerializer::<u64>::new())
                .unwrap()
                .count(),
            0
        );
    }

    // ------------------------------------------------------------------------
    // Key-group streams
    // ------------------------------------------------------------------------

    #[test]
    fn test_key_group_streams_roundtrip_compressed() {
        let build = || {
            KeyedStateBackend::<String>::builder(
                Arc::new(HeapStorageBackend::new()),
                4,
                KeyGroupRange::of(0, 3).unwrap(),
            )
            .with_execution_config(ExecutionConfig {
                use_snapshot_compression: true,
                ..Default::default()
            })
            .with_default_key_serializer()
            .build()
            .unwrap()
        };
        let source = build();
        let descriptor = ValueStateDescriptor::<i64>::new("count");
        source.set_current_key("key1".to_string());
        let key_group = source.current_key_group_index().unwrap();
        source
            .get_partitioned_state(&VoidNamespace, void(), &descriptor)
            .unwrap()
            .set(99)
            .unwrap();

        let mut buf = Vec::new();
        source.write_key_group(key_group, &mut buf).unwrap();
        assert!(buf.starts_with(b"\xff\x06\x00\x00sNaPpY"));

        let target = build();
        target.read_key_group(key_group, &mut buf.as_slice()).unwrap();
        target.set_current_key("key1".to_string());
        let restored = target
            .get_partitioned_state(&VoidNamespace, void(), &descriptor)
            .unwrap();
        assert_eq!(restored.get().unwrap(), Some(99));

        assert!(matches!(
            source.write_key_group(4, &mut Vec::new()),
            Err(StateError::InvalidArgument(_))
        ));
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    #[test]
    fn test_dispose_forgets_states() {
        let backend = backend();
        let descriptor = ValueStateDescriptor::<i64>::new("count");
        let before = backend
            .get_or_create_keyed_state(void(), &descriptor)
            .unwrap();

        backend.dispose();
        assert_eq!(backend.num_key_value_states_by_name(), 0);

        let after = backend
            .get_or_create_keyed_state(void(), &descriptor)
            .unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    struct Flag(Arc<AtomicBool>);

    impl Closeable for Flag {
        fn close(&self) -> Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_close_only_closes_streams() {
        let backend = backend();
        let closed = Arc::new(AtomicBool::new(false));
        backend
            .closeable_registry()
            .register(Arc::new(Flag(closed.clone())))
            .unwrap();
        backend
            .get_or_create_keyed_state(void(), &ValueStateDescriptor::<i64>::new("count"))
            .unwrap();

        backend.close().unwrap();
        backend.close().unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(backend.num_key_value_states_by_name(), 1);
    }

    #[test]
    fn test_checkpoint_notifications_are_accepted() {
        let backend = backend();
        backend.notify_checkpoint_complete(3).unwrap();
        backend.notify_checkpoint_aborted(4).unwrap();
        backend.notify_checkpoint_subsumed(3).unwrap();
    }

    #[test]
    fn test_shared_backend_acts_as_one() {
        let backend = backend();
        let wrapper = backend.share();
        let descriptor = ValueStateDescriptor::<i64>::new("count");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        wrapper.register_key_selection_listener(Arc::new(move |key: &String| {
            sink.lock().push(key.clone())
        }));

        backend.set_current_key("k".to_string());
        assert_eq!(wrapper.current_key().as_deref(), Some("k"));
        assert_eq!(*seen.lock(), vec!["k"]);

        let a = backend
            .get_or_create_keyed_state(void(), &descriptor)
            .unwrap();
        let b = wrapper
            .get_or_create_keyed_state(void(), &descriptor)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
