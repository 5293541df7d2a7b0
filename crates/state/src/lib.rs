//! Keyed state backend for stateful stream operators.
//!
//! A [`KeyedStateBackend`] holds the per-key state of one parallel task
//! instance. Records are processed one key at a time:
//! - the current key is set, which assigns it to a key group
//! - named states are fetched through a [`StateDescriptor`], created on first use
//! - reads and writes go to the current key and the state's current namespace
//!
//! States come in four flavors:
//! - [`ValueState`]: Single value per key
//! - [`ListState`]: List of values per key
//! - [`MapState`]: Map of values per key
//! - [`ReducingState`]: Aggregated value with reduce function
//!
//! Storage is pluggable through [`StorageBackend`]; [`HeapStorageBackend`]
//! keeps everything in memory. TTL expiry and latency/size tracking are
//! layered onto a state's storage when configured.
//!
//! # Example
//!
//! ```ignore
//! use tandem_state::{
//!     BincodeSerializer, HeapStorageBackend, KeyedStateBackend, ValueState,
//!     ValueStateDescriptor, VoidNamespace,
//! };
//!
//! let backend = KeyedStateBackend::<String>::builder(
//!     Arc::new(HeapStorageBackend::new()),
//!     128,
//!     KeyGroupRange::of(0, 127)?,
//! )
//! .with_default_key_serializer()
//! .build()?;
//!
//! backend.set_current_key("user-123".to_string());
//! let counter = backend.get_partitioned_state(
//!     &VoidNamespace,
//!     Arc::new(BincodeSerializer::new()),
//!     &ValueStateDescriptor::<i64>::new("counter"),
//! )?;
//! counter.set(42)?;
//! assert_eq!(counter.get()?, Some(42));
//! ```

mod backend;
mod closeable;
mod compression;
mod config;
mod context;
mod descriptor;
mod error;
pub mod memory;
mod query;
mod registry;
mod serializer;
mod states;
pub mod storage;
mod traits;

// Re-export main types at crate root for convenience
pub use backend::{KeyedStateBackend, KeyedStateBackendBuilder};
pub use closeable::{Closeable, CloseableRegistry, RegistrationId};
pub use compression::StreamCompressionDecorator;
pub use config::{
    ExecutionConfig, KeyedStateBackendConfig, LatencyTrackingStateConfig, SerializerFormat,
    SizeTrackingStateConfig,
};
pub use context::{CurrentKeySource, KeyContext, KeyCoordinates, KeySelectionListener};
pub use descriptor::{
    DescriptorInfo, ListStateDescriptor, MapStateDescriptor, ReduceFunction,
    ReducingStateDescriptor, StateDescriptor, StateParts, ValueStateDescriptor,
};
pub use error::{Result, StateError};
pub use memory::{HeapStateTable, HeapStorageBackend};
pub use query::{KvStateRegistry, TaskKvStateRegistry};
pub use serializer::{
    serializer_for, BincodeSerializer, JsonSerializer, TypeSerializer, VoidNamespace,
};
pub use states::{KeyedListState, KeyedMapState, KeyedReducingState, KeyedValueState};
pub use storage::{
    InMemoryStateMetrics, StateCoordinate, StateMetricGroup, StateStorage, StateTtlConfig,
    TtlStateVisibility, TtlTimeProvider, TtlUpdateType,
};
pub use traits::{
    CheckpointListener, InternalKvState, KeyStream, ListState, MapState, Namespace,
    QueryableKvState, ReducingState, StateKey, StateKind, StateValue, StorageBackend, ValueState,
};

pub use tandem_core::{assign_to_key_group, KeyGroupRange};
