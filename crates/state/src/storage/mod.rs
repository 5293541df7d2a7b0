//! Byte-level state storage and the decorators layered on top of it.
//!
//! Every state flavor reads and writes through [`StateStorage`]. The backend
//! wraps the raw storage of a named state in a fixed order: TTL innermost,
//! metrics tracking outermost. A disabled layer is simply not installed.

mod metrics;
mod ttl;

pub use metrics::{HistogramSummary, InMemoryStateMetrics, StateMetricGroup, StateOperation};
pub use ttl::{
    StateTtlConfig, SystemTimeProvider, TtlStateVisibility, TtlTimeProvider, TtlUpdateType,
};

#[cfg(test)]
pub(crate) use ttl::ManualTimeProvider;

use bytes::Bytes;
use std::sync::Arc;

use crate::config::{LatencyTrackingStateConfig, SizeTrackingStateConfig};
use crate::context::KeyCoordinates;
use crate::error::Result;

use metrics::MetricsTrackingStorage;
use ttl::TtlStorage;

/// Address of one stored value: key group, serialized key and namespace, and
/// for map states the serialized user key.
#[derive(Debug, Clone, Copy)]
pub struct StateCoordinate<'a> {
    pub key_group: u32,
    pub key: &'a [u8],
    pub namespace: &'a [u8],
    pub user_key: Option<&'a [u8]>,
}

impl<'a> StateCoordinate<'a> {
    pub fn new(key: &'a KeyCoordinates, namespace: &'a [u8]) -> Self {
        Self {
            key_group: key.key_group,
            key: &key.key,
            namespace,
            user_key: None,
        }
    }

    pub fn with_user_key(mut self, user_key: &'a [u8]) -> Self {
        self.user_key = Some(user_key);
        self
    }

    /// Serialized size of the address.
    pub fn len(&self) -> usize {
        self.key.len() + self.namespace.len() + self.user_key.map_or(0, <[u8]>::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The single capability every state flavor and decorator is built on.
pub trait StateStorage: Send + Sync {
    fn get(&self, at: &StateCoordinate<'_>) -> Result<Option<Bytes>>;

    fn put(&self, at: &StateCoordinate<'_>, value: Bytes) -> Result<()>;

    /// Remove a value, returning what was stored.
    fn remove(&self, at: &StateCoordinate<'_>) -> Result<Option<Bytes>>;

    /// All user-key entries stored under a key and namespace.
    fn entries(&self, key_group: u32, key: &[u8], namespace: &[u8]) -> Result<Vec<(Bytes, Bytes)>>;

    /// Remove the value and every user-key entry under a key and namespace.
    fn clear(&self, key_group: u32, key: &[u8], namespace: &[u8]) -> Result<()>;
}

/// Backend-wide inputs to the decorator chain.
pub(crate) struct DecoratorSettings<'a> {
    pub ttl_time_provider: &'a Arc<dyn TtlTimeProvider>,
    pub latency_tracking: &'a LatencyTrackingStateConfig,
    pub size_tracking: &'a SizeTrackingStateConfig,
    pub metric_group: Option<&'a Arc<dyn StateMetricGroup>>,
}

/// Wrap the raw storage of the state `name` with TTL and metrics tracking.
pub(crate) fn decorate(
    raw: Arc<dyn StateStorage>,
    name: &str,
    ttl: &StateTtlConfig,
    settings: &DecoratorSettings<'_>,
) -> Arc<dyn StateStorage> {
    let storage: Arc<dyn StateStorage> = if ttl.is_enabled() {
        Arc::new(TtlStorage::new(
            raw,
            ttl.clone(),
            settings.ttl_time_provider.clone(),
        ))
    } else {
        raw
    };

    let tracking = settings.latency_tracking.enabled || settings.size_tracking.enabled;
    match settings.metric_group {
        Some(group) if tracking => Arc::new(MetricsTrackingStorage::new(
            storage,
            name,
            settings.latency_tracking,
            settings.size_tracking,
            group.clone(),
        )),
        _ => storage,
    }
}
