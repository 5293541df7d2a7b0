//! Latency and size tracking for state accesses.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{StateCoordinate, StateStorage};
use crate::config::{LatencyTrackingStateConfig, SizeTrackingStateConfig};
use crate::error::Result;

/// Storage operations that can be sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateOperation {
    Get,
    Put,
    Remove,
    Entries,
    Clear,
}

impl StateOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateOperation::Get => "get",
            StateOperation::Put => "put",
            StateOperation::Remove => "remove",
            StateOperation::Entries => "entries",
            StateOperation::Clear => "clear",
        }
    }
}

/// Receiver of sampled state metrics, typically backed by the task's metric group.
pub trait StateMetricGroup: Send + Sync {
    /// Called once per tracked state before any latency sample is recorded.
    fn register_latency_tracking(&self, _state: &str, _history_size: usize) {}

    /// Called once per tracked state before any size sample is recorded.
    fn register_size_tracking(&self, _state: &str, _history_size: usize) {}

    fn record_latency(&self, state: &str, operation: StateOperation, latency: Duration);

    fn record_size(&self, state: &str, operation: StateOperation, bytes: usize);
}

// ============================================================================
// In-memory metric group
// ============================================================================

/// Summary over the retained samples of one (state, operation) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSummary {
    /// Samples recorded since creation, including evicted ones.
    pub count: u64,
    /// Samples currently retained.
    pub retained: usize,
    pub mean: f64,
    pub max: u64,
}

struct SampleHistory {
    samples: VecDeque<u64>,
    capacity: usize,
    count: u64,
}

impl SampleHistory {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            count: 0,
        }
    }

    fn record(&mut self, sample: u64) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.count += 1;
    }

    /// Keeps the newest samples when shrinking.
    fn set_capacity(&mut self, capacity: usize) {
        while self.samples.len() > capacity {
            self.samples.pop_front();
        }
        self.capacity = capacity;
    }

    fn summary(&self) -> HistogramSummary {
        let retained = self.samples.len();
        let sum: u64 = self.samples.iter().sum();
        HistogramSummary {
            count: self.count,
            retained,
            mean: if retained == 0 {
                0.0
            } else {
                sum as f64 / retained as f64
            },
            max: self.samples.iter().copied().max().unwrap_or(0),
        }
    }
}

#[derive(Default)]
struct Histories {
    /// History size per registered state.
    capacities: HashMap<String, usize>,
    samples: HashMap<(String, StateOperation), SampleHistory>,
}

/// Metric group keeping a bounded history of samples in memory.
///
/// Latencies are recorded in nanoseconds, sizes in bytes. States registered
/// through [`StateMetricGroup`] keep as many samples as their tracking config
/// asks for, others keep `default_history_size`.
pub struct InMemoryStateMetrics {
    default_history_size: usize,
    latencies: Mutex<Histories>,
    sizes: Mutex<Histories>,
}

impl InMemoryStateMetrics {
    pub fn new(default_history_size: usize) -> Self {
        Self {
            default_history_size: default_history_size.max(1),
            latencies: Mutex::new(Histories::default()),
            sizes: Mutex::new(Histories::default()),
        }
    }

    pub fn latency_summary(
        &self,
        state: &str,
        operation: StateOperation,
    ) -> Option<HistogramSummary> {
        Self::summary(&self.latencies, state, operation)
    }

    pub fn size_summary(&self, state: &str, operation: StateOperation) -> Option<HistogramSummary> {
        Self::summary(&self.sizes, state, operation)
    }

    fn summary(
        histories: &Mutex<Histories>,
        state: &str,
        operation: StateOperation,
    ) -> Option<HistogramSummary> {
        histories
            .lock()
            .samples
            .get(&(state.to_string(), operation))
            .map(SampleHistory::summary)
    }

    fn register(histories: &Mutex<Histories>, state: &str, history_size: usize) {
        let mut histories = histories.lock();
        let capacity = history_size.max(1);
        histories.capacities.insert(state.to_string(), capacity);
        for ((name, _), history) in histories.samples.iter_mut() {
            if name == state {
                history.set_capacity(capacity);
            }
        }
    }

    fn record(
        &self,
        histories: &Mutex<Histories>,
        state: &str,
        operation: StateOperation,
        sample: u64,
    ) {
        let mut histories = histories.lock();
        let capacity = histories
            .capacities
            .get(state)
            .copied()
            .unwrap_or(self.default_history_size);
        histories
            .samples
            .entry((state.to_string(), operation))
            .or_insert_with(|| SampleHistory::new(capacity))
            .record(sample);
    }
}

impl StateMetricGroup for InMemoryStateMetrics {
    fn register_latency_tracking(&self, state: &str, history_size: usize) {
        Self::register(&self.latencies, state, history_size);
    }

    fn register_size_tracking(&self, state: &str, history_size: usize) {
        Self::register(&self.sizes, state, history_size);
    }

    fn record_latency(&self, state: &str, operation: StateOperation, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.record(&self.latencies, state, operation, nanos);
    }

    fn record_size(&self, state: &str, operation: StateOperation, bytes: usize) {
        self.record(&self.sizes, state, operation, bytes as u64);
    }
}

// ============================================================================
// Tracking decorator
// ============================================================================

/// Picks every n-th access.
struct Sampler {
    interval: u32,
    accesses: AtomicU32,
}

impl Sampler {
    fn new(interval: u32) -> Self {
        Self {
            interval: interval.max(1),
            accesses: AtomicU32::new(0),
        }
    }

    fn should_sample(&self) -> bool {
        let seen = self.accesses.fetch_add(1, Ordering::Relaxed) + 1;
        if seen >= self.interval {
            self.accesses.store(0, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

/// Records latency and size samples around every storage operation without
/// touching results or errors.
pub(crate) struct MetricsTrackingStorage {
    inner: Arc<dyn StateStorage>,
    name: String,
    latency: Option<Sampler>,
    size: Option<Sampler>,
    group: Arc<dyn StateMetricGroup>,
}

impl MetricsTrackingStorage {
    pub(crate) fn new(
        inner: Arc<dyn StateStorage>,
        name: &str,
        latency: &LatencyTrackingStateConfig,
        size: &SizeTrackingStateConfig,
        group: Arc<dyn StateMetricGroup>,
    ) -> Self {
        if latency.enabled {
            group.register_latency_tracking(name, latency.history_size);
        }
        if size.enabled {
            group.register_size_tracking(name, size.history_size);
        }
        Self {
            inner,
            name: name.to_string(),
            latency: latency.enabled.then(|| Sampler::new(latency.sample_interval)),
            size: size.enabled.then(|| Sampler::new(size.sample_interval)),
            group,
        }
    }

    fn timed<T>(&self, operation: StateOperation, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let sampled = self.latency.as_ref().is_some_and(Sampler::should_sample);
        if !sampled {
            return f();
        }
        let start = Instant::now();
        let result = f();
        self.group
            .record_latency(&self.name, operation, start.elapsed());
        result
    }

    fn track_size(&self, operation: StateOperation, bytes: impl FnOnce() -> usize) {
        if self.size.as_ref().is_some_and(Sampler::should_sample) {
            self.group.record_size(&self.name, operation, bytes());
        }
    }
}

impl StateStorage for MetricsTrackingStorage {
    fn get(&self, at: &StateCoordinate<'_>) -> Result<Option<Bytes>> {
        let result = self.timed(StateOperation::Get, || self.inner.get(at));
        if let Ok(Some(value)) = &result {
            self.track_size(StateOperation::Get, || at.len() + value.len());
        }
        result
    }

    fn put(&self, at: &StateCoordinate<'_>, value: Bytes) -> Result<()> {
        let bytes = at.len() + value.len();
        let result = self.timed(StateOperation::Put, || self.inner.put(at, value));
        if result.is_ok() {
            self.track_size(StateOperation::Put, || bytes);
        }
        result
    }

    fn remove(&self, at: &StateCoordinate<'_>) -> Result<Option<Bytes>> {
        self.timed(StateOperation::Remove, || self.inner.remove(at))
    }

    fn entries(&self, key_group: u32, key: &[u8], namespace: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let result = self.timed(StateOperation::Entries, || {
            self.inner.entries(key_group, key, namespace)
        });
        if let Ok(entries) = &result {
            self.track_size(StateOperation::Entries, || {
                entries.iter().map(|(k, v)| k.len() + v.len()).sum()
            });
        }
        result
    }

    fn clear(&self, key_group: u32, key: &[u8], namespace: &[u8]) -> Result<()> {
        self.timed(StateOperation::Clear, || self.inner.clear(key_group, key, namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::KeyCoordinates;
    use crate::memory::HeapStateTable;
    use crate::traits::StateKind;

    #[test]
    fn test_sampler_interval() {
        let sampler = Sampler::new(3);
        let picks: Vec<bool> = (0..7).map(|_| sampler.should_sample()).collect();
        assert_eq!(picks, vec![false, false, true, false, false, true, false]);
    }

    #[test]
    fn test_history_is_bounded() {
        let metrics = InMemoryStateMetrics::new(2);
        for bytes in [10, 20, 30] {
            metrics.record_size("s", StateOperation::Put, bytes);
        }
        let summary = metrics.size_summary("s", StateOperation::Put).unwrap();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.retained, 2);
        assert_eq!(summary.max, 30);
        assert_eq!(summary.mean, 25.0);
        assert!(metrics.size_summary("s", StateOperation::Get).is_none());
    }

    #[test]
    fn test_tracking_keeps_results() {
        let metrics = Arc::new(InMemoryStateMetrics::new(16));
        let storage = MetricsTrackingStorage::new(
            Arc::new(HeapStateTable::new(StateKind::Value)),
            "counter",
            &LatencyTrackingStateConfig::enabled(2, 16),
            &SizeTrackingStateConfig::default(),
            metrics.clone(),
        );
        let key = KeyCoordinates {
            key: Bytes::from_static(b"k"),
            key_group: 0,
        };
        let at = StateCoordinate::new(&key, b"");

        assert_eq!(storage.get(&at).unwrap(), None);
        storage.put(&at, Bytes::from_static(b"1")).unwrap();
        assert_eq!(storage.get(&at).unwrap(), Some(Bytes::from_static(b"1")));
        assert_eq!(storage.remove(&at).unwrap(), Some(Bytes::from_static(b"1")));

        // interval 2 over get, put, get, remove samples put and remove
        assert!(metrics.latency_summary("counter", StateOperation::Get).is_none());
        assert_eq!(
            metrics
                .latency_summary("counter", StateOperation::Put)
                .unwrap()
                .count,
            1
        );
        assert_eq!(
            metrics
                .latency_summary("counter", StateOperation::Remove)
                .unwrap()
                .count,
            1
        );
        assert!(metrics.size_summary("counter", StateOperation::Put).is_none());
    }

    #[test]
    fn test_history_size_follows_tracking_config() {
        let metrics = Arc::new(InMemoryStateMetrics::new(16));
        let storage = MetricsTrackingStorage::new(
            Arc::new(HeapStateTable::new(StateKind::Value)),
            "counter",
            &LatencyTrackingStateConfig::enabled(1, 3),
            &SizeTrackingStateConfig::enabled(1, 2),
            metrics.clone(),
        );
        let key = KeyCoordinates {
            key: Bytes::from_static(b"k"),
            key_group: 0,
        };
        let at = StateCoordinate::new(&key, b"");
        for value in [&b"1"[..], b"22", b"333", b"4444"] {
            storage.put(&at, Bytes::copy_from_slice(value)).unwrap();
        }

        let sizes = metrics.size_summary("counter", StateOperation::Put).unwrap();
        assert_eq!(sizes.count, 4);
        assert_eq!(sizes.retained, 2);
        assert_eq!(sizes.max, 5);
        let latencies = metrics
            .latency_summary("counter", StateOperation::Put)
            .unwrap();
        assert_eq!(latencies.count, 4);
        assert_eq!(latencies.retained, 3);

        // unregistered states fall back to the default history size
        for bytes in 0..20 {
            metrics.record_size("other", StateOperation::Put, bytes);
        }
        assert_eq!(
            metrics
                .size_summary("other", StateOperation::Put)
                .unwrap()
                .retained,
            16
        );
    }
}
