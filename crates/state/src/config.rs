//! Backend configuration.

use serde::{Deserialize, Serialize};
use tandem_core::KeyGroupRange;

use crate::error::{Result, StateError};

/// Wire format used for keys, namespaces and values when no explicit
/// serializer is given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerFormat {
    #[default]
    Bincode,
    Json,
}

/// Execution-wide settings that influence every state of a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Compress key-group snapshot streams with snappy.
    pub use_snapshot_compression: bool,
    /// Format for serializers initialized lazily from descriptors.
    pub serializer_format: SerializerFormat,
}

/// Sampling of per-operation latency on decorated states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyTrackingStateConfig {
    pub enabled: bool,
    /// Every n-th access is measured.
    pub sample_interval: u32,
    /// Number of samples retained per state and operation.
    pub history_size: usize,
}

impl LatencyTrackingStateConfig {
    pub fn enabled(sample_interval: u32, history_size: usize) -> Self {
        Self {
            enabled: true,
            sample_interval,
            history_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_sampling("latency", self.sample_interval, self.history_size)
    }
}

impl Default for LatencyTrackingStateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_interval: 100,
            history_size: 128,
        }
    }
}

/// Sampling of key and value sizes on decorated states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeTrackingStateConfig {
    pub enabled: bool,
    pub sample_interval: u32,
    pub history_size: usize,
}

impl SizeTrackingStateConfig {
    pub fn enabled(sample_interval: u32, history_size: usize) -> Self {
        Self {
            enabled: true,
            sample_interval,
            history_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_sampling("size", self.sample_interval, self.history_size)
    }
}

impl Default for SizeTrackingStateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_interval: 100,
            history_size: 128,
        }
    }
}

fn validate_sampling(what: &str, sample_interval: u32, history_size: usize) -> Result<()> {
    if sample_interval == 0 {
        return Err(StateError::InvalidArgument(format!(
            "{what} tracking sample interval must be at least 1"
        )));
    }
    if history_size == 0 {
        return Err(StateError::InvalidArgument(format!(
            "{what} tracking history size must be at least 1"
        )));
    }
    Ok(())
}

/// Everything needed to construct a keyed state backend, loadable from JSON.
///
/// ```json
/// {
///   "number_of_key_groups": 128,
///   "key_group_range": { "start": 0, "end": 31 },
///   "execution": { "use_snapshot_compression": true },
///   "latency_tracking": { "enabled": true, "sample_interval": 10 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedStateBackendConfig {
    pub number_of_key_groups: u32,
    pub key_group_range: KeyGroupRange,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub latency_tracking: LatencyTrackingStateConfig,
    #[serde(default)]
    pub size_tracking: SizeTrackingStateConfig,
}

impl KeyedStateBackendConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
