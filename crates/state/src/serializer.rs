//! Serializers for keys, namespaces and state values.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::SerializerFormat;
use crate::error::Result;

/// Encodes and decodes values of `T` to bytes.
pub trait TypeSerializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<Bytes>;

    fn deserialize(&self, bytes: &[u8]) -> Result<T>;
}

/// Compact binary serializer backed by bincode.
pub struct BincodeSerializer<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> BincodeSerializer<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> TypeSerializer<T> for BincodeSerializer<T> {
    fn serialize(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(value)?))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Human-readable serializer backed by serde_json.
pub struct JsonSerializer<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> TypeSerializer<T> for JsonSerializer<T> {
    fn serialize(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Pick the serializer for `format`.
pub fn serializer_for<T>(format: SerializerFormat) -> Arc<dyn TypeSerializer<T>>
where
    T: Serialize + DeserializeOwned + 'static,
{
    match format {
        SerializerFormat::Bincode => Arc::new(BincodeSerializer::<T>::new()),
        SerializerFormat::Json => Arc::new(JsonSerializer::<T>::new()),
    }
}

/// Namespace for state that is not partitioned by any secondary dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoidNamespace;
