//! Registration of queryable state for external point lookups.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tandem_core::KeyGroupRange;
use tracing::debug;

use crate::error::{Result, StateError};
use crate::traits::QueryableKvState;

/// Collaborator that exposes materialized states to a query service.
pub trait KvStateRegistry: Send + Sync {
    fn register_kv_state(
        &self,
        key_group_range: KeyGroupRange,
        registration_name: &str,
        state: Arc<dyn QueryableKvState>,
    ) -> Result<()>;

    /// Drop every registration made through this registry.
    fn unregister_all(&self) -> Result<()>;
}

struct Registration {
    key_group_range: KeyGroupRange,
    state: Arc<dyn QueryableKvState>,
}

/// Per-task registry serving lookups in process.
#[derive(Default)]
pub struct TaskKvStateRegistry {
    registrations: RwLock<HashMap<String, Registration>>,
}

impl TaskKvStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialized value of `registration_name` for the given key and namespace.
    pub fn lookup(
        &self,
        registration_name: &str,
        key_group: u32,
        key: &[u8],
        namespace: &[u8],
    ) -> Result<Option<Bytes>> {
        let state = {
            let registrations = self.registrations.read();
            let registration = registrations.get(registration_name).ok_or_else(|| {
                StateError::InvalidArgument(format!(
                    "no queryable state registered as '{registration_name}'"
                ))
            })?;
            if !registration.key_group_range.contains(key_group) {
                return Err(StateError::InvalidArgument(format!(
                    "key group {key_group} is not served by '{registration_name}' ({})",
                    registration.key_group_range
                )));
            }
            registration.state.clone()
        };
        state.get_serialized_value(key_group, key, namespace)
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registrations.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_registered(&self, registration_name: &str) -> bool {
        self.registrations.read().contains_key(registration_name)
    }
}

impl KvStateRegistry for TaskKvStateRegistry {
    fn register_kv_state(
        &self,
        key_group_range: KeyGroupRange,
        registration_name: &str,
        state: Arc<dyn QueryableKvState>,
    ) -> Result<()> {
        let mut registrations = self.registrations.write();
        if registrations.contains_key(registration_name) {
            return Err(StateError::IllegalState(format!(
                "queryable state '{registration_name}' is already registered"
            )));
        }
        debug!(
            registration = registration_name,
            state = state.name(),
            %key_group_range,
            "Registered queryable state"
        );
        registrations.insert(
            registration_name.to_string(),
            Registration {
                key_group_range,
                state,
            },
        );
        Ok(())
    }

    fn unregister_all(&self) -> Result<()> {
        self.registrations.write().clear();
        Ok(())
    }
}
