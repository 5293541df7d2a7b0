//! Name -> materialized state bookkeeping with a last-access cache.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, StateError};
use crate::traits::QueryableKvState;

/// A materialized state, erased to be stored next to states of other types.
#[derive(Clone)]
pub(crate) struct RegisteredState {
    handle: Arc<dyn Any + Send + Sync>,
    queryable: Arc<dyn QueryableKvState>,
    type_name: &'static str,
}

impl RegisteredState {
    pub(crate) fn new<S>(state: Arc<S>) -> Self
    where
        S: QueryableKvState + Any,
    {
        Self {
            handle: state.clone(),
            queryable: state,
            type_name: type_name::<S>(),
        }
    }

    /// The typed handle, if the state was registered as `S`.
    pub(crate) fn downcast<S>(&self) -> Result<Arc<S>>
    where
        S: QueryableKvState + Any,
    {
        self.handle
            .clone()
            .downcast::<S>()
            .map_err(|_| StateError::TypeMismatch {
                name: self.queryable.name().to_string(),
                registered: self.type_name,
                requested: type_name::<S>(),
            })
    }
}

/// At most one materialized state per name.
pub(crate) struct NamedStateRegistry {
    states: HashMap<String, RegisteredState>,
    last_accessed: Option<(String, RegisteredState)>,
}

impl NamedStateRegistry {
    pub(crate) fn new() -> Self {
        Self {
            states: HashMap::new(),
            last_accessed: None,
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&RegisteredState> {
        self.states.get(name)
    }

    pub(crate) fn insert(&mut self, name: &str, state: RegisteredState) {
        self.states.insert(name.to_string(), state);
    }

    /// The cached state, only if it was the last one accessed under `name`.
    pub(crate) fn last_accessed(&self, name: &str) -> Option<&RegisteredState> {
        match &self.last_accessed {
            Some((last_name, state)) if last_name == name => Some(state),
            _ => None,
        }
    }

    /// Make the registered state `name` the last accessed one.
    pub(crate) fn promote(&mut self, name: &str) {
        self.last_accessed = self
            .states
            .get(name)
            .map(|state| (name.to_string(), state.clone()));
    }

    pub(crate) fn len(&self) -> usize {
        self.states.len()
    }

    pub(crate) fn clear(&mut self) {
        self.last_accessed = None;
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StateKind;
    use bytes::Bytes;

    struct Named(&'static str);

    impl QueryableKvState for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn kind(&self) -> StateKind {
            StateKind::Value
        }

        fn get_serialized_value(&self, _: u32, _: &[u8], _: &[u8]) -> Result<Option<Bytes>> {
            Ok(None)
        }
    }

    struct Other;

    impl QueryableKvState for Other {
        fn name(&self) -> &str {
            "other"
        }

        fn kind(&self) -> StateKind {
            StateKind::List
        }

        fn get_serialized_value(&self, _: u32, _: &[u8], _: &[u8]) -> Result<Option<Bytes>> {
            Ok(None)
        }
    }

    #[test]
    fn test_downcast_preserves_identity() {
        let state = Arc::new(Named("a"));
        let registered = RegisteredState::new(state.clone());
        let typed = registered.downcast::<Named>().unwrap();
        assert!(Arc::ptr_eq(&state, &typed));

        match registered.downcast::<Other>() {
            Err(StateError::TypeMismatch { name, .. }) => assert_eq!(name, "a"),
            _ => panic!("expected a type mismatch"),
        }
    }

    #[test]
    fn test_last_access_cache() {
        let mut registry = NamedStateRegistry::new();
        registry.insert("a", RegisteredState::new(Arc::new(Named("a"))));
        registry.insert("b", RegisteredState::new(Arc::new(Named("b"))));
        assert!(registry.last_accessed("a").is_none());

        registry.promote("a");
        assert!(registry.last_accessed("a").is_some());
        assert!(registry.last_accessed("b").is_none());

        registry.promote("b");
        assert!(registry.last_accessed("a").is_none());

        registry.clear();
        assert!(registry.last_accessed("b").is_none());
        assert_eq!(registry.len(), 0);
    }
}
