//! Registry of resources that must be closed when the backend is torn down,
//! such as snapshot streams that are still open when a task is cancelled.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

use crate::error::{Result, StateError};

/// A resource that can be closed once.
pub trait Closeable: Send + Sync {
    fn close(&self) -> Result<()>;
}

/// Handle returned by [`CloseableRegistry::register`].
pub type RegistrationId = u64;

struct RegistryInner {
    closed: bool,
    next_id: RegistrationId,
    resources: Vec<(RegistrationId, Arc<dyn Closeable>)>,
}

/// Closes registered resources in reverse registration order.
pub struct CloseableRegistry {
    inner: Mutex<RegistryInner>,
}

impl CloseableRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                closed: false,
                next_id: 0,
                resources: Vec::new(),
            }),
        }
    }

    /// Register `resource`. If the registry is already closed the resource is
    /// closed right away and [`StateError::RegistryClosed`] is returned.
    pub fn register(&self, resource: Arc<dyn Closeable>) -> Result<RegistrationId> {
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            if let Err(err) = resource.close() {
                warn!(error = %err, "Failed to close resource registered after shutdown");
            }
            return Err(StateError::RegistryClosed);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.resources.push((id, resource));
        Ok(id)
    }

    /// Remove a registration without closing it. Returns whether it was present.
    pub fn unregister(&self, id: RegistrationId) -> bool {
        let mut inner = self.inner.lock();
        match inner.resources.iter().position(|(registered, _)| *registered == id) {
            Some(index) => {
                inner.resources.remove(index);
                true
            }
            None => false,
        }
    }

    /// Close every registered resource. Keeps going past failures and returns
    /// the first one. Calling this again is a no-op.
    pub fn close(&self) -> Result<()> {
        let resources = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            std::mem::take(&mut inner.resources)
        };

        let mut first_error = None;
        for (_, resource) in resources.into_iter().rev() {
            if let Err(err) = resource.close() {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    warn!(error = %err, "Suppressed error while closing resource");
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CloseableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        id: u32,
        fail: bool,
        log: Arc<Mutex<Vec<u32>>>,
    }

    impl Closeable for Recorder {
        fn close(&self) -> Result<()> {
            self.log.lock().push(self.id);
            if self.fail {
                return Err(StateError::IllegalState(format!("close {} failed", self.id)));
            }
            Ok(())
        }
    }

    fn recorder(id: u32, fail: bool, log: &Arc<Mutex<Vec<u32>>>) -> Arc<dyn Closeable> {
        Arc::new(Recorder {
            id,
            fail,
            log: log.clone(),
        })
    }

    #[test]
    fn test_close_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = CloseableRegistry::new();
        registry.register(recorder(1, false, &log)).unwrap();
        let second = registry.register(recorder(2, false, &log)).unwrap();
        registry.register(recorder(3, false, &log)).unwrap();

        assert!(registry.unregister(second));
        assert!(!registry.unregister(second));

        registry.close().unwrap();
        assert_eq!(*log.lock(), vec![3, 1]);
        assert!(registry.is_closed());

        registry.close().unwrap();
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_close_reports_first_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = CloseableRegistry::new();
        registry.register(recorder(1, true, &log)).unwrap();
        registry.register(recorder(2, true, &log)).unwrap();
        registry.register(recorder(3, false, &log)).unwrap();

        let err = registry.close().unwrap_err();
        assert!(err.to_string().contains("close 2 failed"));
        assert_eq!(*log.lock(), vec![3, 2, 1]);
    }

    #[test]
    fn test_register_after_close() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = CloseableRegistry::new();
        registry.close().unwrap();

        assert!(matches!(
            registry.register(recorder(9, false, &log)),
            Err(StateError::RegistryClosed)
        ));
        assert_eq!(*log.lock(), vec![9]);
        assert!(registry.is_empty());
    }
}
