//! Host service registry

use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Type-keyed registry of host services
///
/// Plugins resolve host services by type during initialization, and
/// service-contributing plugins add their own. One instance per type; a
/// later insert replaces the earlier one.
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<TypeId, (&'static str, Arc<dyn Any + Send + Sync>)>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&'static str> = self.services.iter().map(|e| e.value().0).collect();
        f.debug_struct("ServiceRegistry")
            .field("services", &names)
            .finish()
    }
}

impl ServiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, returning the one it replaced
    pub fn insert<T: Send + Sync + 'static>(&self, service: Arc<T>) -> Option<Arc<T>> {
        let previous = self.services.insert(
            TypeId::of::<T>(),
            (std::any::type_name::<T>(), service as Arc<dyn Any + Send + Sync>),
        );
        previous.and_then(|(_, svc)| svc.downcast::<T>().ok())
    }

    /// Resolve a service by type
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let service = {
            let entry = self.services.get(&TypeId::of::<T>())?;
            Arc::clone(&entry.value().1)
        };
        service.downcast::<T>().ok()
    }

    /// Check whether a service of this type is registered
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<T>())
    }

    /// Remove a service by type
    pub fn remove<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let (_, (_, svc)) = self.services.remove(&TypeId::of::<T>())?;
        svc.downcast::<T>().ok()
    }

    /// Number of registered services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no services are registered
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Type names of all registered services
    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.services.iter().map(|e| e.value().0).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Greeter(&'static str);

    #[derive(Debug)]
    struct Clock;

    #[test]
    fn test_insert_and_get() {
        let registry = ServiceRegistry::new();
        assert!(registry.is_empty());

        registry.insert(Arc::new(Greeter("hello")));

        let greeter = registry.get::<Greeter>().unwrap();
        assert_eq!(*greeter, Greeter("hello"));
        assert!(registry.contains::<Greeter>());
        assert!(registry.get::<Clock>().is_none());
    }

    #[test]
    fn test_insert_replaces() {
        let registry = ServiceRegistry::new();
        assert!(registry.insert(Arc::new(Greeter("first"))).is_none());

        let previous = registry.insert(Arc::new(Greeter("second"))).unwrap();
        assert_eq!(*previous, Greeter("first"));
        assert_eq!(registry.len(), 1);
        assert_eq!(*registry.get::<Greeter>().unwrap(), Greeter("second"));
    }

    #[test]
    fn test_remove_and_names() {
        let registry = ServiceRegistry::new();
        registry.insert(Arc::new(Greeter("hi")));
        registry.insert(Arc::new(Clock));
        assert_eq!(registry.type_names().len(), 2);

        assert!(registry.remove::<Clock>().is_some());
        assert!(!registry.contains::<Clock>());
        assert_eq!(registry.len(), 1);
    }
}
