// Typed capability registry shared by every frame of a task and its forks
//
// Middleware keep private state under their own type instead of agreeing on
// ambient string or symbol keys; the `TypeId` of the stored type is the key.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Type-keyed map of shared values
#[derive(Clone, Default)]
pub struct TypeMap {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl TypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, returning the one it replaces.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<Arc<T>> {
        self.entries
            .insert(TypeId::of::<T>(), Arc::new(value))
            .and_then(|previous| previous.downcast::<T>().ok())
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| Arc::clone(entry).downcast::<T>().ok())
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<Arc<T>> {
        self.entries
            .remove(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast::<T>().ok())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for TypeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMap")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Context handed to every middleware `filter` and `handle` call.
///
/// Cloning a `Context` yields another handle onto the same registry, which is
/// how forked tasks share it with their parent. The engine never reads or
/// writes entries itself.
#[derive(Clone, Default)]
pub struct Context {
    slots: Arc<Mutex<TypeMap>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&self, value: T) -> Option<Arc<T>> {
        self.slots.lock().insert(value)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.slots.lock().get::<T>()
    }

    /// Get the entry for `T`, creating it when absent.
    ///
    /// `init` runs without the registry lock held, so it may use this context.
    /// When concurrent forks race, the first value stored wins and every
    /// caller gets that one.
    pub fn get_or_insert_with<T, F>(&self, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.get::<T>() {
            return existing;
        }
        let value = Arc::new(init());
        let mut slots = self.slots.lock();
        if let Some(existing) = slots.get::<T>() {
            return existing;
        }
        slots
            .entries
            .insert(TypeId::of::<T>(), Arc::clone(&value) as Arc<dyn Any + Send + Sync>);
        value
    }

    pub fn remove<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.slots.lock().remove::<T>()
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.slots.lock().contains::<T>()
    }

    /// Whether two handles point at the same registry.
    pub fn same(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.slots, &other.slots)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("slots", &self.slots.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    struct Tenant(&'static str);

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[test]
    fn typed_slots_do_not_collide() {
        let ctx = Context::new();
        ctx.insert(Tenant("acme"));
        ctx.insert(42u32);

        assert_eq!(ctx.get::<Tenant>().as_deref(), Some(&Tenant("acme")));
        assert_eq!(ctx.get::<u32>().as_deref(), Some(&42));
        assert!(ctx.get::<u64>().is_none());
    }

    #[test]
    fn clones_share_the_registry() {
        let ctx = Context::new();
        let fork = ctx.clone();
        assert!(ctx.same(&fork));

        fork.get_or_insert_with(Counter::default)
            .0
            .fetch_add(1, Ordering::SeqCst);
        let counter = ctx.get_or_insert_with(Counter::default);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(!ctx.same(&Context::new()));
    }

    #[test]
    fn insert_returns_previous_and_remove_clears() {
        let ctx = Context::new();
        assert!(ctx.insert(Tenant("a")).is_none());
        assert_eq!(ctx.insert(Tenant("b")).as_deref(), Some(&Tenant("a")));
        assert_eq!(ctx.remove::<Tenant>().as_deref(), Some(&Tenant("b")));
        assert!(!ctx.contains::<Tenant>());
    }

    #[test]
    fn initializers_may_use_the_context() {
        let ctx = Context::new();
        ctx.insert(Tenant("acme"));

        let inner = ctx.clone();
        let label = ctx.get_or_insert_with(|| {
            let tenant = inner.get::<Tenant>().map(|t| t.0).unwrap_or_default();
            format!("{tenant}-cache")
        });
        assert_eq!(label.as_str(), "acme-cache");

        // A value stored while the initializer ran is kept.
        let kept = ctx.get_or_insert_with(|| {
            inner.insert(7u32);
            8u32
        });
        assert_eq!(*kept, 7);
    }
}
