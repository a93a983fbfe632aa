//! Handle → callback set association shared by every engine instance
//!
//! Registration, lookup and removal are serialised by a single `RwLock`. Dispatch holds
//! the read lock for exactly the duration of the callback, so a concurrent
//! [`CallbackRegistry::remove`] waits until in-flight callbacks have returned and
//! nothing fires for the handle afterwards.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::trace;

use super::{EngineError, Handle, LogLevel, QoS, RequestId};

type ConnectFn = Box<dyn Fn(Option<EngineError>) + Send + Sync>;
type SubscribeFn = Box<dyn Fn(RequestId, &[Option<QoS>]) + Send + Sync>;
type AckFn = Box<dyn Fn(RequestId) + Send + Sync>;
type MessageFn = Box<dyn Fn(RequestId, &str, &[u8]) + Send + Sync>;
type LogFn = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Callbacks installed for one engine instance. Unset callbacks are no-ops.
#[derive(Default)]
pub struct CallbackSet {
    connect: Option<ConnectFn>,
    disconnect: Option<ConnectFn>,
    subscribe: Option<SubscribeFn>,
    unsubscribe: Option<AckFn>,
    publish: Option<AckFn>,
    message: Option<MessageFn>,
    log: Option<LogFn>,
}

impl CallbackSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect(mut self, f: impl Fn(Option<EngineError>) + Send + Sync + 'static) -> Self {
        self.connect = Some(Box::new(f));
        self
    }

    pub fn with_disconnect(
        mut self,
        f: impl Fn(Option<EngineError>) + Send + Sync + 'static,
    ) -> Self {
        self.disconnect = Some(Box::new(f));
        self
    }

    pub fn with_subscribe(
        mut self,
        f: impl Fn(RequestId, &[Option<QoS>]) + Send + Sync + 'static,
    ) -> Self {
        self.subscribe = Some(Box::new(f));
        self
    }

    pub fn with_unsubscribe(mut self, f: impl Fn(RequestId) + Send + Sync + 'static) -> Self {
        self.unsubscribe = Some(Box::new(f));
        self
    }

    pub fn with_publish(mut self, f: impl Fn(RequestId) + Send + Sync + 'static) -> Self {
        self.publish = Some(Box::new(f));
        self
    }

    pub fn with_message(
        mut self,
        f: impl Fn(RequestId, &str, &[u8]) + Send + Sync + 'static,
    ) -> Self {
        self.message = Some(Box::new(f));
        self
    }

    pub fn with_log(mut self, f: impl Fn(LogLevel, &str) + Send + Sync + 'static) -> Self {
        self.log = Some(Box::new(f));
        self
    }

    pub(crate) fn on_connect(&self, error: Option<EngineError>) {
        if let Some(f) = &self.connect {
            f(error);
        }
    }

    pub(crate) fn on_disconnect(&self, error: Option<EngineError>) {
        if let Some(f) = &self.disconnect {
            f(error);
        }
    }

    pub(crate) fn on_subscribe(&self, id: RequestId, granted: &[Option<QoS>]) {
        if let Some(f) = &self.subscribe {
            f(id, granted);
        }
    }

    pub(crate) fn on_unsubscribe(&self, id: RequestId) {
        if let Some(f) = &self.unsubscribe {
            f(id);
        }
    }

    pub(crate) fn on_publish(&self, id: RequestId) {
        if let Some(f) = &self.publish {
            f(id);
        }
    }

    pub(crate) fn on_message(&self, id: RequestId, topic: &str, payload: &[u8]) {
        if let Some(f) = &self.message {
            f(id, topic, payload);
        }
    }

    pub(crate) fn on_log(&self, level: LogLevel, text: &str) {
        if let Some(f) = &self.log {
            f(level, text);
        }
    }
}

#[derive(Default)]
pub struct CallbackRegistry {
    sets: RwLock<HashMap<Handle, Arc<CallbackSet>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `set` for `handle`, replacing any previous set
    pub fn register(&self, handle: Handle, set: CallbackSet) {
        let mut sets = self.sets.write().unwrap_or_else(PoisonError::into_inner);
        sets.insert(handle, Arc::new(set));
    }

    pub fn lookup(&self, handle: Handle) -> Option<Arc<CallbackSet>> {
        let sets = self.sets.read().unwrap_or_else(PoisonError::into_inner);
        sets.get(&handle).cloned()
    }

    /// Returns true when a set was registered for `handle`
    pub fn remove(&self, handle: Handle) -> bool {
        let mut sets = self.sets.write().unwrap_or_else(PoisonError::into_inner);
        sets.remove(&handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.sets.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` against the set registered for `handle`; unknown handles are a no-op
    pub fn dispatch(&self, handle: Handle, f: impl FnOnce(&CallbackSet)) {
        let sets = self.sets.read().unwrap_or_else(PoisonError::into_inner);
        match sets.get(&handle) {
            Some(set) => f(set.as_ref()),
            None => trace!("Dropping callback for unregistered handle {}", handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn counting_set(counter: Arc<AtomicUsize>) -> CallbackSet {
        CallbackSet::new().with_publish(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn dispatch_reaches_registered_set() {
        let registry = CallbackRegistry::new();
        let handle = Handle::next();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register(handle, counting_set(counter.clone()));

        registry.dispatch(handle, |set| set.on_publish(RequestId(1)));
        registry.dispatch(handle, |set| set.on_publish(RequestId(2)));

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(registry.lookup(handle).is_some());
    }

    #[test]
    fn dispatch_to_unregistered_handle_is_silent() {
        let registry = CallbackRegistry::new();
        let handle = Handle::next();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register(handle, counting_set(counter.clone()));
        assert!(registry.remove(handle));
        assert!(!registry.remove(handle));

        registry.dispatch(handle, |set| set.on_publish(RequestId(1)));
        registry.dispatch(Handle::next(), |set| set.on_publish(RequestId(1)));

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn register_replaces_previous_set() {
        let registry = CallbackRegistry::new();
        let handle = Handle::next();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        registry.register(handle, counting_set(first.clone()));
        registry.register(handle, counting_set(second.clone()));
        registry.dispatch(handle, |set| set.on_publish(RequestId(7)));

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_dispatch_and_teardown() {
        let registry = Arc::new(CallbackRegistry::new());
        let handles: Vec<Handle> = (0..8).map(|_| Handle::next()).collect();
        let counter = Arc::new(AtomicUsize::new(0));
        for handle in &handles {
            registry.register(*handle, counting_set(counter.clone()));
        }

        thread::scope(|scope| {
            for handle in &handles {
                let registry = registry.clone();
                let handle = *handle;
                scope.spawn(move || {
                    for i in 0..200 {
                        registry.dispatch(handle, |set| set.on_publish(RequestId(i)));
                    }
                });
            }
            for handle in &handles {
                let registry = registry.clone();
                let handle = *handle;
                scope.spawn(move || {
                    registry.remove(handle);
                });
            }
        });

        assert!(registry.is_empty());
        assert!(counter.load(Ordering::SeqCst) <= 8 * 200);
    }
}
