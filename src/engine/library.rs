//! Reference-counted process-wide engine state
//!
//! The first [`Library::init`] sets up the shared [`CallbackRegistry`]; dropping the
//! last guard tears it down again. Any number of sessions can hold a guard at once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use super::{CallbackRegistry, EngineError};

struct Shared {
    references: usize,
    registry: Option<Arc<CallbackRegistry>>,
}

/// Counted owner of one registry, created on the first acquire and dropped on the last release
struct Refcount(Mutex<Shared>);

impl Refcount {
    const fn new() -> Self {
        Self(Mutex::new(Shared {
            references: 0,
            registry: None,
        }))
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self) -> Result<Arc<CallbackRegistry>, EngineError> {
        let mut shared = self.shared();
        if shared.references == 0 {
            info!("Initialising engine library");
            shared.registry = Some(Arc::new(CallbackRegistry::new()));
        }
        let registry = shared
            .registry
            .clone()
            .ok_or_else(|| EngineError::Library("callback registry missing".into()))?;
        shared.references += 1;
        debug!("Engine library references: {}", shared.references);
        Ok(registry)
    }

    fn retain(&self) {
        self.shared().references += 1;
    }

    fn release(&self) {
        let mut shared = self.shared();
        shared.references = shared.references.saturating_sub(1);
        if shared.references > 0 {
            return;
        }
        if let Some(registry) = shared.registry.take() {
            if !registry.is_empty() {
                warn!(
                    "Engine library cleanup with {} registered handles",
                    registry.len()
                );
            }
        }
        info!("Engine library cleaned up");
    }

    fn references(&self) -> usize {
        self.shared().references
    }
}

static STATE: Refcount = Refcount::new();

/// Guard for the process-wide engine state; cleanup runs when the last guard drops
pub struct Library {
    owner: &'static Refcount,
    registry: Arc<CallbackRegistry>,
}

impl Library {
    pub fn init() -> Result<Self, EngineError> {
        Self::init_in(&STATE)
    }

    fn init_in(owner: &'static Refcount) -> Result<Self, EngineError> {
        let registry = owner.acquire()?;
        Ok(Self { owner, registry })
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    /// Number of live guards
    pub fn references() -> usize {
        STATE.references()
    }
}

impl Clone for Library {
    fn clone(&self) -> Self {
        self.owner.retain();
        Self {
            owner: self.owner,
            registry: self.registry.clone(),
        }
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        self.owner.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_share_one_registry() {
        let first = Library::init().unwrap();
        let second = Library::init().unwrap();
        let third = second.clone();

        assert!(Arc::ptr_eq(first.registry(), second.registry()));
        assert!(Arc::ptr_eq(second.registry(), third.registry()));
        assert!(Library::references() >= 3);

        drop(third);
        drop(second);
        assert!(Library::references() >= 1);
        drop(first);
    }

    #[test]
    fn last_guard_tears_the_registry_down() {
        static LOCAL: Refcount = Refcount::new();

        let first = Library::init_in(&LOCAL).unwrap();
        let second = first.clone();
        let original = first.registry().clone();
        assert_eq!(LOCAL.references(), 2);

        drop(first);
        assert_eq!(LOCAL.references(), 1);
        assert!(Arc::ptr_eq(second.registry(), &original));
        assert!(LOCAL.shared().registry.is_some());

        drop(second);
        assert_eq!(LOCAL.references(), 0);
        assert!(LOCAL.shared().registry.is_none());

        let fresh = Library::init_in(&LOCAL).unwrap();
        assert_eq!(LOCAL.references(), 1);
        assert!(!Arc::ptr_eq(fresh.registry(), &original));
        drop(fresh);
        assert_eq!(LOCAL.references(), 0);
    }
}
