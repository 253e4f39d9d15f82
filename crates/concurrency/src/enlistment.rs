//! Per-transaction record of enlisted participants
//!
//! Enlistment is idempotent: a participant is identified by its
//! [`ResourceId`] and recorded once, in enlistment order.

use quarry_core::{Enlistable, ResourceId, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::error;

/// Ordered, deduplicated set of enlisted participants
#[derive(Default)]
pub struct EnlistmentRegistry {
    ids: HashSet<ResourceId>,
    entries: Vec<Arc<dyn Enlistable>>,
}

impl EnlistmentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `id` is already enlisted
    pub fn contains(&self, id: ResourceId) -> bool {
        self.ids.contains(&id)
    }

    /// Record `enlistable`; returns false if it was already present
    pub fn insert(&mut self, enlistable: Arc<dyn Enlistable>) -> bool {
        if !self.ids.insert(enlistable.resource_id()) {
            return false;
        }
        self.entries.push(enlistable);
        true
    }

    /// Remove and return every participant in enlistment order
    pub fn drain(&mut self) -> Vec<Arc<dyn Enlistable>> {
        self.ids.clear();
        std::mem::take(&mut self.entries)
    }

    /// Forget every participant
    pub fn clear(&mut self) {
        self.ids.clear();
        self.entries.clear();
    }

    /// Number of participants
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is enlisted
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Abort every participant in `entries`, logging individual failures
    ///
    /// Returns the first failure after attempting all of them.
    pub fn abort_all(entries: Vec<Arc<dyn Enlistable>>) -> Result<()> {
        let mut first = None;
        for entry in entries {
            if let Err(e) = entry.abort() {
                error!(target: "quarry::txn", resource = %entry.resource_id(), error = %e, "Failed to abort enlisted resource");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::{QuarryError, ResourceManager};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Participant {
        id: ResourceId,
        aborts: AtomicUsize,
        fail: bool,
    }

    impl Participant {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Participant {
                id: ResourceId::next(),
                aborts: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl Enlistable for Participant {
        fn resource_id(&self) -> ResourceId {
            self.id
        }
        fn resource_manager(&self) -> Arc<dyn ResourceManager> {
            unimplemented!("not enlisted with a coordinator in these tests")
        }
        fn abort(&self) -> Result<()> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(QuarryError::resource("participant", "abort failed"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut registry = EnlistmentRegistry::new();
        let p = Participant::new(false);
        assert!(registry.insert(p.clone()));
        assert!(!registry.insert(p.clone()));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(p.id));
        registry.clear();
        assert!(registry.is_empty());
        assert!(!registry.contains(p.id));
    }

    #[test]
    fn test_abort_all_attempts_every_participant() {
        let mut registry = EnlistmentRegistry::new();
        let a = Participant::new(true);
        let b = Participant::new(false);
        registry.insert(a.clone());
        registry.insert(b.clone());

        let result = EnlistmentRegistry::abort_all(registry.drain());
        assert!(result.is_err());
        assert_eq!(a.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(b.aborts.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }
}
