//! Per-transaction view of a phased store
//!
//! A writable handle owns the store's working phase between `refresh` and
//! `release`. A read-only handle pins the committed phase current at
//! `refresh` and keeps reading it no matter what commits afterwards.

use crate::store::{CommittedPhase, PhaseState, PhasedStore};
use parking_lot::RwLock;
use quarry_core::{Phase, PhaseResource, QuarryError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A transaction's participation in one [`PhasedStore`]
pub struct PhaseHandle<S: PhaseState> {
    store: Arc<PhasedStore<S>>,
    writable: bool,
    owns_working: AtomicBool,
    pinned: RwLock<Option<Arc<CommittedPhase<S>>>>,
}

impl<S: PhaseState> PhaseHandle<S> {
    /// Create a handle; nothing is obtained until `refresh`
    pub fn new(store: Arc<PhasedStore<S>>, writable: bool) -> Self {
        PhaseHandle {
            store,
            writable,
            owns_working: AtomicBool::new(false),
            pinned: RwLock::new(None),
        }
    }

    /// True if this handle builds the working phase
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<PhasedStore<S>> {
        &self.store
    }

    /// Phase this handle currently reads
    pub fn phase(&self) -> Option<Phase> {
        if self.writable {
            if self.owns_working.load(Ordering::Acquire) {
                self.store.working_phase()
            } else {
                None
            }
        } else {
            self.pinned.read().as_ref().map(|p| p.phase())
        }
    }

    /// Read the phase visible to this transaction
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> Result<R> {
        if self.writable {
            self.check_owned()?;
            return self.store.read_working(f);
        }
        match self.pinned.read().as_ref() {
            Some(pinned) => Ok(f(pinned.state())),
            None => Err(QuarryError::resource(
                self.store.name(),
                "read before a phase was obtained",
            )),
        }
    }

    /// Mutate the working phase
    pub fn write<R>(&self, f: impl FnOnce(&mut S) -> R) -> Result<R> {
        if !self.writable {
            return Err(QuarryError::protocol(format!(
                "attempt to modify {} through a read-only phase",
                self.store.name()
            )));
        }
        self.check_owned()?;
        self.store.write_working(f)
    }

    fn check_owned(&self) -> Result<()> {
        if self.owns_working.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(QuarryError::resource(
                self.store.name(),
                "working phase not obtained by this transaction",
            ))
        }
    }
}

impl<S: PhaseState> PhaseResource for PhaseHandle<S> {
    fn name(&self) -> &str {
        self.store.name()
    }

    fn refresh(&self) -> Result<()> {
        if self.writable {
            self.store.obtain()?;
            self.owns_working.store(true, Ordering::Release);
        } else {
            *self.pinned.write() = Some(self.store.committed());
        }
        Ok(())
    }

    fn prepare(&self) -> Result<()> {
        if self.writable {
            self.check_owned()?;
            self.store.prepare()?;
        }
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        if self.writable {
            self.check_owned()?;
            self.store.commit()?;
        }
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        if self.writable && self.owns_working.load(Ordering::Acquire) {
            self.store.rollback()?;
        }
        Ok(())
    }

    fn release(&self) -> Result<()> {
        if self.writable {
            if self.owns_working.load(Ordering::Acquire) {
                self.store.release()?;
                self.owns_working.store(false, Ordering::Release);
            }
        } else {
            *self.pinned.write() = None;
        }
        Ok(())
    }
}
