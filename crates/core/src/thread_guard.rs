//! Single-thread affinity guard
//!
//! Used by objects that must never be driven by two threads at once. A
//! second thread entering while the first is inside is a hard error; the
//! same thread may re-enter.

use crate::error::{QuarryError, Result};
use parking_lot::Mutex;
use std::thread::{self, ThreadId};

/// Rejects concurrent use from a second thread
#[derive(Debug)]
pub struct ThreadGuard {
    label: &'static str,
    owner: Mutex<Option<ThreadId>>,
}

impl ThreadGuard {
    /// Create a guard; `label` names the guarded object in errors
    pub fn new(label: &'static str) -> Self {
        ThreadGuard {
            label,
            owner: Mutex::new(None),
        }
    }

    /// Bind the calling thread until the returned token drops
    pub fn enter(&self) -> Result<ThreadGuardToken<'_>> {
        let current = thread::current().id();
        let mut owner = self.owner.lock();
        match *owner {
            Some(other) if other != current => Err(QuarryError::protocol(format!(
                "Concurrent access of {} attempted",
                self.label
            ))),
            Some(_) => Ok(ThreadGuardToken {
                guard: self,
                outermost: false,
            }),
            None => {
                *owner = Some(current);
                Ok(ThreadGuardToken {
                    guard: self,
                    outermost: true,
                })
            }
        }
    }

    /// Thread currently inside the guard
    pub fn owner(&self) -> Option<ThreadId> {
        *self.owner.lock()
    }
}

/// Proof of entry; releases the guard when the outermost token drops
#[must_use]
pub struct ThreadGuardToken<'a> {
    guard: &'a ThreadGuard,
    outermost: bool,
}

impl Drop for ThreadGuardToken<'_> {
    fn drop(&mut self) {
        if self.outermost {
            *self.guard.owner.lock() = None;
        }
    }
}
