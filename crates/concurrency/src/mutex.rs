//! Reentrant per-session mutex
//!
//! Every transactional step of a session runs while holding this mutex. It
//! is reentrant for the holding thread and tracks a hold count. A watchdog
//! that needs the mutex while another thread holds it can request an
//! interrupt aimed at one transaction, or at the whole session. The holder
//! observes it (`take_interrupt`) only while working on that transaction and
//! fails its pending commit instead of completing it.

use parking_lot::{Condvar, Mutex};
use quarry_core::{QuarryError, Result, TxnId};
use std::collections::HashSet;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{error, trace};

#[derive(Debug, Default)]
struct MutexState {
    holder: Option<ThreadId>,
    depth: usize,
    // Pending interrupts, cleared when the mutex is fully released
    interrupted: HashSet<TxnId>,
    session_interrupted: bool,
}

impl MutexState {
    fn clear_interrupts(&mut self) {
        self.interrupted.clear();
        self.session_interrupted = false;
    }
}

/// Reentrant mutex guarding one session's transactions
#[derive(Debug, Default)]
pub struct SessionMutex {
    state: Mutex<MutexState>,
    available: Condvar,
}

impl SessionMutex {
    /// Create an unheld mutex
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire, waiting as long as necessary
    pub fn lock(&self) -> SessionMutexGuard<'_> {
        self.lock_then(|| {})
    }

    /// Acquire and run `on_acquire` atomically with the acquisition
    pub fn lock_then(&self, on_acquire: impl FnOnce()) -> SessionMutexGuard<'_> {
        let current = thread::current().id();
        let mut state = self.state.lock();
        while !Self::available_to(&state, current) {
            self.available.wait(&mut state);
        }
        Self::take(&mut state, current);
        on_acquire();
        SessionMutexGuard::new(self)
    }

    /// Acquire, failing with `Timeout` after `timeout`
    pub fn try_lock_for(&self, timeout: Duration) -> Result<SessionMutexGuard<'_>> {
        let current = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !Self::available_to(&state, current) {
            if self.available.wait_until(&mut state, deadline).timed_out()
                && !Self::available_to(&state, current)
            {
                return Err(QuarryError::Timeout(format!(
                    "session mutex not acquired within {:?}",
                    timeout
                )));
            }
        }
        Self::take(&mut state, current);
        Ok(SessionMutexGuard::new(self))
    }

    /// Acquire on behalf of a watchdog completing a transaction
    ///
    /// If another thread holds the mutex and `holder_completing` reports
    /// that it is already completing the transaction, returns `None`
    /// without waiting. Otherwise an interrupt for `target` is posted to
    /// the current holder (if any) and the call waits for the mutex. A
    /// `target` of `None` interrupts whatever transaction the holder runs.
    pub fn lock_for_completion(
        &self,
        target: Option<TxnId>,
        holder_completing: impl FnOnce() -> bool,
    ) -> Option<SessionMutexGuard<'_>> {
        let current = thread::current().id();
        let mut state = self.state.lock();
        if let Some(holder) = state.holder {
            if holder != current {
                if holder_completing() {
                    trace!(target: "quarry::txn", "Holder already completing, skipping");
                    return None;
                }
                match target {
                    Some(txn) => {
                        state.interrupted.insert(txn);
                    }
                    None => state.session_interrupted = true,
                }
            }
        }
        while !Self::available_to(&state, current) {
            self.available.wait(&mut state);
        }
        Self::take(&mut state, current);
        Some(SessionMutexGuard::new(self))
    }

    /// Run `f` under the mutex's internal state lock
    ///
    /// Used to update flags that `lock_for_completion` inspects.
    pub fn synchronized<R>(&self, f: impl FnOnce() -> R) -> R {
        let _state = self.state.lock();
        f()
    }

    /// Thread currently holding the mutex
    pub fn holder(&self) -> Option<ThreadId> {
        self.state.lock().holder
    }

    /// True if the calling thread holds the mutex
    pub fn is_held_by_current_thread(&self) -> bool {
        self.holder() == Some(thread::current().id())
    }

    /// Consume an interrupt aimed at `txn`
    ///
    /// Only the holding thread can observe interrupts. Interrupts posted
    /// for other transactions of the session stay pending.
    pub fn take_interrupt(&self, txn: TxnId) -> bool {
        let mut state = self.state.lock();
        if state.holder != Some(thread::current().id()) {
            return false;
        }
        let targeted = state.interrupted.remove(&txn);
        std::mem::take(&mut state.session_interrupted) || targeted
    }

    /// True if any interrupt is pending for the current holder
    pub fn is_interrupted(&self) -> bool {
        let state = self.state.lock();
        state.session_interrupted || !state.interrupted.is_empty()
    }

    fn available_to(state: &MutexState, current: ThreadId) -> bool {
        match state.holder {
            None => true,
            Some(holder) => holder == current,
        }
    }

    fn take(state: &mut MutexState, current: ThreadId) {
        state.holder = Some(current);
        state.depth += 1;
    }

    fn release(&self) {
        let current = thread::current().id();
        let mut state = self.state.lock();
        if state.holder != Some(current) {
            error!(target: "quarry::txn", "Session mutex released by a thread that does not hold it");
            return;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.holder = None;
            state.clear_interrupts();
            drop(state);
            self.available.notify_all();
        }
    }
}

/// Hold on a [`SessionMutex`]; released on drop
#[must_use]
pub struct SessionMutexGuard<'a> {
    mutex: &'a SessionMutex,
    // Releasing must happen on the acquiring thread
    _not_send: PhantomData<*const ()>,
}

impl<'a> SessionMutexGuard<'a> {
    fn new(mutex: &'a SessionMutex) -> Self {
        SessionMutexGuard {
            mutex,
            _not_send: PhantomData,
        }
    }
}

impl Drop for SessionMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}
