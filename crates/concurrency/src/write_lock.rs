//! Database-wide write lock
//!
//! At most one session holds the write lock at a time; that session's
//! write transaction is the only one allowed to build a working phase.
//! A session may additionally reserve the lock so that it is the only
//! session able to obtain it next. Reservation is how an explicit
//! `commit()` hands the lock from the finished transaction to the next one
//! without another writer slipping in between.

use parking_lot::{Condvar, Mutex, MutexGuard};
use quarry_core::{QuarryError, Result, SessionId};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest a waiter sleeps between interrupt checks
pub const INTERRUPT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct WriteLockState {
    holder: Option<SessionId>,
    reserved: Option<SessionId>,
}

/// Single-writer lock shared by every session of a database
#[derive(Debug, Default)]
pub struct WriteLockManager {
    state: Mutex<WriteLockState>,
    released: Condvar,
}

impl WriteLockManager {
    /// Create an unheld lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `session` holds the write lock
    ///
    /// With a deadline, gives up with `Timeout` once it passes; the
    /// current holder is not affected.
    pub fn obtain_write_lock(&self, session: SessionId, deadline: Option<Instant>) -> Result<()> {
        self.obtain_write_lock_interruptibly(session, deadline, || false)
    }

    /// Like [`obtain_write_lock`](Self::obtain_write_lock), but gives up
    /// with `Interrupted` as soon as `interrupted` reports true
    ///
    /// The waiter usually holds its session mutex, so a watchdog that needs
    /// that mutex raises an interrupt to get the waiter out of the way.
    /// `interrupted` is checked at least every [`INTERRUPT_POLL`].
    pub fn obtain_write_lock_interruptibly(
        &self,
        session: SessionId,
        deadline: Option<Instant>,
        interrupted: impl Fn() -> bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.holder == Some(session) {
            return Err(QuarryError::protocol(format!(
                "{} attempted to obtain the write lock while already holding it",
                session
            )));
        }
        while Self::blocked(&state, session) {
            if MutexGuard::unlocked(&mut state, &interrupted) {
                warn!(target: "quarry::txn", session = %session, "Interrupted waiting for write lock");
                return Err(QuarryError::Interrupted(format!(
                    "{} interrupted waiting for the write lock",
                    session
                )));
            }
            if !Self::blocked(&state, session) {
                break;
            }
            let slice = Instant::now() + INTERRUPT_POLL;
            let wake = deadline.map_or(slice, |d| d.min(slice));
            self.released.wait_until(&mut state, wake);
            if deadline.map_or(false, |d| Instant::now() >= d) && Self::blocked(&state, session) {
                warn!(target: "quarry::txn", session = %session, holder = ?state.holder, "Timed out waiting for write lock");
                return Err(QuarryError::Timeout(format!(
                    "{} timed out waiting for the write lock",
                    session
                )));
            }
        }
        state.holder = Some(session);
        debug!(target: "quarry::txn", session = %session, "Obtained write lock");
        Ok(())
    }

    fn blocked(state: &WriteLockState, session: SessionId) -> bool {
        state.holder.is_some() || state.reserved.map_or(false, |r| r != session)
    }

    /// True if `session` holds the write lock
    pub fn is_holding_write_lock(&self, session: SessionId) -> bool {
        self.state.lock().holder == Some(session)
    }

    /// Session holding the write lock
    pub fn holder(&self) -> Option<SessionId> {
        self.state.lock().holder
    }

    /// Release the write lock held by `session`
    pub fn release_write_lock(&self, session: SessionId) -> Result<()> {
        let mut state = self.state.lock();
        if state.holder != Some(session) {
            return Err(QuarryError::protocol(format!(
                "{} attempted to release a write lock it does not hold",
                session
            )));
        }
        state.holder = None;
        drop(state);
        self.released.notify_all();
        debug!(target: "quarry::txn", session = %session, "Released write lock");
        Ok(())
    }

    /// Reserve the write lock for `session`
    ///
    /// Waits for any other session's reservation to be released first.
    pub fn reserve_write_lock(&self, session: SessionId) -> Result<()> {
        let mut state = self.state.lock();
        while let Some(other) = state.reserved {
            if other == session {
                return Err(QuarryError::protocol(format!(
                    "{} attempted to reserve the write lock twice",
                    session
                )));
            }
            self.released.wait(&mut state);
        }
        state.reserved = Some(session);
        Ok(())
    }

    /// Drop the reservation held by `session`
    pub fn release_reserve(&self, session: SessionId) -> Result<()> {
        let mut state = self.state.lock();
        if state.reserved != Some(session) {
            return Err(QuarryError::protocol(format!(
                "{} attempted to release a reservation it does not hold",
                session
            )));
        }
        state.reserved = None;
        drop(state);
        self.released.notify_all();
        Ok(())
    }

    /// True if `session` holds the reservation
    pub fn is_reserving(&self, session: SessionId) -> bool {
        self.state.lock().reserved == Some(session)
    }

    /// Release everything `session` holds
    pub fn closing_session(&self, session: SessionId) {
        let mut state = self.state.lock();
        let mut changed = false;
        if state.holder == Some(session) {
            warn!(target: "quarry::txn", session = %session, "Releasing write lock held by closing session");
            state.holder = None;
            changed = true;
        }
        if state.reserved == Some(session) {
            state.reserved = None;
            changed = true;
        }
        drop(state);
        if changed {
            self.released.notify_all();
        }
    }
}
