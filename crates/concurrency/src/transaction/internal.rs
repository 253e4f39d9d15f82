//! Session-driven transaction state machine
//!
//! ## Counters
//!
//! - `inuse`: nested activations on the current thread
//! - `using`: references keeping the transaction alive across suspension
//!
//! ## Termination
//!
//! Commit, explicit rollback and implicit rollback all end in the same
//! cleanup: drop the coordinator transaction, clear the operation context,
//! clear the enlistment set and tell the factory. If the coordinator
//! cannot roll back, `abort_transaction` aborts every enlisted resource
//! directly.
//!
//! ## Locking
//!
//! Every operation runs under the owning session's [`SessionMutex`]. The
//! transaction's own state lock is only held for bookkeeping and is never
//! held while calling out to the factory, the operation context or the
//! coordinator.

use super::{Activity, Transaction, TxnState};
use crate::cleanup::CleanupChain;
use crate::context::{Enlister, OperationContext};
use crate::coordinator::CoordinatorTransaction;
use crate::enlistment::EnlistmentRegistry;
use crate::mutex::{SessionMutex, SessionMutexGuard};
use parking_lot::Mutex;
use quarry_core::{Enlistable, QuarryError, Result, TxnId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Callbacks from a transaction into the factory that owns it
pub trait FactoryHooks: Send + Sync {
    /// The owning session's mutex
    fn mutex(&self) -> &SessionMutex;

    /// Begin the coordinator transaction for `txn` on the calling thread
    fn transaction_start(&self, txn: &InternalTransaction)
        -> Result<Arc<dyn CoordinatorTransaction>>;

    /// `txn` is being reassociated with the calling thread
    fn transaction_resumed(&self, txn: &InternalTransaction) -> Result<()>;

    /// `txn` is being dissociated from the calling thread
    fn transaction_suspended(&self, txn: &InternalTransaction) -> Result<()>;

    /// `txn` committed or was explicitly rolled back
    fn transaction_complete(&self, txn: &InternalTransaction) -> Result<()>;

    /// `txn` failed; must not fail itself
    fn transaction_aborted(&self, txn: &InternalTransaction, cause: &Arc<QuarryError>);
}

struct TxnInner {
    state: TxnState,
    inuse: i32,
    using: i32,
    current_thread: Option<ThreadId>,
    coordinator: Option<Arc<dyn CoordinatorTransaction>>,
    enlisted: EnlistmentRegistry,
    rollback_cause: Option<Arc<QuarryError>>,
    activity: Activity,
}

/// A transaction driven by its own session
pub struct InternalTransaction {
    id: TxnId,
    write: bool,
    me: Weak<InternalTransaction>,
    hooks: Arc<dyn FactoryHooks>,
    context: Arc<dyn OperationContext>,
    inner: Mutex<TxnInner>,
    in_completion: AtomicBool,
}

impl InternalTransaction {
    /// Create an unreferenced, unactivated transaction
    pub fn new(
        hooks: Arc<dyn FactoryHooks>,
        context: Arc<dyn OperationContext>,
        write: bool,
    ) -> Arc<Self> {
        let id = TxnId::next();
        debug!(target: "quarry::txn", txn_id = %id, write, "Created transaction");
        Arc::new_cyclic(|me| InternalTransaction {
            id,
            write,
            me: me.clone(),
            hooks,
            context,
            inner: Mutex::new(TxnInner {
                state: TxnState::ConstructedUnref,
                inuse: 0,
                using: 0,
                current_thread: None,
                coordinator: None,
                enlisted: EnlistmentRegistry::new(),
                rollback_cause: None,
                activity: Activity::IdleSince(Instant::now()),
            }),
            in_completion: AtomicBool::new(false),
        })
    }

    /// Transaction identifier
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// True for write transactions
    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Current state
    pub fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    /// Activation count
    pub fn inuse(&self) -> i32 {
        self.inner.lock().inuse
    }

    /// Reference count
    pub fn using(&self) -> i32 {
        self.inner.lock().using
    }

    /// First failure recorded against this transaction
    pub fn rollback_cause(&self) -> Option<Arc<QuarryError>> {
        self.inner.lock().rollback_cause.clone()
    }

    /// Number of enlisted participants
    pub fn enlisted_count(&self) -> usize {
        self.inner.lock().enlisted.len()
    }

    /// Operation context bound to this transaction
    pub fn context(&self) -> &Arc<dyn OperationContext> {
        &self.context
    }

    fn acquire(&self, completing: bool) -> SessionMutexGuard<'_> {
        self.hooks.mutex().lock_then(|| {
            if completing {
                self.in_completion.store(true, Ordering::SeqCst);
            }
        })
    }

    /// Mark the transaction as completing so watchdogs leave it alone
    fn enter_completion(&self) {
        self.hooks
            .mutex()
            .synchronized(|| self.in_completion.store(true, Ordering::SeqCst));
    }

    fn check_thread(&self, inner: &TxnInner) -> Result<()> {
        match inner.current_thread {
            Some(owner) if owner != thread::current().id() => {
                error!(target: "quarry::txn", txn_id = %self.id, state = %inner.state, "Concurrent access attempted");
                Err(QuarryError::ConcurrentAccess { txn: self.id })
            }
            _ => Ok(()),
        }
    }

    fn check_associated(&self, inner: &TxnInner) -> Result<()> {
        if inner.current_thread.is_none() {
            return Err(QuarryError::protocol(format!(
                "{} is not associated with a thread",
                self.id
            )));
        }
        self.check_thread(inner)
    }

    fn coordinator(&self) -> Result<Arc<dyn CoordinatorTransaction>> {
        self.inner.lock().coordinator.clone().ok_or_else(|| {
            QuarryError::internal(format!("{} has no coordinator transaction", self.id))
        })
    }

    fn failed_error(&self, action: &str, inner: &TxnInner) -> QuarryError {
        QuarryError::transaction_failed(
            self.id,
            format!("attempt to {} failed transaction", action),
            inner.rollback_cause.clone(),
        )
    }

    // ========================================================================
    // Activation
    // ========================================================================

    fn activate(&self) -> Result<()> {
        let state = {
            let mut inner = self.inner.lock();
            self.check_thread(&inner)?;
            inner.activity = Activity::Active;
            match inner.state {
                TxnState::Finished => {
                    return Err(QuarryError::protocol(format!(
                        "attempt to activate terminated transaction {}",
                        self.id
                    )))
                }
                TxnState::Failed => return Err(self.failed_error("activate", &inner)),
                TxnState::ActRef | TxnState::ActUnref => {
                    inner.inuse += 1;
                    return Ok(());
                }
                state => state,
            }
        };

        match state {
            TxnState::DeactRef => {
                self.resume_transaction()?;
                let mut inner = self.inner.lock();
                inner.inuse = 1;
                inner.state = TxnState::ActRef;
            }
            _ => {
                self.start_transaction()?;
                {
                    let mut inner = self.inner.lock();
                    inner.inuse = 1;
                    if state == TxnState::ConstructedRef {
                        inner.using = 1;
                        inner.state = TxnState::ActRef;
                    } else {
                        inner.state = TxnState::ActUnref;
                    }
                }
                let Some(me) = self.me.upgrade() else {
                    return Err(self.abort_transaction(
                        "Transaction dropped during activation",
                        Arc::new(QuarryError::internal("transaction no longer referenced")),
                    ));
                };
                if let Err(e) = self.context.initiate(me) {
                    return Err(self.implicit_rollback(e));
                }
            }
        }
        trace!(target: "quarry::txn", txn_id = %self.id, state = %self.state(), "Activated");
        Ok(())
    }

    fn start_transaction(&self) -> Result<()> {
        match self.hooks.transaction_start(self) {
            Ok(coordinator) => {
                let mut inner = self.inner.lock();
                inner.coordinator = Some(coordinator);
                inner.current_thread = Some(thread::current().id());
                Ok(())
            }
            Err(e) => Err(self.abort_transaction("Failed to start transaction", Arc::new(e))),
        }
    }

    fn resume_transaction(&self) -> Result<()> {
        let resumed = self
            .hooks
            .transaction_resumed(self)
            .and_then(|()| self.coordinator())
            .and_then(|coordinator| coordinator.resume());
        match resumed {
            Ok(()) => {
                self.inner.lock().current_thread = Some(thread::current().id());
                Ok(())
            }
            Err(e) => Err(self.abort_transaction("Failed to resume transaction", Arc::new(e))),
        }
    }

    fn deactivate(&self) -> Result<()> {
        let (state, inuse) = {
            let mut inner = self.inner.lock();
            if !inner.state.is_terminal() {
                self.check_associated(&inner)?;
            } else {
                self.check_thread(&inner)?;
            }
            inner.activity = Activity::IdleSince(Instant::now());
            if inner.state.is_terminal() {
                // Late releases from operations that raced with termination
                if inner.inuse <= 0 {
                    error!(
                        target: "quarry::txn",
                        txn_id = %self.id,
                        state = %inner.state,
                        inuse = inner.inuse,
                        "Activation count failure, too many deactivations of terminated transaction"
                    );
                } else {
                    inner.inuse -= 1;
                }
                return Ok(());
            }
            (inner.state, inner.inuse)
        };

        let result = match state {
            TxnState::ActUnref if inuse == 1 => self.commit(),
            TxnState::ActRef if inuse == 1 => self.suspend_transaction(),
            TxnState::ActUnref | TxnState::ActRef => Ok(()),
            other => {
                return Err(QuarryError::protocol(format!(
                    "attempt to deactivate {} transaction {}",
                    other, self.id
                )))
            }
        };
        let mut inner = self.inner.lock();
        inner.inuse = (inner.inuse - 1).max(0);
        trace!(target: "quarry::txn", txn_id = %self.id, state = %inner.state, inuse = inner.inuse, "Deactivated");
        result
    }

    fn suspend_transaction(&self) -> Result<()> {
        if self.inner.lock().using < 1 {
            return Err(self.implicit_rollback(QuarryError::protocol(format!(
                "attempt to suspend unreferenced transaction {}",
                self.id
            ))));
        }
        if let Err(e) = self.hooks.transaction_suspended(self) {
            if let Ok(coordinator) = self.coordinator() {
                coordinator.set_rollback_only();
            }
            return Err(self.implicit_rollback(e));
        }
        if let Err(e) = self.coordinator().and_then(|c| c.suspend()) {
            return Err(self.implicit_rollback(e));
        }
        let mut inner = self.inner.lock();
        inner.current_thread = None;
        inner.state = TxnState::DeactRef;
        Ok(())
    }

    // ========================================================================
    // References
    // ========================================================================

    /// Keep the transaction alive across suspension
    pub fn reference(&self) -> Result<()> {
        let _guard = self.acquire(false);
        let mut inner = self.inner.lock();
        self.check_thread(&inner)?;
        match inner.state {
            TxnState::ConstructedUnref => inner.state = TxnState::ConstructedRef,
            TxnState::ActRef | TxnState::ActUnref => {
                inner.using += 1;
                inner.state = TxnState::ActRef;
            }
            TxnState::DeactRef => inner.using += 1,
            TxnState::ConstructedRef => {
                return Err(QuarryError::protocol(format!(
                    "attempt to reference uninitiated transaction {} twice",
                    self.id
                )))
            }
            TxnState::Finished => {
                return Err(QuarryError::protocol(format!(
                    "attempt to reference terminated transaction {}",
                    self.id
                )))
            }
            TxnState::Failed => return Err(self.failed_error("reference", &inner)),
        }
        trace!(target: "quarry::txn", txn_id = %self.id, state = %inner.state, using = inner.using, "Referenced");
        Ok(())
    }

    /// Drop a reference
    pub fn dereference(&self) -> Result<()> {
        let _guard = self.acquire(false);
        let state = {
            let mut inner = self.inner.lock();
            self.check_thread(&inner)?;
            match inner.state {
                TxnState::ActRef => {
                    if inner.using == 1 {
                        inner.state = TxnState::ActUnref;
                    }
                    inner.using -= 1;
                    return Ok(());
                }
                TxnState::ConstructedRef => {
                    inner.state = TxnState::ConstructedUnref;
                    return Ok(());
                }
                TxnState::Finished | TxnState::Failed => {
                    if inner.using < 1 {
                        error!(
                            target: "quarry::txn",
                            txn_id = %self.id,
                            state = %inner.state,
                            "Reference count failure, too many dereferences of terminated transaction"
                        );
                    } else {
                        inner.using -= 1;
                    }
                    return Ok(());
                }
                state => state,
            }
        };
        match state {
            TxnState::DeactRef => Err(self.abort_transaction(
                "Attempt to dereference deactivated transaction",
                Arc::new(QuarryError::protocol(format!(
                    "{} dereferenced while suspended",
                    self.id
                ))),
            )),
            other => Err(QuarryError::protocol(format!(
                "attempt to dereference {} transaction {}",
                other, self.id
            ))),
        }
    }

    // ========================================================================
    // Work
    // ========================================================================

    /// Run `op` with the transaction activated on the calling thread
    ///
    /// A failing `op` rolls the transaction back; the returned error is the
    /// rollback's, with the operation's error attached as its cause.
    pub fn execute_with<R>(&self, op: impl FnOnce() -> Result<R>) -> Result<R> {
        let _guard = self.acquire(false);
        self.activate()?;
        let outcome = match op() {
            Ok(_) if self.hooks.mutex().take_interrupt(self.id) => {
                Err(self.implicit_rollback(QuarryError::Interrupted(format!(
                    "{} interrupted during operation",
                    self.id
                ))))
            }
            Ok(value) => Ok(value),
            Err(e) => Err(self.implicit_rollback(e)),
        };
        let deactivated = self.deactivate();
        match (outcome, deactivated) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(secondary)) => {
                error!(target: "quarry::txn", txn_id = %self.id, error = %secondary, "Deactivation failed after operation failure");
                Err(e)
            }
        }
    }

    /// Join `enlistable` to this transaction
    ///
    /// Only legal while active; enlisting a participant twice is a no-op.
    pub fn enlist(&self, enlistable: Arc<dyn Enlistable>) -> Result<()> {
        let _guard = self.acquire(false);
        let state = {
            let inner = self.inner.lock();
            self.check_associated(&inner)?;
            if inner.enlisted.contains(enlistable.resource_id()) {
                return Ok(());
            }
            inner.state
        };
        if !state.is_active() {
            return Err(QuarryError::protocol(format!(
                "attempt to enlist resource in {} transaction {}",
                state, self.id
            )));
        }
        let joined = self
            .coordinator()
            .and_then(|c| c.enlist_resource(enlistable.resource_manager()));
        if let Err(e) = joined {
            return Err(self.implicit_rollback(e));
        }
        let resource = enlistable.resource_id();
        self.inner.lock().enlisted.insert(enlistable);
        trace!(target: "quarry::txn", txn_id = %self.id, resource = %resource, "Enlisted resource");
        Ok(())
    }

    // ========================================================================
    // Termination
    // ========================================================================

    /// Commit the coordinator transaction and finish
    ///
    /// If the commit fails the transaction is rolled back and the rollback
    /// error is returned.
    pub fn commit(&self) -> Result<()> {
        let _guard = self.acquire(false);
        let state = {
            let inner = self.inner.lock();
            self.check_associated(&inner)?;
            inner.state
        };
        if !state.is_active() {
            return Err(QuarryError::protocol(format!(
                "attempt to commit {} transaction {}",
                state, self.id
            )));
        }
        self.enter_completion();
        if self.hooks.mutex().take_interrupt(self.id) {
            return Err(self.implicit_rollback(QuarryError::Interrupted(format!(
                "{} interrupted before commit",
                self.id
            ))));
        }
        if let Err(e) = self.coordinator().and_then(|c| c.commit()) {
            return Err(self.implicit_rollback(e));
        }
        self.finish("commit").map_err(|e| {
            QuarryError::internal(format!(
                "error cleaning up {} after commit: {}",
                self.id, e
            ))
        })?;
        debug!(target: "quarry::txn", txn_id = %self.id, "Committed transaction");
        Ok(())
    }

    /// Roll back at the caller's request
    ///
    /// Rolling back a failed transaction is a no-op.
    pub fn explicit_rollback(&self) -> Result<()> {
        let _guard = self.acquire(false);
        let state = {
            let inner = self.inner.lock();
            if inner.state == TxnState::Failed {
                return Ok(());
            }
            self.check_associated(&inner)?;
            inner.state
        };
        match state {
            TxnState::ActUnref | TxnState::ActRef => {
                self.enter_completion();
                if let Err(e) = self.coordinator().and_then(|c| c.rollback()) {
                    return Err(self.abort_transaction("Failed to roll back transaction", Arc::new(e)));
                }
                self.finish("rollback")?;
                debug!(target: "quarry::txn", txn_id = %self.id, "Rolled back transaction");
                Ok(())
            }
            TxnState::DeactRef => Err(self.abort_transaction(
                "Attempt to roll back unactivated transaction",
                Arc::new(QuarryError::protocol(format!(
                    "{} rolled back while suspended",
                    self.id
                ))),
            )),
            other => Err(QuarryError::protocol(format!(
                "attempt to roll back {} transaction {}",
                other, self.id
            ))),
        }
    }

    fn finish(&self, label: &str) -> Result<()> {
        CleanupChain::new(format!("{} {}", self.id, label))
            .step("finish state", || {
                let mut inner = self.inner.lock();
                inner.coordinator = None;
                inner.state = TxnState::Finished;
                Ok(())
            })
            .step("clear context", || {
                self.context.clear();
                Ok(())
            })
            .step("clear enlistment", || {
                self.inner.lock().enlisted.clear();
                Ok(())
            })
            .step("notify factory", || self.hooks.transaction_complete(self))
            .run()
    }

    /// Roll back because an otherwise normal step failed
    ///
    /// Records `cause` as the rollback cause (first cause wins) and returns
    /// the error to surface. Escalates to `abort_transaction` if the
    /// coordinator cannot roll back.
    fn implicit_rollback(&self, cause: QuarryError) -> QuarryError {
        self.enter_completion();
        let cause = Arc::new(cause);
        let (state, previous) = {
            let inner = self.inner.lock();
            (inner.state, inner.rollback_cause.clone())
        };

        if let Some(original) = previous {
            error!(
                target: "quarry::txn",
                txn_id = %self.id,
                error = %cause,
                original = %original,
                "Cascading error, transaction already rolled back"
            );
            return QuarryError::rolled_back("transaction already in rollback", cause);
        }
        if !state.is_active() {
            error!(target: "quarry::txn", txn_id = %self.id, state = %state, error = %cause, "Cannot roll back inactive transaction");
            return self.abort_transaction("Failed to roll back normally", cause);
        }

        warn!(target: "quarry::txn", txn_id = %self.id, error = %cause, "Implicit rollback triggered");
        self.inner.lock().rollback_cause = Some(Arc::clone(&cause));
        if let Err(e) = self.coordinator().and_then(|c| c.rollback()) {
            error!(target: "quarry::txn", txn_id = %self.id, error = %e, cause = %cause, "Coordinator rollback failed");
            return self.abort_transaction("Failed to roll back normally", Arc::new(e));
        }

        let cleanup = CleanupChain::new(format!("{} implicit rollback", self.id))
            .step("drop coordinator", || {
                self.inner.lock().coordinator = None;
                Ok(())
            })
            .step("clear context", || {
                self.context.clear();
                Ok(())
            })
            .step("clear enlistment", || {
                self.inner.lock().enlisted.clear();
                Ok(())
            })
            .step("mark failed", || {
                self.inner.lock().state = TxnState::Failed;
                Ok(())
            })
            .step("notify factory", || {
                self.hooks.transaction_aborted(self, &cause);
                Ok(())
            })
            .run();
        if let Err(e) = cleanup {
            return self.abort_transaction("Failed to clean up after rollback", Arc::new(e));
        }
        QuarryError::rolled_back("transaction rollback triggered", cause)
    }

    fn abort(&self, message: &str, cause: Arc<QuarryError>) -> QuarryError {
        let _guard = self.acquire(true);
        error!(target: "quarry::txn", txn_id = %self.id, error = %cause, "{} - Aborting", message);
        let (coordinator, enlisted) = {
            let mut inner = self.inner.lock();
            if inner.rollback_cause.is_none() {
                inner.rollback_cause = Some(Arc::clone(&cause));
            }
            (inner.coordinator.take(), inner.enlisted.drain())
        };

        let cleaned = CleanupChain::new(format!("{} abort", self.id))
            .step("roll back coordinator", || match &coordinator {
                Some(c) => c.rollback(),
                None => Ok(()),
            })
            .step("notify factory", || {
                self.hooks.transaction_aborted(self, &cause);
                Ok(())
            })
            .step("abort enlisted", move || EnlistmentRegistry::abort_all(enlisted))
            .step("clear context", || {
                self.context.clear();
                Ok(())
            })
            .step("mark failed", || {
                self.inner.lock().state = TxnState::Failed;
                Ok(())
            })
            .run();
        if cleaned.is_err() {
            error!(target: "quarry::txn", txn_id = %self.id, "{} - Failed to abort cleanly", message);
        }
        QuarryError::Aborted {
            message: format!("{} - Aborting", message),
            cause: Some(cause),
        }
    }

    fn heuristic(&self, cause: &str) -> Result<bool> {
        let Some(_guard) = self
            .hooks
            .mutex()
            .lock_for_completion(Some(self.id), || self.in_completion.load(Ordering::SeqCst))
        else {
            debug!(target: "quarry::txn", txn_id = %self.id, "Transaction already completing, skipping heuristic rollback");
            return Ok(false);
        };
        self.in_completion.store(true, Ordering::SeqCst);

        let state = self.state();
        let reason = QuarryError::Interrupted(format!("heuristic rollback: {}", cause));
        match state {
            TxnState::DeactRef => {
                warn!(target: "quarry::txn", txn_id = %self.id, cause, "Heuristic rollback of suspended transaction");
                self.activate()?;
                self.implicit_rollback(reason);
                self.inner.lock().current_thread = None;
                Ok(true)
            }
            TxnState::ActUnref | TxnState::ActRef => {
                warn!(target: "quarry::txn", txn_id = %self.id, cause, "Heuristic rollback of active transaction");
                self.implicit_rollback(reason);
                Ok(true)
            }
            TxnState::ConstructedUnref | TxnState::ConstructedRef => {
                warn!(target: "quarry::txn", txn_id = %self.id, cause, "Heuristic rollback of unstarted transaction");
                self.abort(cause, Arc::new(reason));
                Ok(true)
            }
            TxnState::Finished | TxnState::Failed => Ok(false),
        }
    }
}

impl Transaction for InternalTransaction {
    fn id(&self) -> TxnId {
        self.id
    }

    fn heuristic_rollback(&self, cause: &str) -> Result<bool> {
        self.heuristic(cause)
    }

    fn abort_transaction(&self, message: &str, cause: Arc<QuarryError>) -> QuarryError {
        self.abort(message, cause)
    }

    fn reference(&self) -> Result<()> {
        InternalTransaction::reference(self)
    }

    fn dereference(&self) -> Result<()> {
        InternalTransaction::dereference(self)
    }

    fn execute(&self, op: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.execute_with(op)
    }

    fn last_active(&self) -> Activity {
        self.inner.lock().activity
    }

    fn is_terminated(&self) -> bool {
        self.state().is_terminal()
    }
}

impl Enlister for InternalTransaction {
    fn enlist(&self, enlistable: Arc<dyn Enlistable>) -> Result<()> {
        InternalTransaction::enlist(self, enlistable)
    }

    fn transaction_id(&self) -> TxnId {
        self.id
    }
}

impl Drop for InternalTransaction {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !matches!(
            inner.state,
            TxnState::ActUnref | TxnState::ActRef | TxnState::DeactRef
        ) {
            return;
        }
        error!(target: "quarry::txn", txn_id = %self.id, state = %inner.state, "Dropping incomplete transaction, aborting");
        if let Some(coordinator) = inner.coordinator.take() {
            if let Err(e) = coordinator.rollback() {
                error!(target: "quarry::txn", txn_id = %self.id, error = %e, "Rollback of dropped transaction failed");
            }
        }
        if let Err(e) = EnlistmentRegistry::abort_all(inner.enlisted.drain()) {
            error!(target: "quarry::txn", txn_id = %self.id, error = %e, "Abort of enlisted resources failed for dropped transaction");
        }
        inner.state = TxnState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{Coordinator, LocalCoordinator};
    use quarry_core::{
        EndFlag, ResourceId, ResourceManager, StartFlag, Vote, XaCode, XaError, Xid,
    };
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    // ========================================================================
    // Fixtures
    // ========================================================================

    #[derive(Default)]
    struct Hooks {
        mutex: SessionMutex,
        coordinator: LocalCoordinator,
        completed: AtomicUsize,
        aborted: AtomicUsize,
        refuse_suspend: AtomicBool,
    }

    impl FactoryHooks for Hooks {
        fn mutex(&self) -> &SessionMutex {
            &self.mutex
        }
        fn transaction_start(
            &self,
            _: &InternalTransaction,
        ) -> Result<Arc<dyn CoordinatorTransaction>> {
            self.coordinator.begin()
        }
        fn transaction_resumed(&self, _: &InternalTransaction) -> Result<()> {
            Ok(())
        }
        fn transaction_suspended(&self, _: &InternalTransaction) -> Result<()> {
            if self.refuse_suspend.load(Ordering::SeqCst) {
                Err(QuarryError::protocol("suspend refused"))
            } else {
                Ok(())
            }
        }
        fn transaction_complete(&self, _: &InternalTransaction) -> Result<()> {
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn transaction_aborted(&self, _: &InternalTransaction, _: &Arc<QuarryError>) {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Rm {
        id: Option<ResourceId>,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
        fail_commit: AtomicBool,
    }

    impl ResourceManager for Rm {
        fn rm_id(&self) -> ResourceId {
            self.id.unwrap_or(ResourceId(0))
        }
        fn start(&self, _: &Xid, _: StartFlag) -> std::result::Result<(), XaError> {
            Ok(())
        }
        fn end(&self, _: &Xid, _: EndFlag) -> std::result::Result<(), XaError> {
            Ok(())
        }
        fn prepare(&self, _: &Xid) -> std::result::Result<Vote, XaError> {
            Ok(Vote::Ok)
        }
        fn commit(&self, _: &Xid, _: bool) -> std::result::Result<(), XaError> {
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err(XaError::new(XaCode::RmErr, "disk full"));
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn rollback(&self, _: &Xid) -> std::result::Result<(), XaError> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn forget(&self, _: &Xid) -> std::result::Result<(), XaError> {
            Ok(())
        }
    }

    struct Participant {
        rm: Arc<Rm>,
        aborts: AtomicUsize,
        fail_abort: AtomicBool,
    }

    impl Participant {
        fn new() -> Arc<Self> {
            Arc::new(Participant {
                rm: Arc::new(Rm {
                    id: Some(ResourceId::next()),
                    ..Rm::default()
                }),
                aborts: AtomicUsize::new(0),
                fail_abort: AtomicBool::new(false),
            })
        }
    }

    impl Enlistable for Participant {
        fn resource_id(&self) -> ResourceId {
            self.rm.rm_id()
        }
        fn resource_manager(&self) -> Arc<dyn ResourceManager> {
            self.rm.clone()
        }
        fn abort(&self) -> Result<()> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            if self.fail_abort.load(Ordering::SeqCst) {
                return Err(QuarryError::resource("graphs", "abort refused"));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Context {
        participant: Mutex<Option<Arc<Participant>>>,
        initiated: AtomicUsize,
        cleared: AtomicUsize,
    }

    impl OperationContext for Context {
        fn initiate(&self, txn: Arc<dyn Enlister>) -> Result<()> {
            self.initiated.fetch_add(1, Ordering::SeqCst);
            match self.participant.lock().clone() {
                Some(p) => txn.enlist(p),
                None => Ok(()),
            }
        }
        fn clear(&self) {
            self.cleared.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fixture() -> (Arc<Hooks>, Arc<Context>, Arc<Participant>, Arc<InternalTransaction>) {
        let hooks = Arc::new(Hooks::default());
        let context = Arc::new(Context::default());
        let participant = Participant::new();
        *context.participant.lock() = Some(participant.clone());
        let txn = InternalTransaction::new(hooks.clone(), context.clone(), true);
        (hooks, context, participant, txn)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    #[test]
    fn test_unreferenced_execute_commits() {
        let (hooks, context, participant, txn) = fixture();
        txn.execute_with(|| Ok(())).unwrap();

        assert_eq!(txn.state(), TxnState::Finished);
        assert_eq!(txn.inuse(), 0);
        assert_eq!(participant.rm.commits.load(Ordering::SeqCst), 1);
        assert_eq!(context.initiated.load(Ordering::SeqCst), 1);
        assert_eq!(context.cleared.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.completed.load(Ordering::SeqCst), 1);
        assert_eq!(txn.enlisted_count(), 0);
    }

    #[test]
    fn test_referenced_execute_suspends() {
        let (hooks, _context, participant, txn) = fixture();
        txn.reference().unwrap();
        txn.execute_with(|| Ok(())).unwrap();
        assert_eq!(txn.state(), TxnState::DeactRef);
        assert_eq!(txn.using(), 1);
        assert_eq!(txn.inuse(), 0);

        // Resume, drop the reference and commit on the way out
        txn.execute_with(|| txn.dereference()).unwrap();
        assert_eq!(txn.state(), TxnState::Finished);
        assert_eq!(participant.rm.commits.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_execute_commits_once() {
        let (_hooks, _context, participant, txn) = fixture();
        txn.execute_with(|| {
            txn.execute_with(|| Ok(()))?;
            assert_eq!(txn.state(), TxnState::ActUnref);
            assert_eq!(txn.inuse(), 1);
            Ok(())
        })
        .unwrap();
        assert_eq!(txn.state(), TxnState::Finished);
        assert_eq!(participant.rm.commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_operation_failure_rolls_back() {
        let (hooks, _context, participant, txn) = fixture();
        let err = txn
            .execute_with(|| -> Result<()> { Err(QuarryError::resource("graphs", "boom")) })
            .unwrap_err();

        assert!(err.is_rollback());
        assert!(matches!(err.root_cause(), QuarryError::Resource { .. }));
        assert_eq!(txn.state(), TxnState::Failed);
        assert_eq!(participant.rm.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.aborted.load(Ordering::SeqCst), 1);

        // Every later operation carries the original cause
        let later = txn.execute_with(|| Ok(())).unwrap_err();
        assert!(matches!(later, QuarryError::TransactionFailed { .. }));
        assert!(matches!(later.root_cause(), QuarryError::Resource { .. }));
        // Explicit rollback acknowledges the failure
        txn.explicit_rollback().unwrap();
    }

    #[test]
    fn test_commit_failure_surfaces_rollback() {
        let (_hooks, _context, participant, txn) = fixture();
        participant.rm.fail_commit.store(true, Ordering::SeqCst);
        let err = txn.execute_with(|| Ok(())).unwrap_err();
        assert!(err.is_rollback());
        assert!(matches!(err.root_cause(), QuarryError::Xa(_)));
        assert_eq!(txn.state(), TxnState::Failed);
        assert_eq!(txn.inuse(), 0);
    }

    #[test]
    fn test_explicit_rollback_inside_execute() {
        let (hooks, context, participant, txn) = fixture();
        txn.execute_with(|| txn.explicit_rollback()).unwrap();
        assert_eq!(txn.state(), TxnState::Finished);
        assert_eq!(participant.rm.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(participant.rm.commits.load(Ordering::SeqCst), 0);
        assert_eq!(context.cleared.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_suspend_refused_rolls_back() {
        let (hooks, _context, _participant, txn) = fixture();
        hooks.refuse_suspend.store(true, Ordering::SeqCst);
        txn.reference().unwrap();
        let err = txn.execute_with(|| Ok(())).unwrap_err();
        assert!(err.is_rollback());
        assert_eq!(txn.state(), TxnState::Failed);
    }

    // ========================================================================
    // Illegal states
    // ========================================================================

    #[test]
    fn test_illegal_operations_leave_state_unchanged() {
        let (_hooks, _context, _participant, txn) = fixture();
        assert!(txn.dereference().unwrap_err().is_protocol());
        assert!(txn.commit().unwrap_err().is_protocol());
        assert!(txn.explicit_rollback().unwrap_err().is_protocol());
        assert!(txn.enlist(Participant::new()).unwrap_err().is_protocol());
        assert_eq!(txn.state(), TxnState::ConstructedUnref);

        txn.reference().unwrap();
        assert!(txn.reference().unwrap_err().is_protocol());
        assert_eq!(txn.state(), TxnState::ConstructedRef);
        assert_eq!((txn.inuse(), txn.using()), (0, 0));
    }

    #[test]
    fn test_finished_transaction_rejects_work() {
        let (_hooks, _context, _participant, txn) = fixture();
        txn.execute_with(|| Ok(())).unwrap();
        assert!(txn.execute_with(|| Ok(())).unwrap_err().is_protocol());
        assert!(txn.reference().unwrap_err().is_protocol());
        assert_eq!(txn.state(), TxnState::Finished);
    }

    #[test]
    fn test_over_deactivation_of_terminated_transaction_is_lenient() {
        let (_hooks, _context, _participant, txn) = fixture();
        txn.execute_with(|| Ok(())).unwrap();
        assert_eq!(txn.inuse(), 0);
        txn.deactivate().unwrap();
        txn.deactivate().unwrap();
        assert_eq!(txn.inuse(), 0);
        assert_eq!(txn.state(), TxnState::Finished);
    }

    #[test]
    fn test_cross_thread_access_is_rejected() {
        let (_hooks, _context, _participant, txn) = fixture();
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let owner = {
            let txn = Arc::clone(&txn);
            thread::spawn(move || {
                txn.reference().unwrap();
                txn.activate().unwrap();
                tx.send(()).unwrap();
                done_rx.recv().unwrap();
            })
        };
        rx.recv().unwrap();
        // The owner is not inside an operation, so the session mutex is free
        let err = txn.enlist(Participant::new()).unwrap_err();
        assert!(matches!(err, QuarryError::ConcurrentAccess { .. }));
        assert_eq!(txn.state(), TxnState::ActRef);
        done_tx.send(()).unwrap();
        owner.join().unwrap();
    }

    // ========================================================================
    // Heuristic rollback
    // ========================================================================

    #[test]
    fn test_heuristic_rollback_of_suspended_transaction() {
        let (hooks, _context, participant, txn) = fixture();
        txn.reference().unwrap();
        txn.execute_with(|| Ok(())).unwrap();
        assert_eq!(txn.state(), TxnState::DeactRef);

        let watchdog = {
            let txn = Arc::clone(&txn);
            thread::spawn(move || txn.heuristic_rollback("idle-timeout").unwrap())
        };
        assert!(watchdog.join().unwrap());
        assert_eq!(txn.state(), TxnState::Failed);
        assert_eq!(participant.rm.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.aborted.load(Ordering::SeqCst), 1);
        assert!(txn.rollback_cause().unwrap().is_timeout());

        // Terminal: nothing left to do
        assert!(!txn.heuristic_rollback("idle-timeout").unwrap());
    }

    #[test]
    fn test_heuristic_rollback_of_unstarted_transaction_aborts() {
        let (hooks, _context, _participant, txn) = fixture();
        assert!(txn.heuristic_rollback("transaction-timeout").unwrap());
        assert_eq!(txn.state(), TxnState::Failed);
        assert_eq!(hooks.aborted.load(Ordering::SeqCst), 1);
        let err = txn.execute_with(|| Ok(())).unwrap_err();
        assert!(matches!(err, QuarryError::TransactionFailed { .. }));
    }

    #[test]
    fn test_rejected_commit_does_not_shield_from_watchdog() {
        let (hooks, _context, participant, txn) = fixture();
        txn.reference().unwrap();
        txn.execute_with(|| Ok(())).unwrap();
        assert_eq!(txn.state(), TxnState::DeactRef);
        assert!(txn.commit().unwrap_err().is_protocol());

        let (inside_tx, inside_rx) = std::sync::mpsc::channel();
        let owner = {
            let (hooks, txn) = (Arc::clone(&hooks), Arc::clone(&txn));
            thread::spawn(move || {
                txn.execute_with(|| {
                    inside_tx.send(()).unwrap();
                    let started = Instant::now();
                    while !hooks.mutex().is_interrupted()
                        && started.elapsed() < Duration::from_secs(2)
                    {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Ok(())
                })
            })
        };
        inside_rx.recv().unwrap();
        let watchdog = {
            let txn = Arc::clone(&txn);
            thread::spawn(move || txn.heuristic_rollback("transaction-timeout").unwrap())
        };

        let err = owner.join().unwrap().unwrap_err();
        assert!(err.root_cause().is_timeout(), "unexpected error: {}", err);
        // The owner rolled back on its own; nothing left for the watchdog
        assert!(!watchdog.join().unwrap());
        assert_eq!(txn.state(), TxnState::Failed);
        assert_eq!(participant.rm.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_suspended_transaction_aborts_participants() {
        let (_hooks, _context, participant, txn) = fixture();
        txn.reference().unwrap();
        txn.execute_with(|| Ok(())).unwrap();
        assert_eq!(txn.enlisted_count(), 1);

        // A failing participant abort is logged, not propagated
        participant.fail_abort.store(true, Ordering::SeqCst);
        assert_eq!(Arc::strong_count(&txn), 1);
        drop(txn);
        assert_eq!(participant.aborts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_idle_tracking() {
        let (_hooks, _context, _participant, txn) = fixture();
        assert!(matches!(txn.last_active(), Activity::IdleSince(_)));
        txn.reference().unwrap();
        txn.execute_with(|| {
            assert_eq!(txn.last_active(), Activity::Active);
            Ok(())
        })
        .unwrap();
        assert!(matches!(txn.last_active(), Activity::IdleSince(_)));
    }
}
