//! Session-driven transaction factory
//!
//! With autocommit on (the default) every operation runs in its own
//! transaction. Turning autocommit off takes the write lock and opens a
//! referenced write transaction that every later operation joins until
//! `commit` or `rollback` ends it and opens the next one.

use super::{Bound, SessionTimeouts};
use crate::context::DatabaseOperationContext;
use crate::database::Database;
use parking_lot::Mutex;
use quarry_concurrency::{
    CoordinatorTransaction, FactoryHooks, InternalTransaction, OperationContext, SessionMutex,
    Transaction,
};
use quarry_core::{QuarryError, Result, SessionId, TxnId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, error, warn};

struct InternalState {
    autocommit: bool,
    explicit: Option<Bound<InternalTransaction>>,
    write_txn: Option<Arc<InternalTransaction>>,
    failed: Option<(TxnId, Arc<QuarryError>)>,
    transactions: HashMap<TxnId, Arc<InternalTransaction>>,
    active: HashMap<ThreadId, TxnId>,
}

/// Transaction factory of an internally managed session
pub struct InternalFactory {
    session: SessionId,
    db: Arc<Database>,
    timeouts: Arc<SessionTimeouts>,
    mutex: SessionMutex,
    me: Weak<InternalFactory>,
    state: Mutex<InternalState>,
}

impl InternalFactory {
    /// Factory for `session`, starting with autocommit on
    pub fn new(session: SessionId, db: Arc<Database>, timeouts: Arc<SessionTimeouts>) -> Arc<Self> {
        Arc::new_cyclic(|me| InternalFactory {
            session,
            db,
            timeouts,
            mutex: SessionMutex::new(),
            me: me.clone(),
            state: Mutex::new(InternalState {
                autocommit: true,
                explicit: None,
                write_txn: None,
                failed: None,
                transactions: HashMap::new(),
                active: HashMap::new(),
            }),
        })
    }

    /// True while every operation commits on its own
    pub fn is_autocommit(&self) -> bool {
        self.state.lock().autocommit
    }

    /// True once the explicit transaction has failed and not been rolled back
    pub fn is_failed(&self) -> bool {
        self.state.lock().failed.is_some()
    }

    /// Live transactions of this session
    pub fn live_transactions(&self) -> usize {
        self.state.lock().transactions.len()
    }

    fn hooks(&self) -> Result<Arc<dyn FactoryHooks>> {
        self.me
            .upgrade()
            .map(|me| me as Arc<dyn FactoryHooks>)
            .ok_or_else(|| QuarryError::internal("transaction factory dropped"))
    }

    fn is_holding_write_lock(&self) -> bool {
        self.db.write_lock().is_holding_write_lock(self.session)
    }

    /// The transaction the next operation runs in
    ///
    /// With autocommit off this is the explicit transaction, whatever kind
    /// of operation is asking. Otherwise a new transaction is created; write
    /// requests first wait for the write lock.
    pub fn get_transaction(&self, write: bool) -> Result<Bound<InternalTransaction>> {
        let _guard = self.mutex.lock();
        if let Some(explicit) = self.state.lock().explicit.clone() {
            return Ok(explicit);
        }
        let hooks = self.hooks()?;
        if write {
            self.db.write_lock().obtain_write_lock_interruptibly(
                self.session,
                self.timeouts.write_deadline(),
                || self.mutex.is_interrupted(),
            )?;
        }
        let context = DatabaseOperationContext::new(Arc::clone(self.db.stores()), write);
        let txn = InternalTransaction::new(
            hooks,
            Arc::clone(&context) as Arc<dyn OperationContext>,
            write,
        );
        {
            let mut state = self.state.lock();
            if write {
                state.write_txn = Some(Arc::clone(&txn));
            }
            state.transactions.insert(txn.id(), Arc::clone(&txn));
        }
        let watched: Arc<dyn Transaction> = Arc::clone(&txn) as Arc<dyn Transaction>;
        self.db.reaper().register(
            &watched,
            self.timeouts.idle_timeout(),
            self.timeouts.transaction_timeout(),
        );
        debug!(target: "quarry::txn", session = %self.session, txn_id = %txn.id(), write, "Registered transaction");
        Ok(Bound { txn, context })
    }

    /// Switch autocommit on or off
    ///
    /// On to off opens the explicit write transaction. Off to on commits
    /// it. In a failed session, switching on acknowledges the failure.
    pub fn set_autocommit(&self, autocommit: bool) -> Result<()> {
        let _guard = self.mutex.lock();
        let lock = self.db.write_lock();

        let (failed, write_txn) = {
            let state = self.state.lock();
            (state.failed.is_some(), state.write_txn.clone())
        };
        if failed && self.is_holding_write_lock() {
            if let Some(txn) = write_txn {
                txn.abort_transaction(
                    "Session failed and still holding write lock",
                    Arc::new(QuarryError::protocol("failed session in set_autocommit")),
                );
            }
        }

        let holding = self.is_holding_write_lock();
        let failed = self.state.lock().failed.is_some();
        if !holding && !failed {
            self.state.lock().explicit = None;
            if autocommit {
                debug!(target: "quarry::txn", session = %self.session, "Autocommit already on");
                return Ok(());
            }
            let bound = self.get_transaction(true)?;
            if let Err(e) = bound.txn.reference() {
                return Err(bound
                    .txn
                    .abort_transaction("Failed to reference explicit transaction", Arc::new(e)));
            }
            let mut state = self.state.lock();
            state.explicit = Some(bound);
            state.autocommit = false;
            return Ok(());
        }

        if !autocommit {
            if !holding {
                return Err(QuarryError::protocol(
                    "attempt to turn autocommit off in a failed session",
                ));
            }
            debug!(target: "quarry::txn", session = %self.session, "Autocommit already off");
            return Ok(());
        }

        let write_txn = {
            let mut state = self.state.lock();
            state.autocommit = true;
            state.explicit = None;
            state.write_txn.clone()
        };
        if !holding {
            self.state.lock().failed = None;
            return Ok(());
        }
        let result = match write_txn {
            Some(txn) => txn.execute_with(|| {
                txn.dereference()?;
                txn.commit()
            }),
            None => Err(QuarryError::internal(
                "write lock held without a write transaction",
            )),
        };
        if self.is_holding_write_lock() {
            if let Err(e) = lock.release_write_lock(self.session) {
                error!(target: "quarry::txn", session = %self.session, error = %e, "Failed to release write lock after commit");
            }
        }
        result
    }

    /// Commit the explicit transaction and open the next one
    pub fn commit(&self) -> Result<()> {
        let _guard = self.mutex.lock();
        if let Some((txn, cause)) = self.state.lock().failed.clone() {
            return Err(QuarryError::transaction_failed(
                txn,
                "attempt to commit failed session",
                Some(cause),
            ));
        }
        if !self.is_holding_write_lock() {
            return Err(QuarryError::protocol(
                "attempt to commit while not the current writing transaction",
            ));
        }
        let lock = self.db.write_lock();
        lock.reserve_write_lock(self.session)?;
        let result = self
            .set_autocommit(true)
            .and_then(|()| self.set_autocommit(false));
        let released = lock.release_reserve(self.session);
        result.and(released)
    }

    /// Roll back the explicit transaction and open the next one
    ///
    /// In a failed session this acknowledges the failure.
    pub fn rollback(&self) -> Result<()> {
        let _guard = self.mutex.lock();
        let lock = self.db.write_lock();
        if self.is_holding_write_lock() {
            lock.reserve_write_lock(self.session)?;
            let write_txn = self.state.lock().write_txn.clone();
            let result = match &write_txn {
                Some(txn) => txn.execute_with(|| {
                    txn.dereference()?;
                    txn.explicit_rollback()
                }),
                None => Ok(()),
            };
            if self.is_holding_write_lock() {
                // Still referenced elsewhere
                if let Some(txn) = &write_txn {
                    txn.abort_transaction(
                        "Rollback failed",
                        Arc::new(QuarryError::protocol(
                            "rollback failed to terminate write transaction",
                        )),
                    );
                }
            }
            self.state.lock().explicit = None;
            let restarted = self.set_autocommit(false);
            let released = lock.release_reserve(self.session);
            return result.and(restarted).and(released);
        }
        if self.state.lock().failed.is_some() {
            {
                let mut state = self.state.lock();
                state.explicit = None;
                state.failed = None;
            }
            return self.set_autocommit(false);
        }
        Err(QuarryError::protocol(
            "attempt to roll back while not in the current writing transaction",
        ))
    }

    /// Roll back every live transaction and give up the write lock
    pub fn closing_session(&self) -> Result<()> {
        let _guard = match self.mutex.lock_for_completion(None, || false) {
            Some(guard) => guard,
            None => self.mutex.lock(),
        };
        debug!(target: "quarry::txn", session = %self.session, "Cleaning up transactions on session close");

        let mut first_error = None;
        let mut requires_abort: Vec<(Arc<InternalTransaction>, Arc<QuarryError>)> = Vec::new();
        let write_txn = self.state.lock().write_txn.take();
        if let Some(txn) = write_txn {
            if !txn.is_terminated() {
                warn!(target: "quarry::txn", session = %self.session, txn_id = %txn.id(), "Closing session while holding write lock");
                if let Err(e) = txn.heuristic_rollback("session closed while holding write lock") {
                    let e = Arc::new(e);
                    first_error.get_or_insert_with(|| Arc::clone(&e));
                    requires_abort.push((txn, e));
                }
            }
        }

        let live: Vec<Arc<InternalTransaction>> =
            self.state.lock().transactions.values().cloned().collect();
        for txn in live {
            if txn.is_terminated() {
                continue;
            }
            if let Err(e) = txn.heuristic_rollback("rollback due to session close") {
                let e = Arc::new(e);
                first_error.get_or_insert_with(|| Arc::clone(&e));
                requires_abort.push((txn, e));
            }
        }

        for (txn, cause) in requires_abort {
            error!(target: "quarry::txn", session = %self.session, txn_id = %txn.id(), "Heuristic rollback failed on session close, aborting");
            txn.abort_transaction("Heuristic rollback failed on session close", cause);
        }

        let drained: Vec<TxnId> = {
            let mut state = self.state.lock();
            state.explicit = None;
            state.failed = None;
            state.active.clear();
            state.transactions.drain().map(|(id, _)| id).collect()
        };
        for id in drained {
            self.db.reaper().cancel(id);
        }
        self.db.write_lock().closing_session(self.session);

        match first_error {
            Some(cause) => Err(QuarryError::rolled_back(
                "heuristic rollback failed on session close",
                cause,
            )),
            None => Ok(()),
        }
    }
}

impl FactoryHooks for InternalFactory {
    fn mutex(&self) -> &SessionMutex {
        &self.mutex
    }

    fn transaction_start(&self, txn: &InternalTransaction) -> Result<Arc<dyn CoordinatorTransaction>> {
        let _guard = self.mutex.lock();
        let current = thread::current().id();
        {
            let state = self.state.lock();
            if state.active.contains_key(&current) {
                return Err(QuarryError::protocol(
                    "attempt to start transaction in thread with existing active transaction",
                ));
            }
            if state.active.values().any(|id| *id == txn.id()) {
                return Err(QuarryError::protocol("attempt to start transaction twice"));
            }
        }
        debug!(target: "quarry::txn", session = %self.session, txn_id = %txn.id(), "Beginning transaction");
        let coordinator = self.db.coordinator().begin()?;
        self.state.lock().active.insert(current, txn.id());
        Ok(coordinator)
    }

    fn transaction_resumed(&self, txn: &InternalTransaction) -> Result<()> {
        let _guard = self.mutex.lock();
        let current = thread::current().id();
        let mut state = self.state.lock();
        if state.active.contains_key(&current) {
            return Err(QuarryError::protocol(
                "attempt to resume transaction in already activated thread",
            ));
        }
        if state.active.values().any(|id| *id == txn.id()) {
            return Err(QuarryError::protocol("attempt to resume active transaction"));
        }
        state.active.insert(current, txn.id());
        Ok(())
    }

    fn transaction_suspended(&self, txn: &InternalTransaction) -> Result<()> {
        let _guard = self.mutex.lock();
        let current = thread::current().id();
        let mut state = self.state.lock();
        if state.active.get(&current) != Some(&txn.id()) {
            return Err(QuarryError::protocol(
                "attempt to suspend transaction from outside thread",
            ));
        }
        let is_write = state
            .write_txn
            .as_ref()
            .map_or(false, |w| w.id() == txn.id());
        if state.autocommit && is_write {
            error!(target: "quarry::txn", session = %self.session, txn_id = %txn.id(), "Attempt to suspend write transaction without setting autocommit off");
            return Err(QuarryError::protocol(
                "attempt to suspend write transaction without setting autocommit off",
            ));
        }
        state.active.remove(&current);
        Ok(())
    }

    fn transaction_complete(&self, txn: &InternalTransaction) -> Result<()> {
        let _guard = self.mutex.lock();
        self.db.reaper().cancel(txn.id());
        let was_writer = {
            let mut state = self.state.lock();
            let was_writer = state
                .write_txn
                .as_ref()
                .map_or(false, |w| w.id() == txn.id());
            if was_writer {
                state.write_txn = None;
            }
            state.transactions.remove(&txn.id());
            state.active.retain(|_, id| *id != txn.id());
            was_writer
        };
        debug!(target: "quarry::txn", session = %self.session, txn_id = %txn.id(), "Transaction complete");
        if was_writer && self.is_holding_write_lock() {
            self.db.write_lock().release_write_lock(self.session)?;
        }
        Ok(())
    }

    fn transaction_aborted(&self, txn: &InternalTransaction, cause: &Arc<QuarryError>) {
        let _guard = self.mutex.lock();
        {
            let mut state = self.state.lock();
            let is_write = state
                .write_txn
                .as_ref()
                .map_or(false, |w| w.id() == txn.id());
            if !state.autocommit && is_write {
                warn!(target: "quarry::txn", session = %self.session, txn_id = %txn.id(), error = %cause, "Explicit transaction failed, session requires rollback");
                state.failed = Some((txn.id(), Arc::clone(cause)));
            }
        }
        if let Err(e) = self.transaction_complete(txn) {
            error!(target: "quarry::txn", session = %self.session, txn_id = %txn.id(), error = %e, "Error managing transaction abort");
        }
    }
}
