//! Factory for transactions demarcated by an outside transaction manager
//!
//! The outside manager drives the session through its coordinator
//! resource (see [`SessionXaResource`]). At most one transaction is
//! associated with the session at a time; session operations run in it.
//!
//! [`SessionXaResource`]: crate::xa_resource::SessionXaResource

use super::{Bound, SessionTimeouts};
use crate::context::DatabaseOperationContext;
use crate::database::Database;
use parking_lot::Mutex;
use quarry_concurrency::{
    ExternalHooks, ExternalTransaction, OperationContext, SessionMutex, Transaction,
};
use quarry_core::{QuarryError, ResourceId, Result, SessionId, TxnId, Xid};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

struct ExternalState {
    associated: Option<Bound<ExternalTransaction>>,
    write_txn: Option<TxnId>,
    transactions: HashMap<TxnId, Bound<ExternalTransaction>>,
    xids: HashMap<Xid, Arc<ExternalTransaction>>,
}

/// Transaction factory of an externally managed session
pub struct ExternalFactory {
    session: SessionId,
    rm_id: ResourceId,
    db: Arc<Database>,
    timeouts: Arc<SessionTimeouts>,
    mutex: SessionMutex,
    me: Weak<ExternalFactory>,
    state: Mutex<ExternalState>,
}

impl ExternalFactory {
    /// Factory for `session`
    pub fn new(session: SessionId, db: Arc<Database>, timeouts: Arc<SessionTimeouts>) -> Arc<Self> {
        Arc::new_cyclic(|me| ExternalFactory {
            session,
            rm_id: ResourceId::next(),
            db,
            timeouts,
            mutex: SessionMutex::new(),
            me: me.clone(),
            state: Mutex::new(ExternalState {
                associated: None,
                write_txn: None,
                transactions: HashMap::new(),
                xids: HashMap::new(),
            }),
        })
    }

    /// Owning session
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Resource manager id shared by every resource handle of the session
    pub fn rm_id(&self) -> ResourceId {
        self.rm_id
    }

    /// Session timeouts
    pub fn timeouts(&self) -> &Arc<SessionTimeouts> {
        &self.timeouts
    }

    /// Session mutex
    pub fn session_mutex(&self) -> &SessionMutex {
        &self.mutex
    }

    /// Transaction associated with the session, for a session operation
    pub fn get_transaction(&self, write: bool) -> Result<Bound<ExternalTransaction>> {
        let _guard = self.mutex.lock();
        let state = self.state.lock();
        let Some(bound) = state.associated.clone() else {
            return Err(QuarryError::protocol(
                "no externally mediated transaction associated with session",
            ));
        };
        if write && state.write_txn != Some(bound.txn.id()) {
            return Err(QuarryError::protocol(
                "read-only transaction associated with session when requesting write operation",
            ));
        }
        Ok(bound)
    }

    /// Create a transaction for `xid` and associate it with the session
    ///
    /// Write transactions wait for the database write lock first.
    pub fn create_transaction(&self, xid: &Xid, write: bool) -> Result<Arc<ExternalTransaction>> {
        let _guard = self.mutex.lock();
        let hooks = self
            .me
            .upgrade()
            .map(|me| me as Arc<dyn ExternalHooks>)
            .ok_or_else(|| QuarryError::internal("transaction factory dropped"))?;
        if self.state.lock().associated.is_some() {
            return Err(QuarryError::protocol(
                "attempt to create transaction while session has an associated transaction",
            ));
        }
        if write {
            self.db.write_lock().obtain_write_lock_interruptibly(
                self.session,
                self.timeouts.write_deadline(),
                || self.mutex.is_interrupted(),
            )?;
        }

        let context = DatabaseOperationContext::new(Arc::clone(self.db.stores()), write);
        let txn = match ExternalTransaction::new(
            hooks,
            Arc::clone(&context) as Arc<dyn OperationContext>,
            xid.clone(),
            write,
        ) {
            Ok(txn) => txn,
            Err(e) => {
                if write {
                    if let Err(release) = self.db.write_lock().release_write_lock(self.session) {
                        error!(target: "quarry::xa", session = %self.session, error = %release, "Failed to release write lock after failed transaction creation");
                    }
                }
                return Err(e);
            }
        };

        let bound = Bound {
            txn: Arc::clone(&txn),
            context,
        };
        {
            let mut state = self.state.lock();
            if write {
                state.write_txn = Some(txn.id());
            }
            state.transactions.insert(txn.id(), bound.clone());
            state.xids.insert(xid.clone(), Arc::clone(&txn));
            state.associated = Some(bound);
        }
        let watched: Arc<dyn Transaction> = Arc::clone(&txn) as Arc<dyn Transaction>;
        self.db.reaper().register(
            &watched,
            self.timeouts.idle_timeout(),
            self.timeouts.transaction_timeout(),
        );
        debug!(target: "quarry::xa", session = %self.session, txn_id = %txn.id(), xid = %xid, write, "Created external transaction");
        Ok(txn)
    }

    /// Transaction bound to `xid`, until it is forgotten
    pub fn transaction_for(&self, xid: &Xid) -> Option<Arc<ExternalTransaction>> {
        self.state.lock().xids.get(xid).cloned()
    }

    /// Stop tracking `xid`
    pub fn forget_xid(&self, xid: &Xid) {
        self.state.lock().xids.remove(xid);
    }

    /// True if a branch with `xid` is tracked
    pub fn knows_xid(&self, xid: &Xid) -> bool {
        self.state.lock().xids.contains_key(xid)
    }

    /// Transaction currently associated with the session
    pub fn associated(&self) -> Option<Arc<ExternalTransaction>> {
        self.state
            .lock()
            .associated
            .as_ref()
            .map(|b| Arc::clone(&b.txn))
    }

    /// Associate `txn` with the session; false if another one already is
    pub fn associate(&self, txn: &Arc<ExternalTransaction>) -> bool {
        let mut state = self.state.lock();
        if let Some(current) = &state.associated {
            return current.txn.id() == txn.id();
        }
        match state.transactions.get(&txn.id()).cloned() {
            Some(bound) => {
                state.associated = Some(bound);
                true
            }
            None => false,
        }
    }

    /// Drop the association with `txn`, if it is the associated one
    pub fn disassociate(&self, txn: &ExternalTransaction) {
        let mut state = self.state.lock();
        if state
            .associated
            .as_ref()
            .map_or(false, |b| b.txn.id() == txn.id())
        {
            state.associated = None;
        }
    }

    /// Roll back every live transaction and give up the write lock
    pub fn closing_session(&self) -> Result<()> {
        let _guard = match self.mutex.lock_for_completion(None, || false) {
            Some(guard) => guard,
            None => self.mutex.lock(),
        };
        debug!(target: "quarry::xa", session = %self.session, "Cleaning up transactions on session close");
        let live: Vec<Arc<ExternalTransaction>> = self
            .state
            .lock()
            .transactions
            .values()
            .map(|b| Arc::clone(&b.txn))
            .collect();

        let mut first_error = None;
        for txn in live {
            if txn.is_terminated() {
                continue;
            }
            warn!(target: "quarry::xa", session = %self.session, txn_id = %txn.id(), xid = %txn.xid(), "Rolling back external transaction on session close");
            if let Err(e) = txn.heuristic_rollback("rollback due to session close") {
                let e = Arc::new(e);
                error!(target: "quarry::xa", session = %self.session, txn_id = %txn.id(), error = %e, "Heuristic rollback failed on session close, aborting");
                txn.abort_transaction("Heuristic rollback failed on session close", Arc::clone(&e));
                first_error.get_or_insert(e);
            }
        }

        let drained: Vec<TxnId> = {
            let mut state = self.state.lock();
            state.associated = None;
            state.write_txn = None;
            state.xids.clear();
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

impl ExternalHooks for ExternalFactory {
    fn mutex(&self) -> &SessionMutex {
        &self.mutex
    }

    fn transaction_complete(&self, txn: &ExternalTransaction, cause: Option<&str>) -> Result<()> {
        let _guard = self.mutex.lock();
        self.db.reaper().cancel(txn.id());
        let was_writer = {
            let mut state = self.state.lock();
            let was_writer = state.write_txn == Some(txn.id());
            if was_writer {
                state.write_txn = None;
            }
            if state
                .associated
                .as_ref()
                .map_or(false, |b| b.txn.id() == txn.id())
            {
                state.associated = None;
            }
            state.transactions.remove(&txn.id());
            was_writer
        };
        match cause {
            Some(cause) => debug!(target: "quarry::xa", session = %self.session, txn_id = %txn.id(), cause, "External transaction rolled back"),
            None => debug!(target: "quarry::xa", session = %self.session, txn_id = %txn.id(), "External transaction complete"),
        }
        if was_writer && self.db.write_lock().is_holding_write_lock(self.session) {
            self.db.write_lock().release_write_lock(self.session)?;
        }
        Ok(())
    }
}
