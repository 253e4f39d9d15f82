//! Sessions: the entry point for reading and writing graphs
//!
//! A session starts unbound and binds to one control mode on its first
//! transactional call:
//!
//! - internal: `set_autocommit`, `commit` and `rollback` are called on the
//!   session itself; data operations bind this mode too
//! - external: an outside transaction manager drives the session through
//!   the resource handles from `get_write_resource` / `get_read_resource`
//!
//! Once bound, calls belonging to the other mode fail with a protocol error.

use crate::context::DatabaseOperationContext;
use crate::database::Database;
use crate::factory::{ExternalFactory, InternalFactory, SessionTimeouts};
use crate::resolver::{GraphResolver, Triple};
use crate::xa_resource::SessionXaResource;
use parking_lot::Mutex;
use quarry_concurrency::Transaction;
use quarry_core::{QuarryError, Result, SessionId, TxnId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

enum Mode {
    Unbound,
    Internal(Arc<InternalFactory>),
    External(Arc<ExternalFactory>),
}

/// A client's connection to a database
pub struct Session {
    id: SessionId,
    db: Arc<Database>,
    timeouts: Arc<SessionTimeouts>,
    mode: Mutex<Mode>,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(db: Arc<Database>) -> Self {
        let timeouts = Arc::new(SessionTimeouts::new(
            db.config().idle_timeout_ms,
            db.config().transaction_timeout_ms,
        ));
        let id = SessionId::next();
        debug!(target: "quarry::txn", session = %id, "Session created");
        Session {
            id,
            db,
            timeouts,
            mode: Mutex::new(Mode::Unbound),
            closed: AtomicBool::new(false),
        }
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// True once bound to internal control
    pub fn is_internal(&self) -> bool {
        matches!(*self.mode.lock(), Mode::Internal(_))
    }

    /// True once bound to external control
    pub fn is_external(&self) -> bool {
        matches!(*self.mode.lock(), Mode::External(_))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QuarryError::protocol(format!("session {} is closed", self.id)));
        }
        Ok(())
    }

    fn internal(&self) -> Result<Arc<InternalFactory>> {
        self.check_open()?;
        let mut mode = self.mode.lock();
        match &*mode {
            Mode::Internal(factory) => Ok(Arc::clone(factory)),
            Mode::External(_) => Err(QuarryError::protocol(
                "attempt to use internal transaction control in externally managed session",
            )),
            Mode::Unbound => {
                let factory =
                    InternalFactory::new(self.id, Arc::clone(&self.db), Arc::clone(&self.timeouts));
                debug!(target: "quarry::txn", session = %self.id, "Session bound to internal transaction control");
                *mode = Mode::Internal(Arc::clone(&factory));
                Ok(factory)
            }
        }
    }

    fn external(&self) -> Result<Arc<ExternalFactory>> {
        self.check_open()?;
        let mut mode = self.mode.lock();
        match &*mode {
            Mode::External(factory) => Ok(Arc::clone(factory)),
            Mode::Internal(_) => Err(QuarryError::protocol(
                "attempt to use external transaction control in internally managed session",
            )),
            Mode::Unbound => {
                let factory =
                    ExternalFactory::new(self.id, Arc::clone(&self.db), Arc::clone(&self.timeouts));
                debug!(target: "quarry::xa", session = %self.id, "Session bound to external transaction control");
                *mode = Mode::External(Arc::clone(&factory));
                Ok(factory)
            }
        }
    }

    /// Transaction the next operation runs in, binding internal control if unbound
    fn transaction(&self, write: bool) -> Result<(Arc<dyn Transaction>, Arc<DatabaseOperationContext>)> {
        self.check_open()?;
        let external = match &*self.mode.lock() {
            Mode::External(factory) => Some(Arc::clone(factory)),
            _ => None,
        };
        match external {
            Some(factory) => {
                let bound = factory.get_transaction(write)?;
                Ok((bound.txn as Arc<dyn Transaction>, bound.context))
            }
            None => {
                let bound = self.internal()?.get_transaction(write)?;
                Ok((bound.txn as Arc<dyn Transaction>, bound.context))
            }
        }
    }

    // ========================================================================
    // Internal control
    // ========================================================================

    /// Switch autocommit on or off
    ///
    /// Turning it off waits for the write lock and opens a write
    /// transaction every later operation joins.
    pub fn set_autocommit(&self, autocommit: bool) -> Result<()> {
        self.internal()?.set_autocommit(autocommit)
    }

    /// True while every operation commits on its own
    pub fn is_autocommit(&self) -> Result<bool> {
        Ok(self.internal()?.is_autocommit())
    }

    /// Commit the current explicit transaction and start the next one
    pub fn commit(&self) -> Result<()> {
        self.internal()?.commit()
    }

    /// Roll back the current explicit transaction and start the next one
    pub fn rollback(&self) -> Result<()> {
        self.internal()?.rollback()
    }

    // ========================================================================
    // External control
    // ========================================================================

    /// Resource handle an outside transaction manager starts write branches on
    pub fn get_write_resource(&self) -> Result<SessionXaResource> {
        Ok(SessionXaResource::new(self.external()?, true))
    }

    /// Resource handle an outside transaction manager starts read branches on
    pub fn get_read_resource(&self) -> Result<SessionXaResource> {
        Ok(SessionXaResource::new(self.external()?, false))
    }

    // ========================================================================
    // Timeouts
    // ========================================================================

    /// Maximum time a transaction may sit idle; `<= 0` restores the default
    pub fn set_idle_timeout(&self, ms: i64) {
        self.timeouts.set_idle_timeout(ms);
    }

    /// Maximum lifetime of a transaction; `<= 0` restores the default
    ///
    /// Also bounds how long a writer waits for the write lock.
    pub fn set_transaction_timeout(&self, ms: i64) {
        self.timeouts.set_transaction_timeout(ms);
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Run `op` against graph content in the session's current transaction
    ///
    /// With autocommit on the operation gets a transaction of its own,
    /// committed when `op` returns. A failing `op` rolls the transaction
    /// back.
    pub fn execute<R>(&self, write: bool, op: impl FnOnce(&GraphResolver) -> Result<R>) -> Result<R> {
        let (txn, context) = self.transaction(write)?;
        run_in(txn.as_ref(), &context, op)
    }

    /// Add `triple` to `graph`
    pub fn insert(&self, graph: &str, triple: &Triple) -> Result<bool> {
        self.execute(true, |r| r.insert(graph, triple))
    }

    /// Remove `triple` from `graph`
    pub fn delete(&self, graph: &str, triple: &Triple) -> Result<bool> {
        self.execute(true, |r| r.delete(graph, triple))
    }

    /// Triples of `graph` matching the bound positions
    pub fn find(
        &self,
        graph: &str,
        subject: Option<&str>,
        predicate: Option<&str>,
        object: Option<&str>,
    ) -> Result<Vec<Triple>> {
        self.execute(false, |r| r.find(graph, subject, predicate, object))
    }

    /// Number of triples in `graph`
    pub fn count(&self, graph: &str) -> Result<usize> {
        self.execute(false, |r| r.count(graph))
    }

    /// Names of every non-empty graph
    pub fn graphs(&self) -> Result<Vec<String>> {
        self.execute(false, GraphResolver::graphs)
    }

    /// Remove every triple of `graph`
    pub fn drop_graph(&self, graph: &str) -> Result<usize> {
        self.execute(true, |r| r.drop_graph(graph))
    }

    /// Allocate a fresh blank node
    pub fn new_blank_node(&self) -> Result<String> {
        self.execute(true, GraphResolver::new_blank_node)
    }

    /// Open a read transaction that spans several operations
    ///
    /// The snapshot is pinned at the first activation. With autocommit off
    /// the handle joins the explicit transaction instead.
    pub fn begin_read(&self) -> Result<TransactionHandle> {
        self.begin(false)
    }

    /// Open a handle on the write transaction
    ///
    /// Internal control requires autocommit off; the handle then joins
    /// the explicit transaction.
    pub fn begin_write(&self) -> Result<TransactionHandle> {
        self.begin(true)
    }

    fn begin(&self, write: bool) -> Result<TransactionHandle> {
        self.check_open()?;
        let (is_external, autocommit) = match &*self.mode.lock() {
            Mode::External(_) => (true, false),
            Mode::Internal(factory) => (false, factory.is_autocommit()),
            Mode::Unbound => (false, true),
        };
        if write && !is_external && autocommit {
            return Err(QuarryError::protocol("write handles require auto-commit off"));
        }
        let (txn, context) = self.transaction(write)?;
        if !is_external {
            txn.execute(&mut || txn.reference())?;
        }
        debug!(target: "quarry::txn", session = %self.id, txn_id = %txn.id(), write, "Opened transaction handle");
        Ok(TransactionHandle {
            txn,
            context,
            referenced: !is_external,
            released: AtomicBool::new(false),
        })
    }

    /// Roll back every live transaction and give up the write lock
    ///
    /// Further calls on the session fail. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mode = std::mem::replace(&mut *self.mode.lock(), Mode::Unbound);
        let result = match mode {
            Mode::Unbound => Ok(()),
            Mode::Internal(factory) => factory.closing_session(),
            Mode::External(factory) => factory.closing_session(),
        };
        self.db.write_lock().closing_session(self.id);
        debug!(target: "quarry::txn", session = %self.id, "Session closed");
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(target: "quarry::txn", session = %self.id, error = %e, "Failed to close session cleanly");
        }
    }
}

/// A referenced transaction spanning several operations
///
/// Dropping the handle releases it.
pub struct TransactionHandle {
    txn: Arc<dyn Transaction>,
    context: Arc<DatabaseOperationContext>,
    referenced: bool,
    released: AtomicBool,
}

impl TransactionHandle {
    /// Transaction behind the handle
    pub fn id(&self) -> TxnId {
        self.txn.id()
    }

    /// True if operations through the handle may write
    pub fn is_write(&self) -> bool {
        self.context.is_write()
    }

    /// True once the transaction has committed, rolled back or failed
    pub fn is_terminated(&self) -> bool {
        self.txn.is_terminated()
    }

    /// Run `op` in the handle's transaction
    pub fn execute<R>(&self, op: impl FnOnce(&GraphResolver) -> Result<R>) -> Result<R> {
        if self.released.load(Ordering::Acquire) {
            return Err(QuarryError::protocol(format!(
                "transaction handle for {} already released",
                self.txn.id()
            )));
        }
        run_in(self.txn.as_ref(), &self.context, op)
    }

    /// Drop the handle's reference
    ///
    /// An unreferenced read transaction commits here. Releasing twice is a
    /// no-op.
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.referenced || self.txn.is_terminated() {
            return Ok(());
        }
        self.txn.execute(&mut || self.txn.dereference())
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!(target: "quarry::txn", txn_id = %self.txn.id(), error = %e, "Failed to release transaction handle");
        }
    }
}

fn run_in<R>(
    txn: &dyn Transaction,
    context: &DatabaseOperationContext,
    op: impl FnOnce(&GraphResolver) -> Result<R>,
) -> Result<R> {
    let mut op = Some(op);
    let mut output = None;
    txn.execute(&mut || {
        let op = op
            .take()
            .ok_or_else(|| QuarryError::internal("operation already ran"))?;
        let resolver = context.resolver()?;
        output = Some(op(&resolver)?);
        Ok(())
    })?;
    output.ok_or_else(|| QuarryError::internal("operation produced no result"))
}
