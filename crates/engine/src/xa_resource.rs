//! Coordinator resource handed to outside transaction managers
//!
//! A session gives out two handles, one for read and one for write
//! transactions. Both speak for the same resource manager instance (the
//! session), so `is_same_rm` holds between them.
//!
//! Error mapping:
//!
//! | condition                                  | code            |
//! |--------------------------------------------|-----------------|
//! | unknown xid                                | `XAER_NOTA`     |
//! | `start(NOFLAGS)` with a known xid          | `XAER_DUPID`    |
//! | `start(NOFLAGS)` while another is associated | `XA_RBDEADLOCK` |
//! | `start(JOIN)` with a different xid         | `XAER_OUTSIDE`  |
//! | transaction creation failed                | `XAER_RMFAIL`   |
//! | negative timeout                           | `XAER_INVAL`    |
//! | heuristically rolled back                  | heuristic code, kept until `forget` |

use crate::factory::ExternalFactory;
use quarry_concurrency::{ExternalTransaction, Transaction};
use quarry_core::{
    EndFlag, QuarryError, ResourceId, ResourceManager, StartFlag, Vote, XaCode, XaError, Xid,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

type XaResult<T> = std::result::Result<T, XaError>;

/// One of a session's coordinator resource handles
pub struct SessionXaResource {
    factory: Arc<ExternalFactory>,
    write: bool,
}

impl SessionXaResource {
    pub(crate) fn new(factory: Arc<ExternalFactory>, write: bool) -> Self {
        SessionXaResource { factory, write }
    }

    /// True for the handle that starts write transactions
    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Set the session's transaction timeout in seconds; zero restores the default
    pub fn set_transaction_timeout(&self, seconds: i64) -> XaResult<bool> {
        if seconds < 0 {
            return Err(XaError::new(
                XaCode::Inval,
                format!("negative transaction timeout {}", seconds),
            ));
        }
        let _guard = self.factory.session_mutex().lock();
        self.factory
            .timeouts()
            .set_transaction_timeout(seconds.saturating_mul(1000));
        Ok(true)
    }

    /// Session's transaction timeout in whole seconds
    pub fn transaction_timeout(&self) -> i64 {
        let _guard = self.factory.session_mutex().lock();
        self.factory.timeouts().transaction_timeout().as_secs() as i64
    }

    fn lookup(&self, xid: &Xid) -> XaResult<Arc<ExternalTransaction>> {
        self.factory
            .transaction_for(xid)
            .ok_or_else(|| XaError::new(XaCode::NotA, format!("unknown transaction {}", xid)))
    }

    fn do_rollback(&self, xa: &ExternalTransaction) -> XaResult<()> {
        if xa.is_heuristically_rolled_back() {
            warn!(
                target: "quarry::xa",
                xid = %xa.xid(),
                code = ?xa.heuristic_code(),
                cause = ?xa.rollback_cause(),
                "Attempted to roll back heuristically rolled back transaction"
            );
            return Err(heuristic_error(xa));
        }
        if !xa.is_rolled_back() {
            xa.rollback()?;
        }
        Ok(())
    }
}

fn heuristic_error(xa: &ExternalTransaction) -> XaError {
    XaError::new(
        xa.heuristic_code().unwrap_or(XaCode::HeurRb),
        xa.rollback_cause()
            .unwrap_or_else(|| "transaction heuristically rolled back".to_string()),
    )
}

impl ResourceManager for SessionXaResource {
    fn rm_id(&self) -> ResourceId {
        self.factory.rm_id()
    }

    fn start(&self, xid: &Xid, flag: StartFlag) -> XaResult<()> {
        let _guard = self.factory.session_mutex().lock();
        debug!(target: "quarry::xa", session = %self.factory.session(), xid = %xid, ?flag, write = self.write, "start");
        match flag {
            StartFlag::NoFlags => {
                if self.factory.knows_xid(xid) {
                    return Err(XaError::new(
                        XaCode::DupId,
                        format!("{} already started", xid),
                    ));
                }
                if self.factory.associated().is_some() {
                    return Err(XaError::new(
                        XaCode::RbDeadlock,
                        "session already associated with a transaction",
                    ));
                }
                self.factory
                    .create_transaction(xid, self.write)
                    .map(|_| ())
                    .map_err(|e| {
                        error!(target: "quarry::xa", xid = %xid, error = %e, "Failed to create transaction");
                        XaError::new(XaCode::RmFail, e.to_string())
                    })
            }
            StartFlag::Join => match self.factory.associated() {
                None => Err(XaError::new(
                    XaCode::NotA,
                    "no transaction associated with session",
                )),
                Some(current) if current.xid() != xid => Err(XaError::new(
                    XaCode::Outside,
                    format!("session is associated with {}", current.xid()),
                )),
                Some(_) => Ok(()),
            },
            StartFlag::Resume => {
                let xa = self.lookup(xid)?;
                if xa.is_rolled_back() {
                    return Err(XaError::new(
                        XaCode::RbRollback,
                        xa.rollback_cause().unwrap_or_default(),
                    ));
                }
                if !self.factory.associate(&xa) {
                    return Err(XaError::new(
                        XaCode::Proto,
                        "session already associated with another transaction",
                    ));
                }
                Ok(())
            }
        }
    }

    fn end(&self, xid: &Xid, flag: EndFlag) -> XaResult<()> {
        let _guard = self.factory.session_mutex().lock();
        debug!(target: "quarry::xa", session = %self.factory.session(), xid = %xid, ?flag, "end");
        let xa = self.lookup(xid)?;
        match flag {
            EndFlag::Fail => self.do_rollback(&xa)?,
            EndFlag::Success => {
                if xa.is_heuristically_rolled_back() {
                    return Err(XaError::new(
                        XaCode::RbProto,
                        xa.rollback_cause().unwrap_or_default(),
                    ));
                }
            }
            EndFlag::Suspend => {}
        }
        self.factory.disassociate(&xa);
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> XaResult<Vote> {
        let _guard = self.factory.session_mutex().lock();
        debug!(target: "quarry::xa", session = %self.factory.session(), xid = %xid, "prepare");
        let xa = self.lookup(xid)?;
        if xa.is_heuristically_rolled_back() {
            return Err(heuristic_error(&xa));
        }
        if xa.is_rolled_back() {
            return Err(XaError::new(
                XaCode::RbRollback,
                xa.rollback_cause().unwrap_or_default(),
            ));
        }
        xa.prepare()?;
        Ok(Vote::Ok)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()> {
        let _guard = self.factory.session_mutex().lock();
        debug!(target: "quarry::xa", session = %self.factory.session(), xid = %xid, one_phase, "commit");
        let xa = self.lookup(xid)?;
        if xa.is_heuristically_rolled_back() {
            return Err(heuristic_error(&xa));
        }
        if one_phase {
            if let Err(e) = xa.prepare() {
                if let Err(rollback) = self.do_rollback(&xa) {
                    if rollback.code.is_heuristic() {
                        return Err(rollback);
                    }
                    error!(target: "quarry::xa", xid = %xid, error = %rollback, "Rollback after failed prepare failed");
                }
                self.factory.forget_xid(xid);
                return Err(e);
            }
        }
        match xa.commit() {
            Ok(()) => {
                self.factory.forget_xid(xid);
                Ok(())
            }
            Err(e) if e.code.is_heuristic() => Err(e),
            Err(e) => {
                self.factory.forget_xid(xid);
                Err(e)
            }
        }
    }

    fn rollback(&self, xid: &Xid) -> XaResult<()> {
        let _guard = self.factory.session_mutex().lock();
        debug!(target: "quarry::xa", session = %self.factory.session(), xid = %xid, "rollback");
        let xa = self.lookup(xid)?;
        self.do_rollback(&xa)?;
        self.factory.forget_xid(xid);
        Ok(())
    }

    fn forget(&self, xid: &Xid) -> XaResult<()> {
        let _guard = self.factory.session_mutex().lock();
        debug!(target: "quarry::xa", session = %self.factory.session(), xid = %xid, "forget");
        let xa = self.lookup(xid)?;
        if !xa.is_heuristically_rolled_back() && !xa.is_completed() {
            let err = xa.abort_transaction(
                "Outside transaction manager specified forget",
                Arc::new(QuarryError::protocol(format!("forget of {}", xid))),
            );
            debug!(target: "quarry::xa", xid = %xid, error = %err, "Aborted forgotten transaction");
        }
        self.factory.forget_xid(xid);
        Ok(())
    }

    fn recover(&self) -> XaResult<Vec<Xid>> {
        let _guard = self.factory.session_mutex().lock();
        Ok(Vec::new())
    }
}
