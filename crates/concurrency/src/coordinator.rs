//! Coordinator transactions
//!
//! An internally managed transaction enlists its resources into a
//! coordinator transaction, which drives them through two-phase commit:
//!
//! ```text
//! commit:
//!   1. end(SUCCESS) on every resource
//!   2. one resource  → commit(one_phase = true)
//!      many resources → prepare all; any failure → rollback all
//!                       then commit(one_phase = false) on every OK voter
//! ```
//!
//! [`LocalCoordinator`] is the in-process implementation; embedders can
//! supply their own through the [`Coordinator`] trait.

use parking_lot::Mutex;
use quarry_core::{
    EndFlag, QuarryError, ResourceManager, Result, StartFlag, Vote, XaError, Xid,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Format id of xids minted by [`LocalCoordinator`] ("QR")
pub const LOCAL_FORMAT_ID: i32 = 0x5152;

/// Lifecycle of a coordinator transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorStatus {
    /// Associated with the driving thread
    Active,
    /// Dissociated, resources ended with SUSPEND
    Suspended,
    /// Only rollback is possible
    MarkedRollback,
    /// Committed
    Committed,
    /// Rolled back
    RolledBack,
}

impl fmt::Display for CoordinatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Source of coordinator transactions
pub trait Coordinator: Send + Sync {
    /// Begin a new coordinator transaction
    fn begin(&self) -> Result<Arc<dyn CoordinatorTransaction>>;
}

/// A two-phase commit capable transaction resources are enlisted into
pub trait CoordinatorTransaction: Send + Sync {
    /// Branch identifier handed to enlisted resources
    fn xid(&self) -> &Xid;

    /// Join `resource` to this transaction
    fn enlist_resource(&self, resource: Arc<dyn ResourceManager>) -> Result<()>;

    /// Dissociate from the driving thread
    fn suspend(&self) -> Result<()>;

    /// Reassociate with the driving thread
    fn resume(&self) -> Result<()>;

    /// Commit every enlisted resource
    fn commit(&self) -> Result<()>;

    /// Roll back every enlisted resource
    fn rollback(&self) -> Result<()>;

    /// Forbid commit
    fn set_rollback_only(&self);

    /// Current status
    fn status(&self) -> CoordinatorStatus;
}

/// In-process coordinator
#[derive(Debug, Default)]
pub struct LocalCoordinator {
    begun: AtomicU64,
}

impl LocalCoordinator {
    /// Create a coordinator
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions begun
    pub fn begun(&self) -> u64 {
        self.begun.load(Ordering::Relaxed)
    }
}

impl Coordinator for LocalCoordinator {
    fn begin(&self) -> Result<Arc<dyn CoordinatorTransaction>> {
        let sequence = self.begun.fetch_add(1, Ordering::Relaxed);
        let xid = Xid::generate(LOCAL_FORMAT_ID).with_branch(&sequence.to_be_bytes());
        debug!(target: "quarry::xa", xid = %xid, "Began coordinator transaction");
        Ok(Arc::new(LocalTransaction::new(xid)))
    }
}

struct LocalInner {
    status: CoordinatorStatus,
    resources: Vec<Arc<dyn ResourceManager>>,
}

/// Coordinator transaction driven by [`LocalCoordinator`]
pub struct LocalTransaction {
    xid: Xid,
    inner: Mutex<LocalInner>,
}

impl LocalTransaction {
    /// Create an active transaction for `xid`
    pub fn new(xid: Xid) -> Self {
        LocalTransaction {
            xid,
            inner: Mutex::new(LocalInner {
                status: CoordinatorStatus::Active,
                resources: Vec::new(),
            }),
        }
    }

    /// Number of enlisted resources
    pub fn resource_count(&self) -> usize {
        self.inner.lock().resources.len()
    }

    fn resources(&self) -> Vec<Arc<dyn ResourceManager>> {
        self.inner.lock().resources.clone()
    }

    fn set_status(&self, status: CoordinatorStatus) {
        self.inner.lock().status = status;
    }

    fn illegal(&self, action: &str, status: CoordinatorStatus) -> QuarryError {
        QuarryError::protocol(format!(
            "cannot {} coordinator transaction {} in {} state",
            action, self.xid, status
        ))
    }

    /// Roll back every resource, returning the first failure
    fn rollback_resources(&self, resources: &[Arc<dyn ResourceManager>]) -> Option<XaError> {
        let mut first = None;
        for rm in resources {
            if let Err(e) = rm.rollback(&self.xid) {
                error!(target: "quarry::xa", xid = %self.xid, rm = %rm.rm_id(), error = %e, "Resource rollback failed");
                first.get_or_insert(e);
            }
        }
        first
    }
}

impl CoordinatorTransaction for LocalTransaction {
    fn xid(&self) -> &Xid {
        &self.xid
    }

    fn enlist_resource(&self, resource: Arc<dyn ResourceManager>) -> Result<()> {
        {
            let inner = self.inner.lock();
            if inner.status != CoordinatorStatus::Active {
                return Err(self.illegal("enlist into", inner.status));
            }
            if inner
                .resources
                .iter()
                .any(|rm| rm.is_same_rm(resource.as_ref()))
            {
                return Ok(());
            }
        }
        resource.start(&self.xid, StartFlag::NoFlags)?;
        self.inner.lock().resources.push(resource);
        Ok(())
    }

    fn suspend(&self) -> Result<()> {
        let status = self.status();
        if status != CoordinatorStatus::Active {
            return Err(self.illegal("suspend", status));
        }
        for rm in self.resources() {
            rm.end(&self.xid, EndFlag::Suspend)?;
        }
        self.set_status(CoordinatorStatus::Suspended);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let status = self.status();
        if status != CoordinatorStatus::Suspended {
            return Err(self.illegal("resume", status));
        }
        for rm in self.resources() {
            rm.start(&self.xid, StartFlag::Resume)?;
        }
        self.set_status(CoordinatorStatus::Active);
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let status = self.status();
        match status {
            CoordinatorStatus::Active => {}
            CoordinatorStatus::MarkedRollback => {
                self.rollback()?;
                return Err(QuarryError::protocol(format!(
                    "coordinator transaction {} was marked rollback-only",
                    self.xid
                )));
            }
            other => return Err(self.illegal("commit", other)),
        }

        let resources = self.resources();
        for rm in &resources {
            if let Err(e) = rm.end(&self.xid, EndFlag::Success) {
                self.rollback_resources(&resources);
                self.set_status(CoordinatorStatus::RolledBack);
                return Err(e.into());
            }
        }

        if let [only] = resources.as_slice() {
            let result = only.commit(&self.xid, true);
            return match result {
                Ok(()) => {
                    self.set_status(CoordinatorStatus::Committed);
                    Ok(())
                }
                Err(e) => {
                    // A rollback-family code means the resource already rolled itself back
                    if !e.code.is_rollback() {
                        self.rollback_resources(&resources);
                    }
                    self.set_status(CoordinatorStatus::RolledBack);
                    Err(e.into())
                }
            };
        }

        let mut voters = Vec::with_capacity(resources.len());
        for (i, rm) in resources.iter().enumerate() {
            match rm.prepare(&self.xid) {
                Ok(Vote::Ok) => voters.push(Arc::clone(rm)),
                Ok(Vote::ReadOnly) => {}
                Err(e) => {
                    warn!(target: "quarry::xa", xid = %self.xid, rm = %rm.rm_id(), error = %e, "Prepare failed, rolling back");
                    let others: Vec<_> = resources
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| *j != i || !e.code.is_rollback())
                        .map(|(_, rm)| Arc::clone(rm))
                        .collect();
                    self.rollback_resources(&others);
                    self.set_status(CoordinatorStatus::RolledBack);
                    return Err(e.into());
                }
            }
        }

        self.set_status(CoordinatorStatus::Committed);
        let mut first = None;
        for rm in voters {
            if let Err(e) = rm.commit(&self.xid, false) {
                error!(target: "quarry::xa", xid = %self.xid, rm = %rm.rm_id(), error = %e, "Second-phase commit failed");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn rollback(&self) -> Result<()> {
        let status = self.status();
        match status {
            CoordinatorStatus::RolledBack => return Ok(()),
            CoordinatorStatus::Committed => return Err(self.illegal("roll back", status)),
            _ => {}
        }
        let resources = self.resources();
        if status == CoordinatorStatus::Active || status == CoordinatorStatus::MarkedRollback {
            for rm in &resources {
                if let Err(e) = rm.end(&self.xid, EndFlag::Fail) {
                    warn!(target: "quarry::xa", xid = %self.xid, rm = %rm.rm_id(), error = %e, "end(FAIL) failed before rollback");
                }
            }
        }
        self.set_status(CoordinatorStatus::RolledBack);
        match self.rollback_resources(&resources) {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn set_rollback_only(&self) {
        let mut inner = self.inner.lock();
        if matches!(
            inner.status,
            CoordinatorStatus::Active | CoordinatorStatus::Suspended
        ) {
            inner.status = CoordinatorStatus::MarkedRollback;
        }
    }

    fn status(&self) -> CoordinatorStatus {
        self.inner.lock().status
    }
}
