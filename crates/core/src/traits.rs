//! Seam traits between the transaction layer and the resources it drives
//!
//! - [`PhaseResource`]: the phase protocol every persistent participant follows
//! - [`RecoveryHandler`]: per-store hooks used by startup recovery
//! - [`ResourceManager`]: a two-phase capable handle a coordinator enlists
//! - [`Enlistable`]: what a transaction records when a participant joins it

use crate::error::Result;
use crate::types::{Phase, ResourceId};
use crate::xa::{EndFlag, StartFlag, Vote, XaError, Xid};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Phase protocol implemented by persistent participants
///
/// A working phase is obtained by `refresh`, made durable by `prepare`,
/// published by `commit` (or discarded by `rollback`) and finally closed
/// by `release`.
pub trait PhaseResource: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Join a fresh working phase derived from the last committed phase
    fn refresh(&self) -> Result<()>;

    /// Make the working phase durable without publishing it
    fn prepare(&self) -> Result<()>;

    /// Publish the prepared working phase
    fn commit(&self) -> Result<()>;

    /// Discard the working phase
    fn rollback(&self) -> Result<()>;

    /// Drop transient state tied to the closed phase
    fn release(&self) -> Result<()>;
}

/// Recovery boundary of a persistent store
pub trait RecoveryHandler: Send + Sync {
    /// Name used in recovery diagnostics
    fn name(&self) -> &str;

    /// Phases this store can still roll forward to
    fn recoverable_phases(&self) -> Result<BTreeSet<Phase>>;

    /// Roll forward to exactly `phase`, discarding anything later
    fn select_phase(&self, phase: Phase) -> Result<()>;

    /// Reset to the initial empty phase
    fn clear(&self) -> Result<()>;
}

/// Two-phase commit capable resource manager handle
pub trait ResourceManager: Send + Sync {
    /// Identity used by `is_same_rm`
    fn rm_id(&self) -> ResourceId;

    /// Associate work with a transaction branch
    fn start(&self, xid: &Xid, flag: StartFlag) -> std::result::Result<(), XaError>;

    /// Dissociate work from a transaction branch
    fn end(&self, xid: &Xid, flag: EndFlag) -> std::result::Result<(), XaError>;

    /// First phase of two-phase commit
    fn prepare(&self, xid: &Xid) -> std::result::Result<Vote, XaError>;

    /// Second phase, or a one-phase commit when `one_phase` is set
    fn commit(&self, xid: &Xid, one_phase: bool) -> std::result::Result<(), XaError>;

    /// Roll back a branch
    fn rollback(&self, xid: &Xid) -> std::result::Result<(), XaError>;

    /// Forget a heuristically completed branch
    fn forget(&self, xid: &Xid) -> std::result::Result<(), XaError>;

    /// Branches that are prepared but not completed
    fn recover(&self) -> std::result::Result<Vec<Xid>, XaError> {
        Ok(Vec::new())
    }

    /// True if `other` is a handle onto the same resource manager
    fn is_same_rm(&self, other: &dyn ResourceManager) -> bool {
        self.rm_id() == other.rm_id()
    }
}

/// A participant that can be enlisted into a transaction
pub trait Enlistable: Send + Sync {
    /// Identity used to make enlistment idempotent
    fn resource_id(&self) -> ResourceId;

    /// Handle joined to the coordinator transaction
    fn resource_manager(&self) -> Arc<dyn ResourceManager>;

    /// Emergency cleanup when the coordinator cannot be trusted
    fn abort(&self) -> Result<()>;
}
