//! Transactions
//!
//! Two kinds of transaction share the [`Transaction`] trait:
//!
//! - [`InternalTransaction`]: driven by the session itself (autocommit or
//!   explicit commit/rollback), with activation and reference counting
//! - [`ExternalTransaction`]: driven by an outside transaction manager
//!   through the two-phase commit calls of a coordinator resource
//!
//! Both can be rolled back heuristically from any thread, which is how
//! the timeout reaper and session close tear them down.

mod external;
mod internal;

pub use external::{fold_rollback_failures, ExternalHooks, ExternalTransaction};
pub use internal::{FactoryHooks, InternalTransaction};

use quarry_core::{QuarryError, Result, TxnId};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Internal transaction state
///
/// ```text
/// ConstructedUnref ──reference──▶ ConstructedRef
///        │ activate                     │ activate
///        ▼                              ▼
///    ActUnref ◀──────dereference───── ActRef ──deactivate──▶ DeactRef
///        │ deactivate (last)            ▲                        │
///        ▼                              └──────activate──────────┘
///    Finished                 Failed (implicit rollback / abort)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Created, never activated, no references
    ConstructedUnref,
    /// Created, never activated, referenced
    ConstructedRef,
    /// Active on a thread, no references
    ActUnref,
    /// Active on a thread, referenced
    ActRef,
    /// Suspended, kept alive by references
    DeactRef,
    /// Committed or explicitly rolled back
    Finished,
    /// Rolled back because of a failure
    Failed,
}

impl TxnState {
    /// True for `Finished` and `Failed`
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Finished | TxnState::Failed)
    }

    /// True for `ActUnref` and `ActRef`
    pub fn is_active(self) -> bool {
        matches!(self, TxnState::ActUnref | TxnState::ActRef)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Whether a transaction is currently doing work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// An operation is running inside the transaction
    Active,
    /// No operation has run since this instant
    IdleSince(Instant),
}

/// Operations every transaction supports, whichever side drives it
pub trait Transaction: Send + Sync {
    /// Transaction identifier
    fn id(&self) -> TxnId;

    /// Roll back from any thread
    ///
    /// Returns `Ok(false)` if there was nothing to do: the transaction had
    /// already terminated, or its owner was already completing it.
    fn heuristic_rollback(&self, cause: &str) -> Result<bool>;

    /// Tear down without trusting the coordinator; never fails
    ///
    /// Returns the error to surface to the caller.
    fn abort_transaction(&self, message: &str, cause: Arc<QuarryError>) -> QuarryError;

    /// Keep the transaction alive across suspension
    fn reference(&self) -> Result<()>;

    /// Drop a reference taken by `reference`
    fn dereference(&self) -> Result<()>;

    /// Run `op` inside the transaction
    fn execute(&self, op: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    /// Current activity, read by the timeout reaper
    fn last_active(&self) -> Activity;

    /// True once the transaction can no longer do work
    fn is_terminated(&self) -> bool;
}
