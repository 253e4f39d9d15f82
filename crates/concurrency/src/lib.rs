//! Transaction management for Quarry
//!
//! This crate implements the session-level transaction machinery:
//! - SessionMutex: reentrant per-session mutex with watchdog interrupts
//! - WriteLockManager: the database-wide single-writer lock
//! - InternalTransaction / ExternalTransaction: the two transaction kinds
//! - Coordinator / LocalCoordinator: the resource coordinator seam
//! - TransactionReaper: idle and transaction timeouts
//! - OperationContext / Enlister: the seam between transactions and work

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod context;
pub mod coordinator;
pub mod enlistment;
pub mod mutex;
pub mod reaper;
pub mod transaction;
pub mod write_lock;

pub use cleanup::CleanupChain;
pub use context::{Enlister, OperationContext};
pub use coordinator::{
    Coordinator, CoordinatorStatus, CoordinatorTransaction, LocalCoordinator, LocalTransaction,
    LOCAL_FORMAT_ID,
};
pub use enlistment::EnlistmentRegistry;
pub use mutex::{SessionMutex, SessionMutexGuard};
pub use reaper::{TransactionReaper, IDLE_TIMEOUT_CAUSE, TRANSACTION_TIMEOUT_CAUSE};
pub use transaction::{
    fold_rollback_failures, Activity, ExternalHooks, ExternalTransaction, FactoryHooks,
    InternalTransaction, Transaction, TxnState,
};
pub use write_lock::{WriteLockManager, INTERRUPT_POLL};
