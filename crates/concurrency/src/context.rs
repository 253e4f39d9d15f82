//! Seam between a transaction and the work running inside it
//!
//! An [`OperationContext`] owns the resources a session touches while a
//! transaction is active. On activation the transaction hands itself to
//! the context as an [`Enlister`], and the context enlists whatever it
//! needs; on completion the transaction clears the context.

use quarry_core::{Enlistable, Result, TxnId};
use std::sync::Arc;

/// Something participants can be enlisted into
pub trait Enlister: Send + Sync {
    /// Enlist `enlistable`; enlisting the same participant twice is a no-op
    fn enlist(&self, enlistable: Arc<dyn Enlistable>) -> Result<()>;

    /// Transaction participants are enlisted into
    fn transaction_id(&self) -> TxnId;
}

/// Per-transaction resource holder
pub trait OperationContext: Send + Sync {
    /// Bind to a freshly activated transaction
    fn initiate(&self, txn: Arc<dyn Enlister>) -> Result<()>;

    /// Release everything obtained since `initiate`
    fn clear(&self);
}
