//! Error types for Quarry
//!
//! This module defines the error taxonomy shared by every layer:
//! - Protocol violations (wrong control mode, illegal transaction state)
//! - Concurrent cross-thread access to a transaction
//! - Resource failures raised by phase participants
//! - Timeouts and watchdog interrupts
//! - Recovery inconsistencies detected at startup
//!
//! Causes are shared as `Arc<QuarryError>` so that the first failure of a
//! transaction can be attached to every later error raised against it.

use crate::types::TxnId;
use crate::xa::XaError;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for Quarry operations
pub type Result<T> = std::result::Result<T, QuarryError>;

/// Error types for Quarry
#[derive(Debug, Error)]
pub enum QuarryError {
    /// Operation not legal in the current mode or state
    #[error("Protocol violation: {message}")]
    Protocol {
        /// What was attempted
        message: String,
    },

    /// A transaction was driven from a thread other than the one it is bound to.
    ///
    /// The transaction is left untouched.
    #[error("Concurrent access attempted to transaction {txn}: transaction has NOT been rolled back")]
    ConcurrentAccess {
        /// Transaction that was accessed
        txn: TxnId,
    },

    /// Operation attempted on a transaction that has already failed
    #[error("Transaction {txn} has failed: {message}")]
    TransactionFailed {
        /// Failed transaction
        txn: TxnId,
        /// What was attempted
        message: String,
        /// Original rollback cause
        #[source]
        cause: Option<Arc<QuarryError>>,
    },

    /// Surface error of an implicit rollback
    #[error("Transaction rolled back: {message}")]
    RolledBack {
        /// Description of the rollback
        message: String,
        /// What triggered the rollback
        #[source]
        cause: Option<Arc<QuarryError>>,
    },

    /// Surface error of the no-trust abort path
    #[error("Transaction aborted: {message}")]
    Aborted {
        /// Description of the abort
        message: String,
        /// What triggered the abort
        #[source]
        cause: Option<Arc<QuarryError>>,
    },

    /// Failure raised by a phase participant or store
    #[error("Resource error in {resource}: {message}")]
    Resource {
        /// Name of the failing resource
        resource: String,
        /// Failure description
        message: String,
    },

    /// Two-phase commit protocol error
    #[error(transparent)]
    Xa(#[from] XaError),

    /// A blocking acquisition exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The holder of the session mutex was interrupted by a watchdog
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// Startup recovery could not reconcile resource phases
    #[error("Recovery failed: {0}")]
    Recovery(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Broken internal invariant
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QuarryError {
    /// Create a protocol violation
    pub fn protocol(message: impl Into<String>) -> Self {
        QuarryError::Protocol {
            message: message.into(),
        }
    }

    /// Create a resource failure
    pub fn resource(resource: impl Into<String>, message: impl Into<String>) -> Self {
        QuarryError::Resource {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a recovery failure
    pub fn recovery(message: impl Into<String>) -> Self {
        QuarryError::Recovery(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        QuarryError::Internal(message.into())
    }

    /// Create a failed-transaction error carrying the original cause
    pub fn transaction_failed(
        txn: TxnId,
        message: impl Into<String>,
        cause: Option<Arc<QuarryError>>,
    ) -> Self {
        QuarryError::TransactionFailed {
            txn,
            message: message.into(),
            cause,
        }
    }

    /// Create a rolled-back error carrying the rollback trigger
    pub fn rolled_back(message: impl Into<String>, cause: Arc<QuarryError>) -> Self {
        QuarryError::RolledBack {
            message: message.into(),
            cause: Some(cause),
        }
    }

    /// True for protocol and concurrent-access violations
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            QuarryError::Protocol { .. } | QuarryError::ConcurrentAccess { .. }
        )
    }

    /// True when the surfaced error reports that the work was rolled back
    pub fn is_rollback(&self) -> bool {
        match self {
            QuarryError::RolledBack { .. } | QuarryError::Aborted { .. } => true,
            QuarryError::Xa(e) => e.code.is_rollback(),
            _ => false,
        }
    }

    /// True for timeouts and watchdog interrupts
    pub fn is_timeout(&self) -> bool {
        matches!(self, QuarryError::Timeout(_) | QuarryError::Interrupted(_))
    }

    /// The attached cause, if this error wraps one
    pub fn cause(&self) -> Option<&Arc<QuarryError>> {
        match self {
            QuarryError::TransactionFailed { cause, .. }
            | QuarryError::RolledBack { cause, .. }
            | QuarryError::Aborted { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }

    /// Walk the cause chain to the innermost error
    pub fn root_cause(&self) -> &QuarryError {
        let mut current = self;
        while let Some(next) = current.cause() {
            current = next.as_ref();
        }
        current
    }
}

impl From<serde_json::Error> for QuarryError {
    fn from(e: serde_json::Error) -> Self {
        QuarryError::Serialization(e.to_string())
    }
}
