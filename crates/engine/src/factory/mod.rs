//! Transaction factories
//!
//! A session hands out transactions through exactly one factory:
//!
//! - [`InternalFactory`]: autocommit plus explicit commit/rollback calls
//! - [`ExternalFactory`]: transactions demarcated by an outside
//!   transaction manager through the session's coordinator resource
//!
//! Both serialize writers through the database write lock and register
//! every transaction with the timeout reaper.

mod external;
mod internal;

pub use external::ExternalFactory;
pub use internal::InternalFactory;

use crate::context::DatabaseOperationContext;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A transaction together with the context it operates through
pub struct Bound<T> {
    /// The transaction
    pub txn: Arc<T>,
    /// Its operation context
    pub context: Arc<DatabaseOperationContext>,
}

impl<T> Clone for Bound<T> {
    fn clone(&self) -> Self {
        Bound {
            txn: Arc::clone(&self.txn),
            context: Arc::clone(&self.context),
        }
    }
}

/// Idle and transaction timeouts of one session
///
/// A value of zero or less passed to a setter restores the database default.
#[derive(Debug)]
pub struct SessionTimeouts {
    idle_ms: AtomicU64,
    transaction_ms: AtomicU64,
    default_idle_ms: u64,
    default_transaction_ms: u64,
}

impl SessionTimeouts {
    /// Timeouts starting at the database defaults
    pub fn new(default_idle_ms: u64, default_transaction_ms: u64) -> Self {
        SessionTimeouts {
            idle_ms: AtomicU64::new(default_idle_ms),
            transaction_ms: AtomicU64::new(default_transaction_ms),
            default_idle_ms,
            default_transaction_ms,
        }
    }

    /// Set the idle timeout in milliseconds
    pub fn set_idle_timeout(&self, ms: i64) {
        let ms = if ms > 0 { ms as u64 } else { self.default_idle_ms };
        self.idle_ms.store(ms, Ordering::Relaxed);
    }

    /// Set the transaction timeout in milliseconds
    pub fn set_transaction_timeout(&self, ms: i64) {
        let ms = if ms > 0 {
            ms as u64
        } else {
            self.default_transaction_ms
        };
        self.transaction_ms.store(ms, Ordering::Relaxed);
    }

    /// Current idle timeout
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_ms.load(Ordering::Relaxed))
    }

    /// Current transaction timeout
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_ms.load(Ordering::Relaxed))
    }

    /// Latest instant a writer may wait for the write lock until
    pub fn write_deadline(&self) -> Option<Instant> {
        Instant::now().checked_add(self.transaction_timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_positive_values_restore_defaults() {
        let timeouts = SessionTimeouts::new(1_000, 5_000);
        timeouts.set_idle_timeout(250);
        timeouts.set_transaction_timeout(750);
        assert_eq!(timeouts.idle_timeout(), Duration::from_millis(250));
        assert_eq!(timeouts.transaction_timeout(), Duration::from_millis(750));

        timeouts.set_idle_timeout(0);
        timeouts.set_transaction_timeout(-3);
        assert_eq!(timeouts.idle_timeout(), Duration::from_millis(1_000));
        assert_eq!(timeouts.transaction_timeout(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_write_deadline_tracks_transaction_timeout() {
        let timeouts = SessionTimeouts::new(1_000, 60_000);
        let deadline = timeouts.write_deadline().unwrap();
        assert!(deadline > Instant::now() + Duration::from_secs(59));
    }
}
