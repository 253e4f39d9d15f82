//! Idle and transaction timeouts
//!
//! A single worker thread watches every registered transaction. A
//! transaction expires when it has been idle longer than its idle timeout
//! or has existed longer than its transaction timeout; expired
//! transactions are rolled back heuristically on a short-lived executor
//! thread so that a slow rollback never delays the other timeouts.
//!
//! A zero timeout disables that check.

use crate::transaction::{Activity, Transaction};
use parking_lot::{Condvar, Mutex, MutexGuard};
use quarry_core::{QuarryError, Result, TxnId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Cause passed to `heuristic_rollback` when a transaction sat idle too long
pub const IDLE_TIMEOUT_CAUSE: &str = "idle-timeout";
/// Cause passed to `heuristic_rollback` when a transaction ran too long
pub const TRANSACTION_TIMEOUT_CAUSE: &str = "transaction-timeout";

struct ReaperTask {
    txn: Weak<dyn Transaction>,
    created: Instant,
    idle_timeout: Duration,
    txn_timeout: Duration,
}

enum Verdict {
    Gone,
    Expired(&'static str),
    CheckAt(Option<Instant>),
}

impl ReaperTask {
    fn judge(&self, txn: &Arc<dyn Transaction>, now: Instant) -> Verdict {
        if txn.is_terminated() {
            return Verdict::Gone;
        }
        let txn_deadline = deadline(self.created, self.txn_timeout);
        if let Some(at) = txn_deadline {
            if now >= at {
                return Verdict::Expired(TRANSACTION_TIMEOUT_CAUSE);
            }
        }
        let idle_deadline = match txn.last_active() {
            // Running operations are checked again one idle period later
            Activity::Active => deadline(now, self.idle_timeout),
            Activity::IdleSince(since) => match deadline(since, self.idle_timeout) {
                Some(at) if now >= at => return Verdict::Expired(IDLE_TIMEOUT_CAUSE),
                other => other,
            },
        };
        Verdict::CheckAt(earliest(txn_deadline, idle_deadline))
    }
}

fn deadline(from: Instant, timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        None
    } else {
        from.checked_add(timeout)
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

struct ReaperInner {
    tasks: Mutex<HashMap<TxnId, ReaperTask>>,
    changed: Condvar,
    generation: AtomicU64,
    shutdown: AtomicBool,
}

/// Background watchdog rolling back timed-out transactions
pub struct TransactionReaper {
    inner: Arc<ReaperInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionReaper {
    /// Start the watchdog thread
    pub fn new() -> Result<Self> {
        let inner = Arc::new(ReaperInner {
            tasks: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
            generation: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });
        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("quarry-reaper".to_string())
            .spawn(move || reaper_loop(&worker_inner))?;
        Ok(TransactionReaper {
            inner,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Watch `txn` until it terminates or is cancelled
    pub fn register(&self, txn: &Arc<dyn Transaction>, idle_timeout: Duration, txn_timeout: Duration) {
        let task = ReaperTask {
            txn: Arc::downgrade(txn),
            created: Instant::now(),
            idle_timeout,
            txn_timeout,
        };
        debug!(target: "quarry::reaper", txn_id = %txn.id(), ?idle_timeout, ?txn_timeout, "Registered transaction");
        {
            let mut tasks = self.inner.tasks.lock();
            tasks.insert(txn.id(), task);
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.inner.changed.notify_all();
    }

    /// Stop watching `txn`
    pub fn cancel(&self, txn: TxnId) -> bool {
        let removed = {
            let mut tasks = self.inner.tasks.lock();
            let removed = tasks.remove(&txn).is_some();
            if removed {
                self.inner.generation.fetch_add(1, Ordering::AcqRel);
            }
            removed
        };
        if removed {
            self.inner.changed.notify_all();
        }
        removed
    }

    /// Number of transactions being watched
    pub fn pending(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Stop the watchdog and join its thread
    ///
    /// Transactions still registered are left alone.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let _tasks = self.inner.tasks.lock();
            self.inner.changed.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            // The last database handle can be released on the reaper thread itself
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!(target: "quarry::reaper", "Reaper thread panicked");
            }
        }
    }
}

impl Drop for TransactionReaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reaper_loop(inner: &ReaperInner) {
    let mut tasks = inner.tasks.lock();
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        let generation = inner.generation.load(Ordering::Acquire);
        let now = Instant::now();
        let mut next = None;
        let mut expired = Vec::new();
        // Upgraded transactions are only dropped once the task map is unlocked
        let mut held = Vec::new();
        tasks.retain(|id, task| {
            let Some(txn) = task.txn.upgrade() else {
                return false;
            };
            let keep = match task.judge(&txn, now) {
                Verdict::Gone => false,
                Verdict::Expired(cause) => {
                    expired.push((*id, Arc::clone(&txn), cause));
                    false
                }
                Verdict::CheckAt(at) => {
                    next = earliest(next, at);
                    true
                }
            };
            held.push(txn);
            keep
        });

        MutexGuard::unlocked(&mut tasks, || {
            for (id, txn, cause) in expired {
                info!(target: "quarry::reaper", txn_id = %id, cause, "Transaction timed out");
                spawn_rollback(txn, cause);
            }
            drop(held);
        });
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        // Registrations made while unlocked were not waited for
        if inner.generation.load(Ordering::Acquire) != generation {
            continue;
        }

        match next {
            Some(at) => {
                inner.changed.wait_until(&mut tasks, at);
            }
            None => inner.changed.wait(&mut tasks),
        }
    }
}

fn spawn_rollback(txn: Arc<dyn Transaction>, cause: &'static str) {
    let id = txn.id();
    let spawned = std::thread::Builder::new()
        .name(format!("{} executor", cause))
        .spawn(move || match txn.heuristic_rollback(cause) {
            Ok(true) => info!(target: "quarry::reaper", txn_id = %id, cause, "Rolled back timed-out transaction"),
            Ok(false) => debug!(target: "quarry::reaper", txn_id = %id, "Transaction already completing"),
            Err(e) => {
                warn!(target: "quarry::reaper", txn_id = %id, error = %e, "Heuristic rollback failed, aborting");
                txn.abort_transaction("Heuristic rollback failed after timeout", Arc::new(e));
            }
        });
    if let Err(e) = spawned {
        error!(target: "quarry::reaper", txn_id = %id, error = %QuarryError::from(e), "Unable to start timeout executor");
    }
}
