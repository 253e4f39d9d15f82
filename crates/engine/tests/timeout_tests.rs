//! Idle and Transaction Timeout Tests
//!
//! The reaper rolls back transactions that sit suspended past their idle
//! timeout or outlive their transaction timeout, and the session sees the
//! failure on its next call.

use quarry_core::QuarryError;
use quarry_engine::{Database, Triple};
use std::thread;
use std::time::{Duration, Instant};
use tracing::Level;

const G: &str = "urn:graph";

fn t(n: usize) -> Triple {
    Triple::new(format!("urn:s{}", n), "urn:p", format!("urn:o{}", n))
}

/// Reaper and rollback decisions are logged; show them when a test fails
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init();
}

fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

// ============================================================================
// Idle Timeout
// ============================================================================

#[test]
fn test_idle_explicit_transaction_fails_session() {
    init_logging();
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    let other = db.new_session().unwrap();

    session.set_idle_timeout(150);
    session.set_autocommit(false).unwrap();
    session.insert(G, &t(1)).unwrap();

    // Blocks on the write lock until the reaper frees it
    let started = Instant::now();
    other.insert(G, &t(9)).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));

    let err = session.count(G).unwrap_err();
    assert!(matches!(err, QuarryError::TransactionFailed { .. }));
    assert!(session.commit().is_err());

    // Back to the default idle timeout before reopening the explicit transaction
    session.set_idle_timeout(0);
    session.rollback().unwrap();
    session.insert(G, &t(2)).unwrap();
    session.commit().unwrap();

    let found = other.find(G, None, None, None).unwrap();
    assert_eq!(found.len(), 2);
    assert!(found.contains(&t(2)));
    assert!(found.contains(&t(9)));
    assert!(!found.contains(&t(1)));
}

#[test]
fn test_running_operation_is_not_idle() {
    init_logging();
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    session.set_idle_timeout(50);

    let inserted = session
        .execute(true, |r| {
            thread::sleep(Duration::from_millis(250));
            r.insert(G, &t(1))
        })
        .unwrap();
    assert!(inserted);
    assert_eq!(session.count(G).unwrap(), 1);
}

#[test]
fn test_idle_read_handle_is_rolled_back() {
    init_logging();
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    session.insert(G, &t(1)).unwrap();

    session.set_idle_timeout(100);
    let handle = session.begin_read().unwrap();
    assert_eq!(handle.execute(|r| r.count(G)).unwrap(), 1);

    assert!(wait_until(Duration::from_secs(5), || handle.is_terminated()));
    assert!(handle.execute(|r| r.count(G)).is_err());
    handle.release().unwrap();

    // The session itself is unaffected
    session.set_idle_timeout(0);
    assert_eq!(session.count(G).unwrap(), 1);
}

#[test]
fn test_idle_timeout_of_read_handle_spares_running_write() {
    init_logging();
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();

    session.set_idle_timeout(100);
    let handle = session.begin_read().unwrap();
    session.set_idle_timeout(0);

    // The reaper comes for the idle handle while this write holds the session
    let inserted = session
        .execute(true, |r| {
            thread::sleep(Duration::from_millis(500));
            r.insert(G, &t(1))
        })
        .unwrap();
    assert!(inserted);

    assert!(wait_until(Duration::from_secs(5), || handle.is_terminated()));
    assert_eq!(session.count(G).unwrap(), 1);
}

#[test]
fn test_idle_timeout_interrupts_write_lock_wait() {
    init_logging();
    let db = Database::open_in_memory().unwrap();
    let writer = db.new_session().unwrap();
    let session = db.new_session().unwrap();

    writer.set_autocommit(false).unwrap();
    writer.insert(G, &t(9)).unwrap();

    session.set_idle_timeout(100);
    let handle = session.begin_read().unwrap();
    session.set_idle_timeout(0);

    let started = Instant::now();
    let blocked = thread::scope(|scope| {
        let waiter = scope.spawn(|| session.insert(G, &t(1)));
        assert!(wait_until(Duration::from_millis(1500), || handle.is_terminated()));
        waiter.join().unwrap()
    });
    let err = blocked.unwrap_err();
    assert!(err.root_cause().is_timeout(), "unexpected error: {}", err);
    assert!(started.elapsed() < Duration::from_secs(5));

    // The writer keeps its lock and commits normally
    writer.commit().unwrap();
    writer.set_autocommit(true).unwrap();
    assert!(session.insert(G, &t(1)).unwrap());
    assert_eq!(session.count(G).unwrap(), 2);
}

// ============================================================================
// Transaction Timeout
// ============================================================================

#[test]
fn test_transaction_timeout_interrupts_running_operation() {
    init_logging();
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    session.set_transaction_timeout(100);

    let err = session
        .execute(true, |r| {
            r.insert(G, &t(1))?;
            thread::sleep(Duration::from_millis(400));
            Ok(())
        })
        .unwrap_err();
    assert!(err.is_rollback(), "unexpected error: {}", err);
    assert!(err.root_cause().is_timeout(), "unexpected cause: {}", err);

    session.set_transaction_timeout(0);
    assert_eq!(session.count(G).unwrap(), 0);

    // The write lock was released with the rolled back transaction
    session.insert(G, &t(2)).unwrap();
    assert_eq!(session.count(G).unwrap(), 1);
}

#[test]
fn test_zero_timeouts_restore_defaults() {
    init_logging();
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    session.set_idle_timeout(1);
    session.set_idle_timeout(0);
    session.set_transaction_timeout(-5);

    session.set_autocommit(false).unwrap();
    session.insert(G, &t(1)).unwrap();
    thread::sleep(Duration::from_millis(100));
    session.commit().unwrap();
    assert_eq!(session.count(G).unwrap(), 1);
}
