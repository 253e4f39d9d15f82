//! Externally Managed Session Tests
//!
//! Drives sessions through their coordinator resource handles the way an
//! outside transaction manager would: start/end association, one and two
//! phase commit, rollback, error codes and heuristic outcomes.

use quarry_core::{EndFlag, ResourceManager, StartFlag, Vote, XaCode, Xid};
use quarry_engine::{Database, Triple};
use std::sync::Arc;

const G: &str = "urn:graph";
const FORMAT: i32 = 0x4a54;

fn t(n: usize) -> Triple {
    Triple::new(format!("urn:s{}", n), "urn:p", format!("urn:o{}", n))
}

fn committed_count(db: &Arc<Database>) -> usize {
    db.new_session().unwrap().count(G).unwrap()
}

// ============================================================================
// Commit and Rollback
// ============================================================================

#[test]
fn test_two_phase_commit() {
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    let rm = session.get_write_resource().unwrap();
    let xid = Xid::generate(FORMAT);

    rm.start(&xid, StartFlag::NoFlags).unwrap();
    session.insert(G, &t(1)).unwrap();
    session.insert(G, &t(2)).unwrap();
    assert_eq!(session.count(G).unwrap(), 2);
    rm.end(&xid, EndFlag::Success).unwrap();

    assert_eq!(committed_count(&db), 0);
    assert_eq!(rm.prepare(&xid).unwrap(), Vote::Ok);
    rm.commit(&xid, false).unwrap();
    assert_eq!(committed_count(&db), 2);

    // Completed branches are forgotten
    assert_eq!(rm.commit(&xid, false).unwrap_err().code, XaCode::NotA);
}

#[test]
fn test_one_phase_commit() {
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    let rm = session.get_write_resource().unwrap();
    let xid = Xid::generate(FORMAT);

    rm.start(&xid, StartFlag::NoFlags).unwrap();
    session.insert(G, &t(1)).unwrap();
    rm.end(&xid, EndFlag::Success).unwrap();
    rm.commit(&xid, true).unwrap();
    assert_eq!(committed_count(&db), 1);
}

#[test]
fn test_commit_without_prepare_is_protocol_error() {
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    let rm = session.get_write_resource().unwrap();
    let xid = Xid::generate(FORMAT);

    rm.start(&xid, StartFlag::NoFlags).unwrap();
    session.insert(G, &t(1)).unwrap();
    rm.end(&xid, EndFlag::Success).unwrap();
    assert_eq!(rm.commit(&xid, false).unwrap_err().code, XaCode::Proto);
    rm.rollback(&xid).unwrap();
    assert_eq!(committed_count(&db), 0);
}

#[test]
fn test_rollback_discards_branch() {
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    let rm = session.get_write_resource().unwrap();
    let xid = Xid::generate(FORMAT);

    rm.start(&xid, StartFlag::NoFlags).unwrap();
    session.insert(G, &t(1)).unwrap();
    rm.end(&xid, EndFlag::Success).unwrap();
    rm.rollback(&xid).unwrap();
    assert_eq!(committed_count(&db), 0);

    // The write lock is free again
    let xid2 = Xid::generate(FORMAT);
    rm.start(&xid2, StartFlag::NoFlags).unwrap();
    session.insert(G, &t(2)).unwrap();
    rm.end(&xid2, EndFlag::Success).unwrap();
    rm.commit(&xid2, true).unwrap();
    assert_eq!(committed_count(&db), 1);
}

#[test]
fn test_end_fail_rolls_back() {
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    let rm = session.get_write_resource().unwrap();
    let xid = Xid::generate(FORMAT);

    rm.start(&xid, StartFlag::NoFlags).unwrap();
    session.insert(G, &t(1)).unwrap();
    rm.end(&xid, EndFlag::Fail).unwrap();
    assert_eq!(rm.prepare(&xid).unwrap_err().code, XaCode::RbRollback);
    rm.rollback(&xid).unwrap();
    assert_eq!(committed_count(&db), 0);
}

// ============================================================================
// Association
// ============================================================================

#[test]
fn test_suspend_and_resume() {
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    let rm = session.get_write_resource().unwrap();
    let xid = Xid::generate(FORMAT);

    rm.start(&xid, StartFlag::NoFlags).unwrap();
    session.insert(G, &t(1)).unwrap();
    rm.end(&xid, EndFlag::Suspend).unwrap();

    // Nothing associated while suspended
    assert!(session.count(G).unwrap_err().is_protocol());

    rm.start(&xid, StartFlag::Resume).unwrap();
    session.insert(G, &t(2)).unwrap();
    rm.end(&xid, EndFlag::Success).unwrap();
    rm.commit(&xid, true).unwrap();
    assert_eq!(committed_count(&db), 2);
}

#[test]
fn test_join_requires_same_branch() {
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    let rm = session.get_write_resource().unwrap();
    let xid = Xid::generate(FORMAT);
    let other = Xid::generate(FORMAT);

    assert_eq!(rm.start(&xid, StartFlag::Join).unwrap_err().code, XaCode::NotA);
    rm.start(&xid, StartFlag::NoFlags).unwrap();
    rm.start(&xid, StartFlag::Join).unwrap();
    assert_eq!(rm.start(&other, StartFlag::Join).unwrap_err().code, XaCode::Outside);
    rm.end(&xid, EndFlag::Success).unwrap();
    rm.rollback(&xid).unwrap();
}

#[test]
fn test_start_error_codes() {
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    let rm = session.get_write_resource().unwrap();
    let xid = Xid::generate(FORMAT);

    rm.start(&xid, StartFlag::NoFlags).unwrap();
    let other = Xid::generate(FORMAT);
    assert_eq!(
        rm.start(&other, StartFlag::NoFlags).unwrap_err().code,
        XaCode::RbDeadlock
    );
    rm.end(&xid, EndFlag::Suspend).unwrap();
    assert_eq!(rm.start(&xid, StartFlag::NoFlags).unwrap_err().code, XaCode::DupId);
    assert_eq!(rm.start(&other, StartFlag::Resume).unwrap_err().code, XaCode::NotA);
    rm.rollback(&xid).unwrap();
}

#[test]
fn test_unknown_branch_is_nota() {
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    let rm = session.get_read_resource().unwrap();
    let xid = Xid::generate(FORMAT);

    assert_eq!(rm.end(&xid, EndFlag::Success).unwrap_err().code, XaCode::NotA);
    assert_eq!(rm.prepare(&xid).unwrap_err().code, XaCode::NotA);
    assert_eq!(rm.commit(&xid, true).unwrap_err().code, XaCode::NotA);
    assert_eq!(rm.rollback(&xid).unwrap_err().code, XaCode::NotA);
    assert_eq!(rm.forget(&xid).unwrap_err().code, XaCode::NotA);
    assert!(rm.recover().unwrap().is_empty());
}

#[test]
fn test_read_branch_cannot_write() {
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    let rm = session.get_read_resource().unwrap();
    let xid = Xid::generate(FORMAT);

    rm.start(&xid, StartFlag::NoFlags).unwrap();
    assert_eq!(session.count(G).unwrap(), 0);
    assert!(session.insert(G, &t(1)).unwrap_err().is_protocol());
    rm.end(&xid, EndFlag::Success).unwrap();
    rm.rollback(&xid).unwrap();
}

#[test]
fn test_handles_of_one_session_share_resource_manager() {
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    let other = db.new_session().unwrap();

    let write = session.get_write_resource().unwrap();
    let read = session.get_read_resource().unwrap();
    let foreign = other.get_write_resource().unwrap();
    assert!(write.is_write());
    assert!(!read.is_write());
    assert!(write.is_same_rm(&read));
    assert!(!write.is_same_rm(&foreign));
}

#[test]
fn test_external_session_rejects_internal_control() {
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    session.get_write_resource().unwrap();
    assert!(session.set_autocommit(false).unwrap_err().is_protocol());
    assert!(session.rollback().unwrap_err().is_protocol());
    // No branch is associated to hand out
    assert!(session.begin_write().err().unwrap().is_protocol());
}

// ============================================================================
// Timeouts and Heuristic Outcomes
// ============================================================================

#[test]
fn test_transaction_timeout_seconds() {
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    let rm = session.get_write_resource().unwrap();

    assert_eq!(rm.transaction_timeout(), 3_600);
    assert!(rm.set_transaction_timeout(30).unwrap());
    assert_eq!(rm.transaction_timeout(), 30);
    assert_eq!(rm.set_transaction_timeout(-1).unwrap_err().code, XaCode::Inval);
    assert!(rm.set_transaction_timeout(0).unwrap());
    assert_eq!(rm.transaction_timeout(), 3_600);
}

#[test]
fn test_second_write_branch_times_out_waiting() {
    let db = Database::open_in_memory().unwrap();
    let first = db.new_session().unwrap();
    let second = db.new_session().unwrap();
    let rm1 = first.get_write_resource().unwrap();
    let rm2 = second.get_write_resource().unwrap();

    let xid1 = Xid::generate(FORMAT);
    rm1.start(&xid1, StartFlag::NoFlags).unwrap();

    second.set_transaction_timeout(100);
    let xid2 = Xid::generate(FORMAT);
    assert_eq!(rm2.start(&xid2, StartFlag::NoFlags).unwrap_err().code, XaCode::RmFail);

    rm1.end(&xid1, EndFlag::Success).unwrap();
    rm1.commit(&xid1, true).unwrap();
    second.set_transaction_timeout(0);
    rm2.start(&xid2, StartFlag::NoFlags).unwrap();
    rm2.end(&xid2, EndFlag::Success).unwrap();
    rm2.rollback(&xid2).unwrap();
}

#[test]
fn test_idle_branch_is_heuristically_rolled_back() {
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    let rm = session.get_write_resource().unwrap();
    session.set_idle_timeout(200);
    let xid = Xid::generate(FORMAT);

    rm.start(&xid, StartFlag::NoFlags).unwrap();
    session.insert(G, &t(1)).unwrap();
    rm.end(&xid, EndFlag::Suspend).unwrap();

    // Blocks until the watchdog rolls the idle branch back and frees the lock
    let other = db.new_session().unwrap();
    other.set_transaction_timeout(10_000);
    other.insert(G, &t(2)).unwrap();

    assert_eq!(rm.prepare(&xid).unwrap_err().code, XaCode::HeurRb);
    assert_eq!(rm.commit(&xid, false).unwrap_err().code, XaCode::HeurRb);
    assert_eq!(rm.rollback(&xid).unwrap_err().code, XaCode::HeurRb);
    rm.forget(&xid).unwrap();
    assert_eq!(rm.prepare(&xid).unwrap_err().code, XaCode::NotA);

    assert_eq!(other.find(G, None, None, None).unwrap(), vec![t(2)]);
}

#[test]
fn test_forget_of_live_branch_aborts_it() {
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    let rm = session.get_write_resource().unwrap();
    let xid = Xid::generate(FORMAT);

    rm.start(&xid, StartFlag::NoFlags).unwrap();
    session.insert(G, &t(1)).unwrap();
    rm.end(&xid, EndFlag::Suspend).unwrap();
    rm.forget(&xid).unwrap();
    assert_eq!(rm.prepare(&xid).unwrap_err().code, XaCode::NotA);

    let other = db.new_session().unwrap();
    other.set_transaction_timeout(1_000);
    other.insert(G, &t(2)).unwrap();
    assert_eq!(committed_count(&db), 1);
}

#[test]
fn test_close_rolls_back_open_branches() {
    let db = Database::open_in_memory().unwrap();
    let session = db.new_session().unwrap();
    let rm = session.get_write_resource().unwrap();
    let xid = Xid::generate(FORMAT);

    rm.start(&xid, StartFlag::NoFlags).unwrap();
    session.insert(G, &t(1)).unwrap();
    session.close().unwrap();

    assert_eq!(committed_count(&db), 0);
    let other = db.new_session().unwrap();
    other.set_transaction_timeout(1_000);
    other.insert(G, &t(2)).unwrap();
}
