//! Transaction driven by an outside transaction manager
//!
//! The outside manager owns the transaction boundaries: it calls
//! `prepare`, `commit` and `rollback` through the session's coordinator
//! resource. Each session operation in between activates the enlisted
//! resources (`start`), runs, and suspends them again (`end(SUSPEND)`).
//!
//! References are not counted; the outside manager keeps the transaction
//! alive until it completes it.

use super::{Activity, Transaction};
use crate::cleanup::CleanupChain;
use crate::context::{Enlister, OperationContext};
use crate::mutex::{SessionMutex, SessionMutexGuard};
use parking_lot::Mutex;
use quarry_core::{
    EndFlag, Enlistable, QuarryError, ResourceId, ResourceManager, Result, StartFlag, TxnId,
    Vote, XaCode, XaError, Xid,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Callbacks from an external transaction into its factory
pub trait ExternalHooks: Send + Sync {
    /// The owning session's mutex
    fn mutex(&self) -> &SessionMutex;

    /// `txn` has completed, successfully or not
    fn transaction_complete(&self, txn: &ExternalTransaction, cause: Option<&str>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceState {
    Idle,
    Active,
    Suspended,
    Finished,
}

struct Entry {
    id: ResourceId,
    enlistable: Arc<dyn Enlistable>,
    rm: Arc<dyn ResourceManager>,
}

struct ExtInner {
    enlisted: Vec<Entry>,
    started: Vec<ResourceId>,
    need_rollback: HashSet<ResourceId>,
    prepared: HashSet<ResourceId>,
    committed: HashSet<ResourceId>,
    rolled_back: HashSet<ResourceId>,
    res_state: ResourceState,
    inuse: i32,
    heuristic: bool,
    heuristic_code: Option<XaCode>,
    rollback: bool,
    completed: bool,
    rollback_cause: Option<String>,
    activity: Activity,
}

impl ExtInner {
    fn rm(&self, id: ResourceId) -> Option<Arc<dyn ResourceManager>> {
        self.enlisted
            .iter()
            .find(|e| e.id == id)
            .map(|e| Arc::clone(&e.rm))
    }

    fn rms(&self, ids: &[ResourceId]) -> Vec<(ResourceId, Arc<dyn ResourceManager>)> {
        ids.iter()
            .filter_map(|id| self.rm(*id).map(|rm| (*id, rm)))
            .collect()
    }

    fn unstart(&mut self, id: ResourceId) {
        self.started.retain(|s| *s != id);
    }
}

/// A transaction bound to an externally supplied xid
pub struct ExternalTransaction {
    id: TxnId,
    xid: Xid,
    write: bool,
    me: Weak<ExternalTransaction>,
    hooks: Arc<dyn ExternalHooks>,
    context: Arc<dyn OperationContext>,
    inner: Mutex<ExtInner>,
    in_completion: AtomicBool,
}

impl ExternalTransaction {
    /// Create a transaction for `xid` and bind `context` to it
    pub fn new(
        hooks: Arc<dyn ExternalHooks>,
        context: Arc<dyn OperationContext>,
        xid: Xid,
        write: bool,
    ) -> Result<Arc<Self>> {
        let txn = Arc::new_cyclic(|me| ExternalTransaction {
            id: TxnId::next(),
            xid,
            write,
            me: me.clone(),
            hooks,
            context,
            inner: Mutex::new(ExtInner {
                enlisted: Vec::new(),
                started: Vec::new(),
                need_rollback: HashSet::new(),
                prepared: HashSet::new(),
                committed: HashSet::new(),
                rolled_back: HashSet::new(),
                res_state: ResourceState::Idle,
                inuse: 0,
                heuristic: false,
                heuristic_code: None,
                rollback: false,
                completed: false,
                rollback_cause: None,
                activity: Activity::IdleSince(Instant::now()),
            }),
            in_completion: AtomicBool::new(false),
        });
        debug!(target: "quarry::xa", txn_id = %txn.id, xid = %txn.xid, write, "Created external transaction");
        txn.context.initiate(Arc::clone(&txn) as Arc<dyn Enlister>)?;
        Ok(txn)
    }

    /// Branch this transaction is bound to
    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    /// True for write transactions
    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Operation context bound to this transaction
    pub fn context(&self) -> &Arc<dyn OperationContext> {
        &self.context
    }

    /// True once rolled back from the timeout or close path
    pub fn is_heuristically_rolled_back(&self) -> bool {
        self.inner.lock().heuristic
    }

    /// Heuristic outcome to report to the outside manager
    pub fn heuristic_code(&self) -> Option<XaCode> {
        self.inner.lock().heuristic_code
    }

    /// True once `rollback` has run
    pub fn is_rolled_back(&self) -> bool {
        self.inner.lock().rollback
    }

    /// True once committed, rolled back or aborted
    pub fn is_completed(&self) -> bool {
        self.inner.lock().completed
    }

    /// Why the transaction was rolled back
    pub fn rollback_cause(&self) -> Option<String> {
        self.inner.lock().rollback_cause.clone()
    }

    fn acquire(&self, completing: bool) -> SessionMutexGuard<'_> {
        self.hooks.mutex().lock_then(|| {
            self.in_completion.store(completing, Ordering::SeqCst);
        })
    }

    fn check_active(&self) -> Result<()> {
        let inner = self.inner.lock();
        let reason = inner.rollback_cause.clone().unwrap_or_default();
        if inner.heuristic {
            return Err(QuarryError::transaction_failed(
                self.id,
                format!("transaction was heuristically rolled back: {}", reason),
                None,
            ));
        }
        if inner.rollback {
            return Err(QuarryError::transaction_failed(
                self.id,
                format!("transaction was rolled back: {}", reason),
                None,
            ));
        }
        if inner.completed {
            return Err(QuarryError::protocol(format!(
                "transaction {} has been completed",
                self.id
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Session-side operations
    // ========================================================================

    /// Run `op` with every enlisted resource associated with the branch
    ///
    /// A failure rolls the transaction back heuristically; the outside
    /// manager learns of it on its next call.
    pub fn execute_with<R>(&self, op: impl FnOnce() -> Result<R>) -> Result<R> {
        let _guard = self.acquire(false);
        self.check_active()?;
        match self.run_active(op) {
            Ok(value) => Ok(value),
            Err(e) => {
                let cause = Arc::new(e);
                warn!(target: "quarry::xa", txn_id = %self.id, error = %cause, "Operation failed, rolling back");
                if let Err(rollback) = self.heuristic(&cause.to_string()) {
                    error!(target: "quarry::xa", txn_id = %self.id, error = %rollback, "Rollback after operation failure failed");
                }
                Err(QuarryError::rolled_back("operation failed", cause))
            }
        }
    }

    fn run_active<R>(&self, op: impl FnOnce() -> Result<R>) -> Result<R> {
        self.activate_resources()?;
        let previous = std::mem::replace(&mut self.inner.lock().activity, Activity::Active);
        let mut result = op();
        if result.is_ok() && self.hooks.mutex().take_interrupt(self.id) {
            result = Err(QuarryError::Interrupted(format!(
                "{} interrupted during operation",
                self.id
            )));
        }
        self.inner.lock().activity = match previous {
            Activity::Active => Activity::Active,
            Activity::IdleSince(_) => Activity::IdleSince(Instant::now()),
        };
        let deactivated = self.deactivate_resources();
        match (result, deactivated) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(secondary)) => {
                error!(target: "quarry::xa", txn_id = %self.id, error = %secondary, "Failed to suspend resources after operation failure");
                Err(e)
            }
        }
    }

    fn activate_resources(&self) -> Result<()> {
        let (was_started, targets) = {
            let mut inner = self.inner.lock();
            match inner.res_state {
                ResourceState::Active => {
                    inner.inuse += 1;
                    return Ok(());
                }
                ResourceState::Finished => {
                    return Err(QuarryError::protocol(format!(
                        "resources of {} already finished",
                        self.id
                    )))
                }
                ResourceState::Idle | ResourceState::Suspended => {}
            }
            let was_started = inner.res_state == ResourceState::Suspended;
            inner.res_state = ResourceState::Active;
            let ids: Vec<ResourceId> = if was_started {
                inner.started.clone()
            } else {
                inner.enlisted.iter().map(|e| e.id).collect()
            };
            (was_started, inner.rms(&ids))
        };

        let flag = if was_started {
            StartFlag::Resume
        } else {
            StartFlag::NoFlags
        };
        for (i, (id, rm)) in targets.iter().enumerate() {
            match rm.start(&self.xid, flag) {
                Ok(()) => {
                    if !was_started {
                        self.inner.lock().started.push(*id);
                    }
                }
                Err(e) => {
                    {
                        let mut inner = self.inner.lock();
                        inner.unstart(*id);
                        if e.code.is_rollback() {
                            inner.need_rollback.insert(*id);
                        }
                    }
                    let undo = if was_started {
                        EndFlag::Suspend
                    } else {
                        EndFlag::Fail
                    };
                    for (prior, rm) in &targets[..i] {
                        if let Err(e2) = rm.end(&self.xid, undo) {
                            error!(target: "quarry::xa", txn_id = %self.id, rm = %prior, error = %e2, "Error ending resource after start failure");
                        }
                    }
                    self.inner.lock().res_state = if was_started {
                        ResourceState::Suspended
                    } else {
                        ResourceState::Finished
                    };
                    return Err(e.into());
                }
            }
        }
        self.inner.lock().inuse = 1;
        Ok(())
    }

    fn deactivate_resources(&self) -> std::result::Result<(), XaError> {
        let targets = {
            let mut inner = self.inner.lock();
            if inner.res_state == ResourceState::Finished {
                return Ok(());
            }
            inner.inuse -= 1;
            if inner.inuse > 0 {
                return Ok(());
            }
            let started = inner.started.clone();
            inner.rms(&started)
        };
        let result = self.end_each(&targets, EndFlag::Suspend);
        self.inner.lock().res_state = ResourceState::Suspended;
        result
    }

    fn end_resources(&self, success: bool) -> std::result::Result<(), XaError> {
        let targets = {
            let inner = self.inner.lock();
            if !matches!(
                inner.res_state,
                ResourceState::Active | ResourceState::Suspended
            ) {
                return Ok(());
            }
            let started = inner.started.clone();
            inner.rms(&started)
        };
        let flag = if success {
            EndFlag::Success
        } else {
            EndFlag::Fail
        };
        let result = self.end_each(&targets, flag);
        self.inner.lock().res_state = ResourceState::Finished;
        result
    }

    fn end_each(
        &self,
        targets: &[(ResourceId, Arc<dyn ResourceManager>)],
        flag: EndFlag,
    ) -> std::result::Result<(), XaError> {
        let mut first = None;
        for (id, rm) in targets {
            if let Err(e) = rm.end(&self.xid, flag) {
                {
                    let mut inner = self.inner.lock();
                    inner.unstart(*id);
                    if e.code.is_rollback() {
                        inner.need_rollback.insert(*id);
                    }
                }
                if first.is_some() {
                    error!(target: "quarry::xa", txn_id = %self.id, rm = %id, error = %e, "Error ending resource");
                } else {
                    first = Some(e);
                }
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Join `enlistable` to the branch
    ///
    /// Resources enlisted while the branch is active are started at once;
    /// while suspended they are started and immediately suspended.
    pub fn enlist(&self, enlistable: Arc<dyn Enlistable>) -> Result<()> {
        let _guard = self.acquire(false);
        let rm = enlistable.resource_manager();
        let id = enlistable.resource_id();
        let state = {
            let mut inner = self.inner.lock();
            if inner
                .enlisted
                .iter()
                .any(|e| e.id == id || e.rm.is_same_rm(rm.as_ref()))
            {
                return Ok(());
            }
            inner.enlisted.push(Entry {
                id,
                enlistable,
                rm: Arc::clone(&rm),
            });
            inner.res_state
        };

        let joined = match state {
            ResourceState::Active => rm.start(&self.xid, StartFlag::NoFlags),
            ResourceState::Suspended => rm
                .start(&self.xid, StartFlag::NoFlags)
                .and_then(|()| rm.end(&self.xid, EndFlag::Suspend)),
            ResourceState::Idle | ResourceState::Finished => return Ok(()),
        };
        match joined {
            Ok(()) => {
                self.inner.lock().started.push(id);
                Ok(())
            }
            Err(e) => {
                if e.code.is_rollback() {
                    self.inner.lock().need_rollback.insert(id);
                }
                Err(QuarryError::resource(
                    id.to_string(),
                    format!("failed to enlist resource: {}", e),
                ))
            }
        }
    }

    // ========================================================================
    // Coordinator-side operations
    // ========================================================================

    /// End every resource successfully and ask each to prepare
    pub fn prepare(&self) -> std::result::Result<(), XaError> {
        let _guard = self.acquire(true);
        info!(target: "quarry::xa", txn_id = %self.id, xid = %self.xid, "prepare");
        let previous = std::mem::replace(&mut self.inner.lock().activity, Activity::Active);
        self.end_resources(true)?;
        let targets = {
            let inner = self.inner.lock();
            let started = inner.started.clone();
            inner.rms(&started)
        };
        for (id, rm) in targets {
            match rm.prepare(&self.xid) {
                Ok(Vote::Ok) => {
                    self.inner.lock().prepared.insert(id);
                }
                Ok(Vote::ReadOnly) => self.inner.lock().unstart(id),
                Err(e) => {
                    if e.code.is_rollback() {
                        self.inner.lock().unstart(id);
                    }
                    return Err(e);
                }
            }
        }
        if let Activity::IdleSince(_) = previous {
            self.inner.lock().activity = Activity::IdleSince(Instant::now());
        }
        Ok(())
    }

    /// Commit every prepared resource and complete
    pub fn commit(&self) -> std::result::Result<(), XaError> {
        let _guard = self.acquire(true);
        info!(target: "quarry::xa", txn_id = %self.id, xid = %self.xid, "commit");
        let targets = {
            let mut inner = self.inner.lock();
            inner.activity = Activity::Active;
            if inner.started.iter().any(|id| !inner.prepared.contains(id)) {
                return Err(XaError::new(
                    XaCode::Proto,
                    format!("commit of unprepared branch {}", self.xid),
                ));
            }
            let prepared = inner.started.clone();
            inner.rms(&prepared)
        };
        for (id, rm) in targets {
            rm.commit(&self.xid, false)?;
            self.inner.lock().committed.insert(id);
        }
        self.cleanup()
    }

    /// Roll back every started resource and complete
    ///
    /// Rollback failures are folded into a heuristic outcome code.
    pub fn rollback(&self) -> std::result::Result<(), XaError> {
        let _guard = self.acquire(true);
        info!(target: "quarry::xa", txn_id = %self.id, xid = %self.xid, "rollback");
        let result = self.rollback_resources();
        let cleaned = self.cleanup();
        result.and(cleaned)
    }

    fn rollback_resources(&self) -> std::result::Result<(), XaError> {
        {
            let mut inner = self.inner.lock();
            inner.activity = Activity::Active;
            inner.rollback = true;
        }
        if let Err(e) = self.end_resources(false) {
            error!(target: "quarry::xa", txn_id = %self.id, error = %e, "Error ending resources, attempting rollback anyway");
        }
        let targets = {
            let mut inner = self.inner.lock();
            let extra: Vec<ResourceId> = inner
                .need_rollback
                .iter()
                .copied()
                .filter(|id| !inner.started.contains(id))
                .collect();
            inner.started.extend(extra);
            let pending: Vec<ResourceId> = inner
                .started
                .iter()
                .copied()
                .filter(|id| !inner.committed.contains(id))
                .collect();
            inner.rms(&pending)
        };

        let mut failures = Vec::new();
        for (id, rm) in targets {
            match rm.rollback(&self.xid) {
                Ok(()) => {
                    self.inner.lock().rolled_back.insert(id);
                }
                Err(e) => {
                    error!(target: "quarry::xa", txn_id = %self.id, rm = %id, error = %e, "Resource rollback failed");
                    failures.push(e.code);
                }
            }
        }

        let mut inner = self.inner.lock();
        let any_committed = !inner.committed.is_empty();
        if failures.is_empty() {
            if !any_committed {
                return Ok(());
            }
            inner.heuristic_code = Some(XaCode::HeurMix);
            return Err(XaError::new(
                XaCode::HeurMix,
                "rolled back after partial commit",
            ));
        }
        let code = fold_rollback_failures(any_committed, !inner.rolled_back.is_empty(), &failures);
        if code.is_heuristic() {
            inner.heuristic_code = Some(code);
        }
        Err(XaError::new(code, "resource rollback failed"))
    }

    fn cleanup(&self) -> std::result::Result<(), XaError> {
        let cause = self.rollback_cause();
        let cleaned = CleanupChain::new(format!("{} completion", self.id))
            .step("clear context", || {
                self.context.clear();
                Ok(())
            })
            .step("notify factory", || {
                self.hooks.transaction_complete(self, cause.as_deref())
            })
            .run();
        self.inner.lock().completed = true;
        if let Err(e) = cleaned {
            error!(target: "quarry::xa", txn_id = %self.id, error = %e, "Failed to clean up transaction");
            self.abort("Failure in cleanup", Arc::new(e));
            return Err(XaError::new(XaCode::RmErr, "failure in transaction cleanup"));
        }
        Ok(())
    }

    fn heuristic(&self, cause: &str) -> Result<bool> {
        let Some(_guard) = self
            .hooks
            .mutex()
            .lock_for_completion(Some(self.id), || self.in_completion.load(Ordering::SeqCst))
        else {
            return Ok(false);
        };
        self.in_completion.store(true, Ordering::SeqCst);
        {
            let mut inner = self.inner.lock();
            if inner.heuristic || inner.completed {
                return Ok(false);
            }
            inner.heuristic = true;
            inner.rollback_cause.get_or_insert_with(|| cause.to_string());
        }
        warn!(target: "quarry::xa", txn_id = %self.id, xid = %self.xid, cause, "Heuristic rollback");
        let result = self.rollback_resources();
        let cleaned = self.cleanup();
        {
            let mut inner = self.inner.lock();
            inner.heuristic_code.get_or_insert(XaCode::HeurRb);
        }
        result
            .and(cleaned)
            .map(|()| true)
            .map_err(|e| QuarryError::rolled_back("heuristic rollback failed", Arc::new(e.into())))
    }

    fn abort(&self, message: &str, cause: Arc<QuarryError>) -> QuarryError {
        let _guard = self.acquire(true);
        let (entries, reason) = {
            let mut inner = self.inner.lock();
            inner
                .rollback_cause
                .get_or_insert_with(|| message.to_string());
            inner.completed = true;
            let entries: Vec<Arc<dyn Enlistable>> = inner
                .enlisted
                .iter()
                .map(|e| Arc::clone(&e.enlistable))
                .collect();
            (entries, inner.rollback_cause.clone())
        };
        error!(target: "quarry::xa", txn_id = %self.id, error = %cause, "{} - Aborting", message);
        for entry in entries {
            if let Err(e) = entry.abort() {
                warn!(target: "quarry::xa", txn_id = %self.id, resource = %entry.resource_id(), error = %e, "Difficulty aborting enlisted resource");
            }
        }
        if let Err(e) = self.hooks.transaction_complete(self, reason.as_deref()) {
            error!(target: "quarry::xa", txn_id = %self.id, error = %e, "Failed to report aborted transaction");
        }
        QuarryError::Aborted {
            message: message.to_string(),
            cause: Some(cause),
        }
    }
}

/// Fold the codes of failed resource rollbacks into one outcome
///
/// `committed` and `rolled_back` report whether any resource of the same
/// branch committed or rolled back successfully. Codes a rollback may not
/// legally return yield `XAER_RMERR`.
pub fn fold_rollback_failures(committed: bool, rolled_back: bool, failures: &[XaCode]) -> XaCode {
    let mut code = if committed {
        Some(XaCode::HeurCom)
    } else {
        None
    };
    for failure in failures {
        code = Some(match failure {
            XaCode::HeurHaz
            | XaCode::NotA
            | XaCode::RmErr
            | XaCode::RmFail
            | XaCode::Inval
            | XaCode::Proto => match code {
                Some(XaCode::HeurMix) => XaCode::HeurMix,
                _ => XaCode::HeurHaz,
            },
            XaCode::HeurCom => match code {
                _ if rolled_back || code == Some(XaCode::HeurRb) => XaCode::HeurMix,
                None => XaCode::HeurCom,
                Some(other) => other,
            },
            XaCode::HeurRb => match code {
                _ if committed || code == Some(XaCode::HeurCom) => XaCode::HeurMix,
                None => XaCode::HeurRb,
                Some(other) => other,
            },
            XaCode::HeurMix => XaCode::HeurMix,
            _ => return XaCode::RmErr,
        });
    }
    code.unwrap_or(XaCode::RmErr)
}

impl Transaction for ExternalTransaction {
    fn id(&self) -> TxnId {
        self.id
    }

    fn heuristic_rollback(&self, cause: &str) -> Result<bool> {
        self.heuristic(cause)
    }

    fn abort_transaction(&self, message: &str, cause: Arc<QuarryError>) -> QuarryError {
        self.abort(message, cause)
    }

    fn reference(&self) -> Result<()> {
        Ok(())
    }

    fn dereference(&self) -> Result<()> {
        Ok(())
    }

    fn execute(&self, op: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.execute_with(op)
    }

    fn last_active(&self) -> Activity {
        self.inner.lock().activity
    }

    fn is_terminated(&self) -> bool {
        let inner = self.inner.lock();
        inner.completed || inner.heuristic
    }
}

impl Enlister for ExternalTransaction {
    fn enlist(&self, enlistable: Arc<dyn Enlistable>) -> Result<()> {
        ExternalTransaction::enlist(self, enlistable)
    }

    fn transaction_id(&self) -> TxnId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Start(StartFlag),
        End(EndFlag),
        Prepare,
        Commit,
        Rollback,
    }

    struct Rm {
        id: ResourceId,
        calls: Mutex<Vec<Call>>,
        rollback_error: Mutex<Option<XaCode>>,
    }

    impl Rm {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    impl ResourceManager for Rm {
        fn rm_id(&self) -> ResourceId {
            self.id
        }
        fn start(&self, _: &Xid, flag: StartFlag) -> std::result::Result<(), XaError> {
            self.calls.lock().push(Call::Start(flag));
            Ok(())
        }
        fn end(&self, _: &Xid, flag: EndFlag) -> std::result::Result<(), XaError> {
            self.calls.lock().push(Call::End(flag));
            Ok(())
        }
        fn prepare(&self, _: &Xid) -> std::result::Result<Vote, XaError> {
            self.calls.lock().push(Call::Prepare);
            Ok(Vote::Ok)
        }
        fn commit(&self, _: &Xid, _: bool) -> std::result::Result<(), XaError> {
            self.calls.lock().push(Call::Commit);
            Ok(())
        }
        fn rollback(&self, _: &Xid) -> std::result::Result<(), XaError> {
            self.calls.lock().push(Call::Rollback);
            match *self.rollback_error.lock() {
                Some(code) => Err(XaError::new(code, "rollback failed")),
                None => Ok(()),
            }
        }
        fn forget(&self, _: &Xid) -> std::result::Result<(), XaError> {
            Ok(())
        }
    }

    struct Participant {
        rm: Arc<Rm>,
        aborted: AtomicUsize,
    }

    impl Participant {
        fn new() -> Arc<Self> {
            Arc::new(Participant {
                rm: Arc::new(Rm {
                    id: ResourceId::next(),
                    calls: Mutex::new(Vec::new()),
                    rollback_error: Mutex::new(None),
                }),
                aborted: AtomicUsize::new(0),
            })
        }
    }

    impl Enlistable for Participant {
        fn resource_id(&self) -> ResourceId {
            self.rm.id
        }
        fn resource_manager(&self) -> Arc<dyn ResourceManager> {
            self.rm.clone()
        }
        fn abort(&self) -> Result<()> {
            self.aborted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Hooks {
        mutex: SessionMutex,
        completed: AtomicUsize,
    }

    impl ExternalHooks for Hooks {
        fn mutex(&self) -> &SessionMutex {
            &self.mutex
        }
        fn transaction_complete(&self, _: &ExternalTransaction, _: Option<&str>) -> Result<()> {
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Context {
        participants: Vec<Arc<Participant>>,
    }

    impl OperationContext for Context {
        fn initiate(&self, txn: Arc<dyn Enlister>) -> Result<()> {
            for p in &self.participants {
                txn.enlist(p.clone())?;
            }
            Ok(())
        }
        fn clear(&self) {}
    }

    fn fixture(n: usize) -> (Arc<Hooks>, Vec<Arc<Participant>>, Arc<ExternalTransaction>) {
        let hooks = Arc::new(Hooks::default());
        let participants: Vec<_> = (0..n).map(|_| Participant::new()).collect();
        let context = Arc::new(Context {
            participants: participants.clone(),
        });
        let txn = ExternalTransaction::new(hooks.clone(), context, Xid::generate(7), true).unwrap();
        (hooks, participants, txn)
    }

    #[test]
    fn test_operations_start_and_suspend_resources() {
        let (_hooks, participants, txn) = fixture(1);
        txn.execute_with(|| Ok(())).unwrap();
        txn.execute_with(|| Ok(())).unwrap();
        assert_eq!(
            participants[0].rm.calls(),
            vec![
                Call::Start(StartFlag::NoFlags),
                Call::End(EndFlag::Suspend),
                Call::Start(StartFlag::Resume),
                Call::End(EndFlag::Suspend),
            ]
        );
    }

    #[test]
    fn test_two_phase_completion() {
        let (hooks, participants, txn) = fixture(2);
        txn.execute_with(|| Ok(())).unwrap();
        txn.prepare().unwrap();
        txn.commit().unwrap();

        for p in &participants {
            assert_eq!(
                &p.rm.calls()[2..],
                &[Call::End(EndFlag::Success), Call::Prepare, Call::Commit]
            );
        }
        assert!(txn.is_completed());
        assert_eq!(hooks.completed.load(Ordering::SeqCst), 1);
        assert!(txn.execute_with(|| Ok(())).unwrap_err().is_protocol());
    }

    #[test]
    fn test_commit_requires_prepare() {
        let (hooks, _participants, txn) = fixture(1);
        txn.execute_with(|| Ok(())).unwrap();
        assert_eq!(txn.commit().unwrap_err().code, XaCode::Proto);
        assert!(!txn.is_completed());
        assert_eq!(hooks.completed.load(Ordering::SeqCst), 0);
        txn.rollback().unwrap();
        assert!(txn.is_completed());
    }

    #[test]
    fn test_heuristic_rollback_reports_heurrb() {
        let (_hooks, participants, txn) = fixture(1);
        txn.execute_with(|| Ok(())).unwrap();
        assert!(txn.heuristic_rollback("idle-timeout").unwrap());
        assert!(txn.is_heuristically_rolled_back());
        assert_eq!(txn.heuristic_code(), Some(XaCode::HeurRb));
        assert_eq!(txn.rollback_cause().as_deref(), Some("idle-timeout"));
        assert_eq!(participants[0].rm.calls().last(), Some(&Call::Rollback));

        let err = txn.execute_with(|| Ok(())).unwrap_err();
        assert!(err.to_string().contains("heuristically rolled back"));
        assert!(!txn.heuristic_rollback("idle-timeout").unwrap());
    }

    #[test]
    fn test_failed_operation_rolls_back() {
        let (_hooks, participants, txn) = fixture(1);
        let err = txn
            .execute_with(|| -> Result<()> { Err(QuarryError::resource("graphs", "bad quad")) })
            .unwrap_err();
        assert!(err.is_rollback());
        assert!(txn.is_heuristically_rolled_back());
        assert_eq!(participants[0].rm.calls().last(), Some(&Call::Rollback));
    }

    #[test]
    fn test_rollback_failure_reports_hazard() {
        let (_hooks, participants, txn) = fixture(2);
        *participants[1].rm.rollback_error.lock() = Some(XaCode::RmFail);
        txn.execute_with(|| Ok(())).unwrap();
        let err = txn.rollback().unwrap_err();
        assert_eq!(err.code, XaCode::HeurHaz);
        assert_eq!(txn.heuristic_code(), Some(XaCode::HeurHaz));
        assert!(txn.is_completed());
    }

    #[test]
    fn test_abort_aborts_every_participant() {
        let (hooks, participants, txn) = fixture(2);
        let err = txn.abort_transaction("forget", Arc::new(QuarryError::protocol("forget")));
        assert!(err.is_rollback());
        for p in &participants {
            assert_eq!(p.aborted.load(Ordering::SeqCst), 1);
        }
        assert_eq!(hooks.completed.load(Ordering::SeqCst), 1);
        assert!(txn.is_terminated());
    }

    #[test]
    fn test_fold_rollback_failures() {
        use XaCode::*;
        assert_eq!(fold_rollback_failures(false, false, &[RmFail]), HeurHaz);
        assert_eq!(fold_rollback_failures(false, false, &[HeurRb]), HeurRb);
        assert_eq!(fold_rollback_failures(true, false, &[HeurRb]), HeurMix);
        assert_eq!(fold_rollback_failures(false, true, &[HeurCom]), HeurMix);
        assert_eq!(fold_rollback_failures(false, false, &[HeurCom]), HeurCom);
        assert_eq!(fold_rollback_failures(true, false, &[HeurCom]), HeurCom);
        assert_eq!(fold_rollback_failures(false, false, &[HeurMix, RmErr]), HeurMix);
        assert_eq!(fold_rollback_failures(false, false, &[HeurRb, NotA]), HeurHaz);
        assert_eq!(fold_rollback_failures(false, false, &[RbRollback]), RmErr);
    }
}
