//! Phased store: committed snapshots plus one working phase
//!
//! A store holds an immutable snapshot of its latest committed phase that
//! any number of readers may pin, and at most one working phase being
//! built by the current writer:
//!
//! ```text
//! obtain ──► working (phase N+1) ──► prepare ──► commit ──► committed = N+1
//!                   │                                 │
//!                   └──────────── rollback ◄──────────┘ (before commit)
//! ```
//!
//! The last `window` committed phases are retained for recovery, either in
//! memory or as files in a [`PhaseLog`].

use crate::phase_log::PhaseLog;
use parking_lot::RwLock;
use quarry_core::{Phase, QuarryError, RecoveryHandler, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Smallest recovery window a store keeps
///
/// Participants publish a commit one after another, so a crash can leave
/// some stores one phase ahead of the rest. Keeping the previous phase
/// alongside the newest one leaves a phase every store still holds.
pub const MIN_RECOVERY_WINDOW: usize = 2;

/// State types a [`PhasedStore`] can hold
pub trait PhaseState: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> PhaseState for T where T: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// An immutable committed phase
#[derive(Debug)]
pub struct CommittedPhase<S> {
    phase: Phase,
    state: S,
}

impl<S> CommittedPhase<S> {
    /// Phase number
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Committed state
    pub fn state(&self) -> &S {
        &self.state
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkingStatus {
    Obtained,
    Prepared,
    Committed,
    RolledBack,
}

struct WorkingPhase<S> {
    phase: Phase,
    state: S,
    status: WorkingStatus,
}

struct StoreInner<S> {
    committed: Arc<CommittedPhase<S>>,
    history: BTreeMap<Phase, Arc<CommittedPhase<S>>>,
    working: Option<WorkingPhase<S>>,
}

/// A store whose contents advance in atomically published phases
pub struct PhasedStore<S> {
    name: String,
    window: usize,
    log: Option<PhaseLog>,
    inner: RwLock<StoreInner<S>>,
}

impl<S: PhaseState> PhasedStore<S> {
    /// Create a store that keeps its recovery window in memory
    pub fn in_memory(name: impl Into<String>, window: usize) -> Self {
        Self::build(name.into(), window, None)
    }

    /// Create a store backed by phase files
    ///
    /// The store starts at the initial phase; startup recovery selects the
    /// phase to roll forward to.
    pub fn persistent(name: impl Into<String>, log: PhaseLog, window: usize) -> Self {
        Self::build(name.into(), window, Some(log))
    }

    fn build(name: String, window: usize, log: Option<PhaseLog>) -> Self {
        PhasedStore {
            name,
            window: window.max(MIN_RECOVERY_WINDOW),
            log,
            inner: RwLock::new(StoreInner {
                committed: Arc::new(CommittedPhase {
                    phase: Phase::INITIAL,
                    state: S::default(),
                }),
                history: BTreeMap::new(),
                working: None,
            }),
        }
    }

    /// Store name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest committed phase, pinned for as long as the caller holds it
    pub fn committed(&self) -> Arc<CommittedPhase<S>> {
        Arc::clone(&self.inner.read().committed)
    }

    /// Number of the latest committed phase
    pub fn committed_phase(&self) -> Phase {
        self.inner.read().committed.phase
    }

    /// Number of the working phase, if one is obtained
    pub fn working_phase(&self) -> Option<Phase> {
        self.inner.read().working.as_ref().map(|w| w.phase)
    }

    /// Begin a working phase derived from the latest committed phase
    pub fn obtain(&self) -> Result<Phase> {
        let mut inner = self.inner.write();
        if let Some(working) = &inner.working {
            return Err(self.error(format!(
                "working {} already obtained",
                working.phase
            )));
        }
        let phase = inner.committed.phase.next();
        let state = inner.committed.state.clone();
        inner.working = Some(WorkingPhase {
            phase,
            state,
            status: WorkingStatus::Obtained,
        });
        debug!(target: "quarry::phase", store = %self.name, phase = phase.0, "Obtained working phase");
        Ok(phase)
    }

    /// Read the working phase
    pub fn read_working<R>(&self, f: impl FnOnce(&S) -> R) -> Result<R> {
        let inner = self.inner.read();
        match &inner.working {
            Some(w) if w.status != WorkingStatus::RolledBack => Ok(f(&w.state)),
            _ => Err(self.error("no working phase to read")),
        }
    }

    /// Mutate the working phase
    pub fn write_working<R>(&self, f: impl FnOnce(&mut S) -> R) -> Result<R> {
        let mut inner = self.inner.write();
        match &mut inner.working {
            Some(w) if w.status == WorkingStatus::Obtained => Ok(f(&mut w.state)),
            Some(w) => Err(QuarryError::resource(
                self.name.clone(),
                format!("working {} is no longer writable ({:?})", w.phase, w.status),
            )),
            None => Err(self.error("no working phase to write")),
        }
    }

    /// Make the working phase durable without publishing it
    pub fn prepare(&self) -> Result<()> {
        let (phase, payload) = {
            let inner = self.inner.read();
            let working = inner
                .working
                .as_ref()
                .ok_or_else(|| self.error("prepare without a working phase"))?;
            match working.status {
                WorkingStatus::Prepared => return Ok(()),
                WorkingStatus::Obtained => {}
                other => {
                    return Err(self.error(format!("cannot prepare a {:?} phase", other)));
                }
            }
            let payload = match &self.log {
                Some(_) => Some(serde_json::to_vec(&working.state)?),
                None => None,
            };
            (working.phase, payload)
        };

        if let (Some(log), Some(payload)) = (&self.log, payload) {
            log.write_prepared_bytes(phase, &payload)?;
        }

        let mut inner = self.inner.write();
        if let Some(w) = inner.working.as_mut() {
            w.status = WorkingStatus::Prepared;
        }
        Ok(())
    }

    /// Publish the prepared working phase
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let working = inner
            .working
            .as_mut()
            .ok_or_else(|| self.error("commit without a working phase"))?;
        match working.status {
            WorkingStatus::Committed => return Ok(()),
            WorkingStatus::Prepared => {}
            other => return Err(self.error(format!("cannot commit a {:?} phase", other))),
        }
        let phase = working.phase;
        if let Some(log) = &self.log {
            log.publish(phase)?;
        }
        working.status = WorkingStatus::Committed;
        let state = std::mem::take(&mut working.state);

        let committed = Arc::new(CommittedPhase { phase, state });
        inner.committed = Arc::clone(&committed);
        inner.history.insert(phase, committed);
        while inner.history.len() > self.window {
            inner.history.pop_first();
        }
        if let Some(log) = &self.log {
            log.prune(self.window)?;
        }
        debug!(target: "quarry::phase", store = %self.name, phase = phase.0, "Committed phase");
        Ok(())
    }

    /// Discard the working phase
    pub fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(working) = inner.working.as_mut() else {
            return Ok(());
        };
        match working.status {
            WorkingStatus::Committed => {
                return Err(self.error(format!(
                    "cannot roll back committed {}",
                    working.phase
                )));
            }
            WorkingStatus::RolledBack => return Ok(()),
            WorkingStatus::Obtained | WorkingStatus::Prepared => {}
        }
        let phase = working.phase;
        working.status = WorkingStatus::RolledBack;
        working.state = S::default();
        if let Some(log) = &self.log {
            log.discard(phase)?;
        }
        debug!(target: "quarry::phase", store = %self.name, phase = phase.0, "Rolled back phase");
        Ok(())
    }

    /// Close the working phase after commit or rollback
    pub fn release(&self) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.working.as_ref().map(|w| w.status) {
            None => Ok(()),
            Some(WorkingStatus::Committed) | Some(WorkingStatus::RolledBack) => {
                inner.working = None;
                Ok(())
            }
            Some(other) => Err(self.error(format!(
                "cannot release a {:?} phase before commit or rollback",
                other
            ))),
        }
    }

    fn error(&self, message: impl Into<String>) -> QuarryError {
        QuarryError::resource(self.name.clone(), message)
    }
}

impl<S: PhaseState> RecoveryHandler for PhasedStore<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn recoverable_phases(&self) -> Result<BTreeSet<Phase>> {
        match &self.log {
            Some(log) => log.phases(),
            None => Ok(self.inner.read().history.keys().copied().collect()),
        }
    }

    fn select_phase(&self, phase: Phase) -> Result<()> {
        let mut inner = self.inner.write();
        let committed = match &self.log {
            Some(log) => {
                let state: S = log.load(phase)?;
                log.remove_after(phase)?;
                Arc::new(CommittedPhase { phase, state })
            }
            None => inner.history.get(&phase).cloned().ok_or_else(|| {
                QuarryError::recovery(format!("{} cannot recover {}", self.name, phase))
            })?,
        };
        inner.history.retain(|p, _| *p < phase);
        inner.history.insert(phase, Arc::clone(&committed));
        inner.committed = committed;
        inner.working = None;
        info!(target: "quarry::recovery", store = %self.name, phase = phase.0, "Selected recovery phase");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(log) = &self.log {
            log.clear()?;
        }
        inner.committed = Arc::new(CommittedPhase {
            phase: Phase::INITIAL,
            state: S::default(),
        });
        inner.history.clear();
        inner.working = None;
        info!(target: "quarry::recovery", store = %self.name, "Cleared to initial phase");
        Ok(())
    }
}
