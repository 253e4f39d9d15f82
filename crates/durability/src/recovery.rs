//! Startup recovery: reconcile independently persisted phases
//!
//! ## Recovery Procedure
//!
//! 1. Ask every store for its recoverable phase set
//! 2. All sets empty: fresh database, clear every store to the initial phase
//! 3. Some empty, some not: the stores were not committed together; fail
//! 4. Intersect the sets; empty intersection means the stores diverged; fail
//! 5. Otherwise select the highest common phase on every store
//!
//! Recovery failures are never repaired automatically.

use quarry_core::{Phase, QuarryError, RecoveryHandler, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info};

/// What recovery did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No store had anything to recover; all were cleared
    Cleared,
    /// Every store was rolled forward to this phase
    Selected(Phase),
}

impl RecoveryOutcome {
    /// Phase the database is at after recovery
    pub fn phase(&self) -> Phase {
        match self {
            RecoveryOutcome::Cleared => Phase::INITIAL,
            RecoveryOutcome::Selected(phase) => *phase,
        }
    }
}

/// Reconciles the phases of a group of co-committed stores
pub struct RecoveryReconciler {
    handlers: Vec<Arc<dyn RecoveryHandler>>,
}

impl RecoveryReconciler {
    /// Create a reconciler over `handlers`
    pub fn new(handlers: Vec<Arc<dyn RecoveryHandler>>) -> Self {
        RecoveryReconciler { handlers }
    }

    /// Run the recovery procedure
    pub fn reconcile(&self) -> Result<RecoveryOutcome> {
        let mut sets = Vec::with_capacity(self.handlers.len());
        for handler in &self.handlers {
            let phases = handler.recoverable_phases()?;
            info!(
                target: "quarry::recovery",
                store = handler.name(),
                phases = ?phases,
                "Recoverable phases"
            );
            sets.push(phases);
        }

        if sets.iter().all(BTreeSet::is_empty) {
            for handler in &self.handlers {
                handler.clear()?;
            }
            info!(target: "quarry::recovery", "No recoverable phases, initialized fresh database");
            return Ok(RecoveryOutcome::Cleared);
        }

        if let Some(empty) = sets.iter().position(BTreeSet::is_empty) {
            let message = format!(
                "Unable to find common phase in pre-existing database: {} has no recoverable phases",
                self.handlers[empty].name()
            );
            error!(target: "quarry::recovery", "{}", message);
            return Err(QuarryError::recovery(message));
        }

        let mut common = sets[0].clone();
        for set in &sets[1..] {
            common = common.intersection(set).copied().collect();
        }

        let Some(&phase) = common.iter().next_back() else {
            let message = format!(
                "No matching phases between resources: {}",
                self.describe(&sets)
            );
            error!(target: "quarry::recovery", "{}", message);
            return Err(QuarryError::recovery(message));
        };

        for handler in &self.handlers {
            handler.select_phase(phase)?;
        }
        info!(target: "quarry::recovery", phase = phase.0, "Recovered database");
        Ok(RecoveryOutcome::Selected(phase))
    }

    fn describe(&self, sets: &[BTreeSet<Phase>]) -> String {
        self.handlers
            .iter()
            .zip(sets)
            .map(|(handler, set)| {
                let phases: Vec<String> = set.iter().map(|p| p.0.to_string()).collect();
                format!("{}: [{}]", handler.name(), phases.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Action {
        Cleared,
        Selected(Phase),
    }

    struct MockStore {
        name: String,
        phases: BTreeSet<Phase>,
        actions: Mutex<Vec<Action>>,
    }

    impl MockStore {
        fn new(name: &str, phases: &[u64]) -> Arc<Self> {
            Arc::new(MockStore {
                name: name.to_string(),
                phases: phases.iter().copied().map(Phase).collect(),
                actions: Mutex::new(Vec::new()),
            })
        }

        fn actions(&self) -> Vec<Action> {
            self.actions.lock().clone()
        }
    }

    impl RecoveryHandler for MockStore {
        fn name(&self) -> &str {
            &self.name
        }
        fn recoverable_phases(&self) -> Result<BTreeSet<Phase>> {
            Ok(self.phases.clone())
        }
        fn select_phase(&self, phase: Phase) -> Result<()> {
            self.actions.lock().push(Action::Selected(phase));
            Ok(())
        }
        fn clear(&self) -> Result<()> {
            self.actions.lock().push(Action::Cleared);
            Ok(())
        }
    }

    fn reconciler(stores: &[Arc<MockStore>]) -> RecoveryReconciler {
        RecoveryReconciler::new(
            stores
                .iter()
                .map(|s| Arc::clone(s) as Arc<dyn RecoveryHandler>)
                .collect(),
        )
    }

    #[test]
    fn test_selects_highest_common_phase() {
        let stores = [
            MockStore::new("node-pool", &[1, 2, 3]),
            MockStore::new("string-pool", &[2, 3]),
            MockStore::new("graphs", &[2, 3, 4]),
        ];
        let outcome = reconciler(&stores).reconcile().unwrap();
        assert_eq!(outcome, RecoveryOutcome::Selected(Phase(3)));
        for store in &stores {
            assert_eq!(store.actions(), vec![Action::Selected(Phase(3))]);
        }
    }

    #[test]
    fn test_disjoint_sets_fail() {
        let stores = [
            MockStore::new("node-pool", &[1, 2]),
            MockStore::new("string-pool", &[3, 4]),
        ];
        let err = reconciler(&stores).reconcile().unwrap_err();
        assert!(matches!(err, QuarryError::Recovery(_)));
        let msg = err.to_string();
        assert!(msg.contains("node-pool: [1, 2]"));
        assert!(msg.contains("string-pool: [3, 4]"));
        for store in &stores {
            assert!(store.actions().is_empty());
        }
    }

    #[test]
    fn test_all_empty_clears_everything() {
        let stores = [
            MockStore::new("node-pool", &[]),
            MockStore::new("string-pool", &[]),
            MockStore::new("graphs", &[]),
        ];
        let outcome = reconciler(&stores).reconcile().unwrap();
        assert_eq!(outcome, RecoveryOutcome::Cleared);
        assert_eq!(outcome.phase(), Phase::INITIAL);
        for store in &stores {
            assert_eq!(store.actions(), vec![Action::Cleared]);
        }
    }

    #[test]
    fn test_one_empty_set_is_inconsistent() {
        for empty_at in 0..3 {
            let stores: Vec<_> = (0..3)
                .map(|i| {
                    if i == empty_at {
                        MockStore::new(&format!("store-{}", i), &[])
                    } else {
                        MockStore::new(&format!("store-{}", i), &[4, 5])
                    }
                })
                .collect();
            let err = reconciler(&stores).reconcile().unwrap_err();
            assert!(err
                .to_string()
                .contains(&format!("store-{} has no recoverable phases", empty_at)));
            for store in &stores {
                assert!(store.actions().is_empty());
            }
        }
    }

    #[test]
    fn test_single_store_selects_its_highest_phase() {
        let stores = [MockStore::new("graphs", &[7, 9, 8])];
        let outcome = reconciler(&stores).reconcile().unwrap();
        assert_eq!(outcome.phase(), Phase(9));
    }
}
