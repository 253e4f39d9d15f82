//! Database builder for fluent configuration
//!
//! Provides a builder for databases that need more than a path: extra
//! phase participants, extra recovery handlers or a different coordinator.

use std::path::PathBuf;
use std::sync::Arc;

use quarry_concurrency::{Coordinator, LocalCoordinator};
use quarry_core::{PhaseResource, RecoveryHandler, Result};
use quarry_durability::RecoveryReconciler;

use super::{Database, QuarryConfig, Stores};

// ============================================================================
// Database Builder Pattern
// ============================================================================

/// Builder for Database configuration
///
/// ```ignore
/// use quarry_engine::Database;
///
/// // Persistent, with an extra participant joined to every write transaction
/// let db = Database::builder()
///     .path("/data/graphs")
///     .participant(index.clone(), index_recovery)
///     .open()?;
///
/// // No path: stores live in memory
/// let db = Database::builder().open()?;
/// ```
pub struct DatabaseBuilder {
    /// Database directory; `None` keeps the stores in memory
    path: Option<PathBuf>,
    config: QuarryConfig,
    participants: Vec<Arc<dyn PhaseResource>>,
    recovery_handlers: Vec<Arc<dyn RecoveryHandler>>,
    coordinator: Option<Arc<dyn Coordinator>>,
}

impl DatabaseBuilder {
    /// Create new builder with defaults
    pub fn new() -> Self {
        Self {
            path: None,
            config: QuarryConfig::default(),
            participants: Vec::new(),
            recovery_handlers: Vec::new(),
            coordinator: None,
        }
    }

    /// Set database path
    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set configuration
    pub fn config(mut self, config: QuarryConfig) -> Self {
        self.config = config;
        self
    }

    /// Join `participant` to every write transaction and reconcile it at startup
    pub fn participant(
        mut self,
        participant: Arc<dyn PhaseResource>,
        recovery: Arc<dyn RecoveryHandler>,
    ) -> Self {
        self.participants.push(participant);
        self.recovery_handlers.push(recovery);
        self
    }

    /// Use `coordinator` instead of the local two-phase coordinator
    pub fn coordinator(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Open the database
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The configuration is invalid
    /// - Directory creation or opening a phase log fails
    /// - Startup recovery finds the stores inconsistent or diverged
    pub fn open(self) -> Result<Arc<Database>> {
        self.config.validate()?;
        let window = self.config.recovery_window;
        let stores = match &self.path {
            Some(path) => {
                std::fs::create_dir_all(path)?;
                Stores::persistent(path, window, self.config.sync_phase_files, self.participants)?
            }
            None => Stores::in_memory(window, self.participants),
        };

        let mut handlers = stores.recovery_handlers();
        handlers.extend(self.recovery_handlers);
        let outcome = RecoveryReconciler::new(handlers).reconcile()?;

        let coordinator = self
            .coordinator
            .unwrap_or_else(|| Arc::new(LocalCoordinator::new()));
        Database::assemble(self.path, self.config, Arc::new(stores), coordinator, outcome)
    }
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self::new()
    }
}
