//! Database struct and open/close logic
//!
//! A `Database` owns:
//! - the phased stores (string pool, node pool, quad store, extra participants)
//! - the database-wide write lock
//! - the coordinator every internal transaction begins through
//! - the timeout reaper
//!
//! Opening runs startup recovery over every store before the first
//! session can be created. Sessions are the only way to read or write.

pub mod config;
mod builder;
mod stores;

pub use builder::DatabaseBuilder;
pub use config::{QuarryConfig, CONFIG_FILE_NAME};
pub use stores::Stores;

use crate::session::Session;
use quarry_concurrency::{Coordinator, TransactionReaper, WriteLockManager};
use quarry_core::{Phase, QuarryError, Result};
use quarry_durability::RecoveryOutcome;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// An open graph database
pub struct Database {
    data_dir: Option<PathBuf>,
    config: QuarryConfig,
    stores: Arc<Stores>,
    write_lock: WriteLockManager,
    coordinator: Arc<dyn Coordinator>,
    reaper: TransactionReaper,
    recovery: RecoveryOutcome,
    open: AtomicBool,
}

impl Database {
    /// Open (or create) a database directory
    ///
    /// Writes `quarry.toml` with defaults if the directory has none and
    /// opens with whatever it contains.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let data_dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let config_path = data_dir.join(CONFIG_FILE_NAME);
        QuarryConfig::write_default_if_missing(&config_path)?;
        let cfg = QuarryConfig::from_file(&config_path)?;

        Self::builder().path(data_dir).config(cfg).open()
    }

    /// Open a database directory with an explicit configuration
    ///
    /// The configuration is written to `quarry.toml` so a later
    /// [`Database::open`] picks up the same settings.
    pub fn open_with_config<P: AsRef<Path>>(path: P, cfg: QuarryConfig) -> Result<Arc<Self>> {
        let data_dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        cfg.validate()?;
        cfg.write_to_file(&data_dir.join(CONFIG_FILE_NAME))?;

        Self::builder().path(data_dir).config(cfg).open()
    }

    /// Open a database whose stores live only in memory
    pub fn open_in_memory() -> Result<Arc<Self>> {
        Self::builder().open()
    }

    /// Builder for databases with extra participants or a custom coordinator
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    pub(crate) fn assemble(
        data_dir: Option<PathBuf>,
        config: QuarryConfig,
        stores: Arc<Stores>,
        coordinator: Arc<dyn Coordinator>,
        recovery: RecoveryOutcome,
    ) -> Result<Arc<Self>> {
        let reaper = TransactionReaper::new()?;
        info!(
            target: "quarry::recovery",
            path = ?data_dir,
            outcome = ?recovery,
            "Database open"
        );
        Ok(Arc::new(Database {
            data_dir,
            config,
            stores,
            write_lock: WriteLockManager::new(),
            coordinator,
            reaper,
            recovery,
            open: AtomicBool::new(true),
        }))
    }

    /// Start a new session
    ///
    /// The session binds to internal or external transaction control on
    /// first use.
    pub fn new_session(self: &Arc<Self>) -> Result<Session> {
        if !self.is_open() {
            return Err(QuarryError::protocol("database has been shut down"));
        }
        Ok(Session::new(Arc::clone(self)))
    }

    /// Stop the timeout reaper and refuse new sessions
    ///
    /// Sessions already open keep working but are no longer subject to
    /// timeouts.
    pub fn shutdown(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.reaper.shutdown();
            info!(target: "quarry::recovery", path = ?self.data_dir, "Database shut down");
        }
    }

    /// True until [`shutdown`](Self::shutdown)
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Outcome of startup recovery
    pub fn recovery_outcome(&self) -> RecoveryOutcome {
        self.recovery
    }

    /// Committed phase of every built-in store, by name
    pub fn committed_phases(&self) -> Vec<(String, Phase)> {
        self.stores.committed_phases()
    }

    /// Configuration the database was opened with
    pub fn config(&self) -> &QuarryConfig {
        &self.config
    }

    /// Database directory, `None` for in-memory databases
    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// The phased stores
    pub fn stores(&self) -> &Arc<Stores> {
        &self.stores
    }

    pub(crate) fn write_lock(&self) -> &WriteLockManager {
        &self.write_lock
    }

    pub(crate) fn reaper(&self) -> &TransactionReaper {
        &self.reaper
    }

    pub(crate) fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.shutdown();
    }
}
