//! Quarry - transaction management for an embedded RDF quad store
//!
//! Quarry keeps every store in committed phases: readers pin a committed
//! snapshot, a single writer builds the next phase, and a two-phase
//! protocol publishes it atomically across all stores.
//!
//! # Quick Start
//!
//! ```ignore
//! use quarry::{Database, Triple};
//!
//! let db = Database::open("/data/graphs")?;
//! let session = db.new_session()?;
//!
//! // Autocommit: every call is its own transaction
//! session.insert("urn:g", &Triple::new("urn:s", "urn:p", "urn:o"))?;
//!
//! // Explicit transactions
//! session.set_autocommit(false)?;
//! session.delete("urn:g", &Triple::new("urn:s", "urn:p", "urn:o"))?;
//! session.rollback()?;
//! ```
//!
//! # Architecture
//!
//! - `quarry-core`: errors, identifiers, XA vocabulary, seam traits
//! - `quarry-durability`: phased stores, phase log, phase protocol, recovery
//! - `quarry-concurrency`: session mutex, write lock, transactions, reaper
//! - `quarry-engine`: database, sessions, factories, XA resource handles

pub use quarry_concurrency::{Transaction, TxnState};
pub use quarry_core::{
    EndFlag, Phase, QuarryError, ResourceManager, Result, SessionId, StartFlag, TxnId, Vote,
    XaCode, XaError, Xid,
};
pub use quarry_durability::RecoveryOutcome;
pub use quarry_engine::{
    Database, DatabaseBuilder, QuarryConfig, Session, SessionXaResource, TransactionHandle,
    Triple,
};
