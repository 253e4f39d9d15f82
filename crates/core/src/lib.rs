//! Core types and traits for Quarry
//!
//! This crate defines the foundational vocabulary shared by every layer:
//! - QuarryError: error taxonomy and `Result` alias
//! - TxnId, SessionId, ResourceId, Phase, NodeId: identifiers
//! - Xid, XaCode, XaError, StartFlag, EndFlag, Vote: two-phase commit vocabulary
//! - PhaseResource, RecoveryHandler, ResourceManager, Enlistable: seam traits
//! - ThreadGuard: single-thread affinity guard

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod thread_guard;
pub mod traits;
pub mod types;
pub mod xa;

pub use error::{QuarryError, Result};
pub use thread_guard::{ThreadGuard, ThreadGuardToken};
pub use traits::{Enlistable, PhaseResource, RecoveryHandler, ResourceManager};
pub use types::{NodeId, Phase, ResourceId, SessionId, TxnId};
pub use xa::{EndFlag, StartFlag, Vote, XaCode, XaError, Xid};
