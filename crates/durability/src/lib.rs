//! Durability layer for Quarry
//!
//! This crate handles everything that makes a phase durable:
//!
//! - Phased stores: committed snapshots plus a single working phase
//! - Phase log: one checksummed file per committed phase, atomic publish by rename
//! - Node pool and string pool, the two stores every database carries
//! - Per-transaction handles: writers build the working phase, readers pin a snapshot
//! - Phase session: the refresh/prepare/commit/rollback/release protocol
//! - Resource adapter exposing a phase session to a two-phase coordinator
//! - Recovery: reconcile the phases of co-committed stores at startup

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handle;
pub mod phase_log;
pub mod phase_session;
pub mod pools;
pub mod recovery;
pub mod resource;
pub mod store;

pub use handle::PhaseHandle;
pub use phase_log::{PhaseFileError, PhaseLog};
pub use phase_session::{PhaseLocks, PhaseSession, ProtocolState};
pub use pools::{
    NodePool, NodePoolState, StringPool, StringPoolHandle, StringPoolState, NODE_POOL,
    STRING_POOL,
};
pub use recovery::{RecoveryOutcome, RecoveryReconciler};
pub use resource::{PhaseSessionManager, PhaseSessionResource};
pub use store::{CommittedPhase, PhaseState, PhasedStore, MIN_RECOVERY_WINDOW};
