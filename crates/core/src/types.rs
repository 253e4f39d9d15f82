//! Core identifiers for Quarry
//!
//! This module defines the foundational types:
//! - TxnId: process-unique transaction identifier
//! - SessionId: process-unique session identifier
//! - ResourceId: identity of an enlistable resource or resource manager
//! - Phase: durably committed snapshot number of one persistent store
//! - NodeId: allocated node in the quad store

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transaction within this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Allocate the next transaction id
    pub fn next() -> Self {
        TxnId(NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Unique identifier for a session within this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Allocate the next session id
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session:{}", self.0)
    }
}

/// Identity of an enlistable resource
///
/// Two handles with the same id are the same participant; enlisting
/// the second is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

impl ResourceId {
    /// Allocate the next resource id
    pub fn next() -> Self {
        ResourceId(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rm:{}", self.0)
    }
}

/// Phase number of a persistent store
///
/// Phase 0 is the initial empty phase every store is cleared to.
/// Each committed write transaction advances the phase by one.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Phase(pub u64);

impl Phase {
    /// The initial, empty phase
    pub const INITIAL: Phase = Phase(0);

    /// The phase a working copy of this phase will commit as
    pub fn next(self) -> Phase {
        Phase(self.0 + 1)
    }

    /// Raw phase number
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase {}", self.0)
    }
}

/// Node allocated by the node pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Raw node number
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_node{}", self.0)
    }
}
