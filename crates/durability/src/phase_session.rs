//! Phase protocol coordinator for one transaction
//!
//! A `PhaseSession` drives the string pool (and through it the node pool)
//! plus every peer participant through the protocol:
//!
//! ```text
//! Obtain ──► Prepare ──► Commit ──┐
//!    │          │                 ├──► Release
//!    └──────────┴──► Rollback ────┘
//! ```
//!
//! Transitions are serialized by the database-wide protocol lock. `refresh`
//! and the commit flip additionally hold the global resource lock so that no
//! other transaction can obtain a working phase while one is being published.

use crate::pools::StringPoolHandle;
use parking_lot::Mutex;
use quarry_core::{PhaseResource, QuarryError, Result, ThreadGuard};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Protocol state of a [`PhaseSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Working phase obtained
    Obtain,
    /// Working phase made durable
    Prepare,
    /// Working phase published
    Commit,
    /// Working phase discarded
    Rollback,
    /// Transient state dropped
    Release,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolState::Obtain => "OBTAIN",
            ProtocolState::Prepare => "PREPARE",
            ProtocolState::Commit => "COMMIT",
            ProtocolState::Rollback => "ROLLBACK",
            ProtocolState::Release => "RELEASE",
        };
        f.write_str(name)
    }
}

/// Locks shared by every phase session of one database
#[derive(Debug, Default)]
pub struct PhaseLocks {
    protocol: Mutex<()>,
    global: Mutex<()>,
}

impl PhaseLocks {
    /// Create a fresh lock pair
    pub fn new() -> Self {
        Self::default()
    }
}

/// Drives one transaction's participants through the phase protocol
pub struct PhaseSession {
    pools: Arc<StringPoolHandle>,
    participants: Mutex<Vec<Arc<dyn PhaseResource>>>,
    locks: Arc<PhaseLocks>,
    state: Mutex<Option<ProtocolState>>,
    guard: ThreadGuard,
}

impl PhaseSession {
    /// Create a session over the given pools; read-only if the pools are
    pub fn new(pools: Arc<StringPoolHandle>, locks: Arc<PhaseLocks>) -> Self {
        PhaseSession {
            pools,
            participants: Mutex::new(Vec::new()),
            locks,
            state: Mutex::new(None),
            guard: ThreadGuard::new("phase session"),
        }
    }

    /// String pool handle
    pub fn pools(&self) -> &Arc<StringPoolHandle> {
        &self.pools
    }

    /// True if commits publish a new phase
    pub fn is_writable(&self) -> bool {
        self.pools.is_writable()
    }

    /// Current protocol state; `None` before the first refresh
    pub fn state(&self) -> Option<ProtocolState> {
        *self.state.lock()
    }

    /// Join fresh working phases for the pools and every peer
    pub fn refresh(&self, peers: &[Arc<dyn PhaseResource>]) -> Result<()> {
        let _thread = self.guard.enter()?;
        let _protocol = self.locks.protocol.lock();
        {
            let mut state = self.state.lock();
            match *state {
                None | Some(ProtocolState::Release) => {}
                Some(other) => {
                    return Err(QuarryError::protocol(format!(
                        "attempt to refresh phase session in {} state",
                        other
                    )));
                }
            }
            *state = Some(ProtocolState::Obtain);
        }
        *self.participants.lock() = peers.to_vec();

        let _global = self.locks.global.lock();
        self.pools.refresh()?;
        for peer in peers {
            peer.refresh()?;
        }
        debug!(target: "quarry::phase", participants = peers.len(), writable = self.is_writable(), "Refreshed phase session");
        Ok(())
    }

    /// Prepare the pools then every participant in registration order
    pub fn prepare(&self) -> Result<()> {
        let _thread = self.guard.enter()?;
        let _protocol = self.locks.protocol.lock();
        if !self.advance(ProtocolState::Prepare, &[ProtocolState::Obtain])? {
            return Ok(());
        }
        self.pools.prepare()?;
        for participant in self.participants() {
            participant.prepare()?;
        }
        Ok(())
    }

    /// Publish the prepared phase of the pools and every participant
    pub fn commit(&self) -> Result<()> {
        let _thread = self.guard.enter()?;
        let _protocol = self.locks.protocol.lock();
        if !self.advance(ProtocolState::Commit, &[ProtocolState::Prepare])? {
            return Ok(());
        }
        let participants = self.participants();
        let _global = self.locks.global.lock();
        self.pools.commit()?;
        for participant in participants {
            participant.commit()?;
        }
        Ok(())
    }

    /// Discard the working phase; legal from any state before release
    pub fn rollback(&self) -> Result<()> {
        let _thread = self.guard.enter()?;
        let _protocol = self.locks.protocol.lock();
        {
            let mut state = self.state.lock();
            if *state == Some(ProtocolState::Release) {
                return Err(QuarryError::protocol(
                    "attempt to rollback phase session in RELEASE state",
                ));
            }
            *state = Some(ProtocolState::Rollback);
        }

        // Every participant gets its rollback even if an earlier one fails
        let mut first_error = self.pools.rollback().err();
        for participant in self.participants() {
            if let Err(e) = participant.rollback() {
                error!(target: "quarry::phase", resource = participant.name(), error = %e, "Participant rollback failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop transient state after commit or rollback
    pub fn release(&self) -> Result<()> {
        let _thread = self.guard.enter()?;
        let _protocol = self.locks.protocol.lock();
        if !self.advance(
            ProtocolState::Release,
            &[ProtocolState::Commit, ProtocolState::Rollback],
        )? {
            return Ok(());
        }

        let mut first_error = self.pools.release().err();
        for participant in self.participants() {
            if let Err(e) = participant.release() {
                error!(target: "quarry::phase", resource = participant.name(), error = %e, "Participant release failed");
                first_error.get_or_insert(e);
            }
        }
        self.participants.lock().clear();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Move to `target`; `Ok(false)` if already there
    fn advance(&self, target: ProtocolState, from: &[ProtocolState]) -> Result<bool> {
        let mut state = self.state.lock();
        match *state {
            Some(current) if current == target => Ok(false),
            Some(current) if from.contains(&current) => {
                *state = Some(target);
                Ok(true)
            }
            current => Err(QuarryError::protocol(format!(
                "attempt to {} phase session from {} state",
                target,
                current.map_or_else(|| "UNINITIALIZED".to_string(), |s| s.to_string())
            ))),
        }
    }

    fn participants(&self) -> Vec<Arc<dyn PhaseResource>> {
        self.participants.lock().clone()
    }
}
