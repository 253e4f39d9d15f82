//! Two-phase commit adapter for a phase session
//!
//! Exposes a [`PhaseSession`] to a coordinator as a resource manager:
//! `start(NOFLAGS)` refreshes, `prepare` prepares, `commit` commits and
//! releases, `rollback` rolls back and releases. Suspend/resume keep the
//! obtained phase, so a suspended reader keeps its snapshot.

use crate::phase_session::{PhaseSession, ProtocolState};
use parking_lot::Mutex;
use quarry_core::{
    EndFlag, Enlistable, PhaseResource, QuarryError, ResourceId, ResourceManager, Result,
    StartFlag, Vote, XaCode, XaError, Xid,
};
use std::sync::Arc;
use tracing::{error, trace};

/// Resource manager view of a phase session
pub struct PhaseSessionManager {
    id: ResourceId,
    session: Arc<PhaseSession>,
    peers: Vec<Arc<dyn PhaseResource>>,
    branch: Mutex<Option<Xid>>,
}

impl PhaseSessionManager {
    fn check_branch(&self, xid: &Xid) -> std::result::Result<(), XaError> {
        match self.branch.lock().as_ref() {
            Some(current) if current == xid => Ok(()),
            _ => Err(XaError::new(
                XaCode::NotA,
                format!("{} is not associated with {}", xid, self.id),
            )),
        }
    }

    fn finish(&self) {
        *self.branch.lock() = None;
    }

    /// Roll back and release, tolerating either step failing
    fn rollback_and_release(&self) -> Result<()> {
        let rollback = match self.session.state() {
            None | Some(ProtocolState::Release) => return Ok(()),
            Some(ProtocolState::Commit) | Some(ProtocolState::Rollback) => Ok(()),
            Some(ProtocolState::Obtain) | Some(ProtocolState::Prepare) => self.session.rollback(),
        };
        let release = self.session.release();
        if let Err(e) = &release {
            error!(target: "quarry::xa", rm = %self.id, error = %e, "Failed to release phase session");
        }
        rollback.and(release)
    }
}

fn rm_error(e: QuarryError) -> XaError {
    XaError::new(XaCode::RmErr, e.to_string())
}

impl ResourceManager for PhaseSessionManager {
    fn rm_id(&self) -> ResourceId {
        self.id
    }

    fn start(&self, xid: &Xid, flag: StartFlag) -> std::result::Result<(), XaError> {
        trace!(target: "quarry::xa", rm = %self.id, xid = %xid, ?flag, "start");
        match flag {
            StartFlag::NoFlags => {
                {
                    let mut branch = self.branch.lock();
                    if branch.is_some() {
                        return Err(XaError::new(
                            XaCode::DupId,
                            format!("{} already started on {}", xid, self.id),
                        ));
                    }
                    *branch = Some(xid.clone());
                }
                self.session.refresh(&self.peers).map_err(|e| {
                    self.finish();
                    rm_error(e)
                })
            }
            StartFlag::Join | StartFlag::Resume => self.check_branch(xid),
        }
    }

    fn end(&self, xid: &Xid, flag: EndFlag) -> std::result::Result<(), XaError> {
        trace!(target: "quarry::xa", rm = %self.id, xid = %xid, ?flag, "end");
        self.check_branch(xid)
    }

    fn prepare(&self, xid: &Xid) -> std::result::Result<Vote, XaError> {
        self.check_branch(xid)?;
        if let Err(e) = self.session.prepare() {
            error!(target: "quarry::xa", rm = %self.id, error = %e, "Prepare failed, rolling back");
            if let Err(cleanup) = self.rollback_and_release() {
                error!(target: "quarry::xa", rm = %self.id, error = %cleanup, "Rollback after failed prepare also failed");
            }
            self.finish();
            return Err(XaError::new(XaCode::RbRollback, e.to_string()));
        }
        Ok(Vote::Ok)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> std::result::Result<(), XaError> {
        self.check_branch(xid)?;
        if one_phase {
            self.prepare(xid)?;
        }
        let committed = self.session.commit();
        if let Err(e) = &committed {
            error!(target: "quarry::xa", rm = %self.id, error = %e, "Commit failed");
        }
        let released = self.session.release();
        self.finish();
        committed.map_err(rm_error)?;
        released.map_err(rm_error)
    }

    fn rollback(&self, xid: &Xid) -> std::result::Result<(), XaError> {
        self.check_branch(xid)?;
        let result = self.rollback_and_release();
        self.finish();
        result.map_err(rm_error)
    }

    fn forget(&self, xid: &Xid) -> std::result::Result<(), XaError> {
        self.check_branch(xid)?;
        self.finish();
        Ok(())
    }
}

/// A phase session as enlisted into a transaction
pub struct PhaseSessionResource {
    manager: Arc<PhaseSessionManager>,
}

impl PhaseSessionResource {
    /// Wrap `session`; `peers` are refreshed alongside it on start
    pub fn new(session: Arc<PhaseSession>, peers: Vec<Arc<dyn PhaseResource>>) -> Self {
        PhaseSessionResource {
            manager: Arc::new(PhaseSessionManager {
                id: ResourceId::next(),
                session,
                peers,
                branch: Mutex::new(None),
            }),
        }
    }

    /// Underlying phase session
    pub fn session(&self) -> &Arc<PhaseSession> {
        &self.manager.session
    }
}

impl Enlistable for PhaseSessionResource {
    fn resource_id(&self) -> ResourceId {
        self.manager.id
    }

    fn resource_manager(&self) -> Arc<dyn ResourceManager> {
        self.manager.clone()
    }

    fn abort(&self) -> Result<()> {
        let result = self.manager.rollback_and_release();
        self.manager.finish();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase_session::PhaseLocks;
    use crate::pools::{NodePool, StringPool, StringPoolHandle, NODE_POOL, STRING_POOL};
    use quarry_core::Phase;

    fn resource(strings: &Arc<StringPool>, nodes: &Arc<NodePool>) -> PhaseSessionResource {
        let pools = Arc::new(StringPoolHandle::new(
            Arc::clone(strings),
            Arc::clone(nodes),
            true,
        ));
        let session = Arc::new(PhaseSession::new(pools, Arc::new(PhaseLocks::new())));
        PhaseSessionResource::new(session, Vec::new())
    }

    fn stores() -> (Arc<StringPool>, Arc<NodePool>) {
        (
            Arc::new(StringPool::in_memory(STRING_POOL, 2)),
            Arc::new(NodePool::in_memory(NODE_POOL, 2)),
        )
    }

    #[test]
    fn test_one_phase_commit() {
        let (strings, nodes) = stores();
        let res = resource(&strings, &nodes);
        let rm = res.resource_manager();
        let xid = Xid::generate(1);

        rm.start(&xid, StartFlag::NoFlags).unwrap();
        res.session().pools().localize("a").unwrap();
        rm.end(&xid, EndFlag::Success).unwrap();
        rm.commit(&xid, true).unwrap();

        assert_eq!(strings.committed_phase(), Phase(1));
        assert_eq!(res.session().state(), Some(ProtocolState::Release));
    }

    #[test]
    fn test_duplicate_start_and_unknown_xid() {
        let (strings, nodes) = stores();
        let res = resource(&strings, &nodes);
        let rm = res.resource_manager();
        let xid = Xid::generate(1);

        rm.start(&xid, StartFlag::NoFlags).unwrap();
        let dup = rm.start(&xid, StartFlag::NoFlags).unwrap_err();
        assert_eq!(dup.code, XaCode::DupId);

        let other = Xid::generate(1);
        assert_eq!(rm.prepare(&other).unwrap_err().code, XaCode::NotA);
        assert_eq!(
            rm.start(&other, StartFlag::Resume).unwrap_err().code,
            XaCode::NotA
        );
        rm.start(&xid, StartFlag::Resume).unwrap();
    }

    #[test]
    fn test_rollback_discards_phase() {
        let (strings, nodes) = stores();
        let res = resource(&strings, &nodes);
        let rm = res.resource_manager();
        let xid = Xid::generate(1);

        rm.start(&xid, StartFlag::NoFlags).unwrap();
        res.session().pools().localize("b").unwrap();
        rm.end(&xid, EndFlag::Fail).unwrap();
        rm.rollback(&xid).unwrap();

        assert_eq!(strings.committed_phase(), Phase::INITIAL);
        assert!(strings.working_phase().is_none());
        // The branch is gone
        assert_eq!(rm.rollback(&xid).unwrap_err().code, XaCode::NotA);
    }

    #[test]
    fn test_abort_frees_working_phase() {
        let (strings, nodes) = stores();
        let res = resource(&strings, &nodes);
        let rm = res.resource_manager();
        rm.start(&Xid::generate(1), StartFlag::NoFlags).unwrap();
        res.abort().unwrap();
        assert!(strings.working_phase().is_none());
        assert!(nodes.working_phase().is_none());
    }
}
