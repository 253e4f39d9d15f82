//! The persistent stores of one database
//!
//! Every database carries the node pool, the string pool and the quad
//! store. Embedders may add further phase participants; these join write
//! transactions only and take part in startup recovery through their own
//! recovery handlers.

use crate::resolver::{GraphStore, GRAPH_STORE};
use quarry_core::{Phase, PhaseResource, RecoveryHandler, Result};
use quarry_durability::{NodePool, PhaseLocks, PhaseLog, StringPool, NODE_POOL, STRING_POOL};
use std::path::Path;
use std::sync::Arc;

/// Stores and shared protocol locks of one database
pub struct Stores {
    strings: Arc<StringPool>,
    nodes: Arc<NodePool>,
    graphs: Arc<GraphStore>,
    locks: Arc<PhaseLocks>,
    participants: Vec<Arc<dyn PhaseResource>>,
}

impl Stores {
    /// Stores that keep their recovery window in memory
    pub fn in_memory(window: usize, participants: Vec<Arc<dyn PhaseResource>>) -> Self {
        Stores {
            strings: Arc::new(StringPool::in_memory(STRING_POOL, window)),
            nodes: Arc::new(NodePool::in_memory(NODE_POOL, window)),
            graphs: Arc::new(GraphStore::in_memory(GRAPH_STORE, window)),
            locks: Arc::new(PhaseLocks::new()),
            participants,
        }
    }

    /// Stores backed by phase files under `dir`
    pub fn persistent(
        dir: &Path,
        window: usize,
        sync: bool,
        participants: Vec<Arc<dyn PhaseResource>>,
    ) -> Result<Self> {
        Ok(Stores {
            strings: Arc::new(StringPool::persistent(
                STRING_POOL,
                PhaseLog::open(dir, STRING_POOL, sync)?,
                window,
            )),
            nodes: Arc::new(NodePool::persistent(
                NODE_POOL,
                PhaseLog::open(dir, NODE_POOL, sync)?,
                window,
            )),
            graphs: Arc::new(GraphStore::persistent(
                GRAPH_STORE,
                PhaseLog::open(dir, GRAPH_STORE, sync)?,
                window,
            )),
            locks: Arc::new(PhaseLocks::new()),
            participants,
        })
    }

    /// String pool
    pub fn strings(&self) -> &Arc<StringPool> {
        &self.strings
    }

    /// Node pool
    pub fn nodes(&self) -> &Arc<NodePool> {
        &self.nodes
    }

    /// Quad store
    pub fn graphs(&self) -> &Arc<GraphStore> {
        &self.graphs
    }

    /// Protocol locks shared by every phase session
    pub fn locks(&self) -> &Arc<PhaseLocks> {
        &self.locks
    }

    /// Extra participants joined to write transactions
    pub fn participants(&self) -> &[Arc<dyn PhaseResource>] {
        &self.participants
    }

    /// Recovery handlers of the built-in stores
    pub fn recovery_handlers(&self) -> Vec<Arc<dyn RecoveryHandler>> {
        vec![
            Arc::clone(&self.strings) as Arc<dyn RecoveryHandler>,
            Arc::clone(&self.nodes) as Arc<dyn RecoveryHandler>,
            Arc::clone(&self.graphs) as Arc<dyn RecoveryHandler>,
        ]
    }

    /// Committed phase of every built-in store, by name
    pub fn committed_phases(&self) -> Vec<(String, Phase)> {
        vec![
            (STRING_POOL.to_string(), self.strings.committed_phase()),
            (NODE_POOL.to_string(), self.nodes.committed_phase()),
            (GRAPH_STORE.to_string(), self.graphs.committed_phase()),
        ]
    }
}
