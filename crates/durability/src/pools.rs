//! Node allocator and literal/URI interning pool
//!
//! The string pool maps every literal or URI to the node allocated for it.
//! It cross-references the node pool, so both advance their phases
//! together: refreshing, preparing and committing the string pool handle
//! cascades to the node pool handle first.

use crate::handle::PhaseHandle;
use crate::store::PhasedStore;
use quarry_core::{NodeId, PhaseResource, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Store name of the node pool
pub const NODE_POOL: &str = "node-pool";
/// Store name of the string pool
pub const STRING_POOL: &str = "string-pool";

/// Persistent state of the node allocator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodePoolState {
    next_node: u64,
}

impl Default for NodePoolState {
    fn default() -> Self {
        NodePoolState { next_node: 1 }
    }
}

impl NodePoolState {
    /// Allocate a fresh node
    pub fn allocate(&mut self) -> NodeId {
        let node = NodeId(self.next_node);
        self.next_node += 1;
        node
    }

    /// Number of nodes allocated so far
    pub fn allocated(&self) -> u64 {
        self.next_node - 1
    }
}

/// Persistent state of the interning pool
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StringPoolState {
    by_value: BTreeMap<String, u64>,
    by_node: BTreeMap<u64, String>,
}

impl StringPoolState {
    /// Node interned for `value`
    pub fn find(&self, value: &str) -> Option<NodeId> {
        self.by_value.get(value).copied().map(NodeId)
    }

    /// Value interned for `node`
    pub fn value(&self, node: NodeId) -> Option<&str> {
        self.by_node.get(&node.0).map(String::as_str)
    }

    /// Record `value` under `node`
    pub fn put(&mut self, value: &str, node: NodeId) {
        self.by_value.insert(value.to_string(), node.0);
        self.by_node.insert(node.0, value.to_string());
    }

    /// Number of interned values
    pub fn len(&self) -> usize {
        self.by_value.len()
    }

    /// True if nothing is interned
    pub fn is_empty(&self) -> bool {
        self.by_value.is_empty()
    }
}

/// Node pool store
pub type NodePool = PhasedStore<NodePoolState>;
/// String pool store
pub type StringPool = PhasedStore<StringPoolState>;

/// A transaction's handle onto the string pool and its node pool
pub struct StringPoolHandle {
    strings: PhaseHandle<StringPoolState>,
    nodes: PhaseHandle<NodePoolState>,
}

impl StringPoolHandle {
    /// Create handles onto both pools
    pub fn new(strings: Arc<StringPool>, nodes: Arc<NodePool>, writable: bool) -> Self {
        StringPoolHandle {
            strings: PhaseHandle::new(strings, writable),
            nodes: PhaseHandle::new(nodes, writable),
        }
    }

    /// True if this handle can intern new values
    pub fn is_writable(&self) -> bool {
        self.strings.is_writable()
    }

    /// Node for `value`, interning it if it is new
    pub fn localize(&self, value: &str) -> Result<NodeId> {
        if let Some(node) = self.lookup(value)? {
            return Ok(node);
        }
        let node = self.nodes.write(NodePoolState::allocate)?;
        self.strings.write(|pool| pool.put(value, node))?;
        Ok(node)
    }

    /// Node for `value` if it is already interned
    pub fn lookup(&self, value: &str) -> Result<Option<NodeId>> {
        self.strings.read(|pool| pool.find(value))
    }

    /// Value interned for `node`
    pub fn globalize(&self, node: NodeId) -> Result<Option<String>> {
        self.strings
            .read(|pool| pool.value(node).map(str::to_string))
    }

    /// Allocate a node with no interned value
    pub fn new_blank_node(&self) -> Result<NodeId> {
        self.nodes.write(NodePoolState::allocate)
    }

    /// Nodes allocated in the visible phase
    pub fn allocated_nodes(&self) -> Result<u64> {
        self.nodes.read(NodePoolState::allocated)
    }
}

impl PhaseResource for StringPoolHandle {
    fn name(&self) -> &str {
        STRING_POOL
    }

    fn refresh(&self) -> Result<()> {
        self.nodes.refresh()?;
        self.strings.refresh()
    }

    fn prepare(&self) -> Result<()> {
        self.nodes.prepare()?;
        self.strings.prepare()
    }

    fn commit(&self) -> Result<()> {
        self.nodes.commit()?;
        self.strings.commit()
    }

    fn rollback(&self) -> Result<()> {
        let nodes = self.nodes.rollback();
        let strings = self.strings.rollback();
        nodes.and(strings)
    }

    fn release(&self) -> Result<()> {
        let nodes = self.nodes.release();
        let strings = self.strings.release();
        nodes.and(strings)
    }
}
