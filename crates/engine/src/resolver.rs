//! Graph-content resolver
//!
//! Graph content is a phased store of quads keyed by interned node ids.
//! Every transaction gets a [`GraphResolver`] pairing its string pool
//! handle with its handle onto the quad store; writers localize new terms,
//! readers only look up terms that already exist in their snapshot.

use quarry_core::{NodeId, QuarryError, Result};
use quarry_durability::{PhaseHandle, PhasedStore, StringPoolHandle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Name of the quad store
pub const GRAPH_STORE: &str = "graphs";

/// One statement in one graph, as interned node ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Quad {
    /// Graph the statement belongs to
    pub graph: NodeId,
    /// Subject node
    pub subject: NodeId,
    /// Predicate node
    pub predicate: NodeId,
    /// Object node
    pub object: NodeId,
}

impl Quad {
    fn graph_bounds(graph: NodeId) -> (Quad, Quad) {
        let lo = NodeId(0);
        let hi = NodeId(u64::MAX);
        (
            Quad {
                graph,
                subject: lo,
                predicate: lo,
                object: lo,
            },
            Quad {
                graph,
                subject: hi,
                predicate: hi,
                object: hi,
            },
        )
    }
}

/// Contents of the quad store in one phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphState {
    quads: BTreeSet<Quad>,
}

impl GraphState {
    /// Add a quad; false if it was already present
    pub fn insert(&mut self, quad: Quad) -> bool {
        self.quads.insert(quad)
    }

    /// Remove a quad; false if it was absent
    pub fn remove(&mut self, quad: &Quad) -> bool {
        self.quads.remove(quad)
    }

    /// Quads of `graph` matching the bound positions
    pub fn matching(
        &self,
        graph: NodeId,
        subject: Option<NodeId>,
        predicate: Option<NodeId>,
        object: Option<NodeId>,
    ) -> Vec<Quad> {
        let (lo, hi) = Quad::graph_bounds(graph);
        self.quads
            .range(lo..=hi)
            .filter(|q| subject.map_or(true, |s| q.subject == s))
            .filter(|q| predicate.map_or(true, |p| q.predicate == p))
            .filter(|q| object.map_or(true, |o| q.object == o))
            .copied()
            .collect()
    }

    /// Graphs holding at least one quad
    pub fn graphs(&self) -> BTreeSet<NodeId> {
        self.quads.iter().map(|q| q.graph).collect()
    }

    /// Remove every quad of `graph`, returning how many there were
    pub fn drop_graph(&mut self, graph: NodeId) -> usize {
        let (lo, hi) = Quad::graph_bounds(graph);
        let doomed: Vec<Quad> = self.quads.range(lo..=hi).copied().collect();
        for quad in &doomed {
            self.quads.remove(quad);
        }
        doomed.len()
    }

    /// Total number of quads
    pub fn len(&self) -> usize {
        self.quads.len()
    }

    /// True if the store holds no quads
    pub fn is_empty(&self) -> bool {
        self.quads.is_empty()
    }
}

/// Quad store type
pub type GraphStore = PhasedStore<GraphState>;

/// A statement as lexical values
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Triple {
    /// Subject value
    pub subject: String,
    /// Predicate value
    pub predicate: String,
    /// Object value
    pub object: String,
}

impl Triple {
    /// Build a triple from anything string-like
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Triple {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }
}

/// A transaction's access to graph content
pub struct GraphResolver {
    pools: Arc<StringPoolHandle>,
    graphs: Arc<PhaseHandle<GraphState>>,
}

impl GraphResolver {
    /// Pair a string pool handle with a quad store handle of the same transaction
    pub fn new(pools: Arc<StringPoolHandle>, graphs: Arc<PhaseHandle<GraphState>>) -> Self {
        GraphResolver { pools, graphs }
    }

    /// True if this resolver can modify graphs
    pub fn is_writable(&self) -> bool {
        self.graphs.is_writable()
    }

    /// Add `triple` to `graph`; false if it was already there
    pub fn insert(&self, graph: &str, triple: &Triple) -> Result<bool> {
        self.require_writable("insert")?;
        let quad = Quad {
            graph: self.pools.localize(graph)?,
            subject: self.pools.localize(&triple.subject)?,
            predicate: self.pools.localize(&triple.predicate)?,
            object: self.pools.localize(&triple.object)?,
        };
        self.graphs.write(|state| state.insert(quad))
    }

    /// Remove `triple` from `graph`; false if it was not there
    pub fn delete(&self, graph: &str, triple: &Triple) -> Result<bool> {
        self.require_writable("delete")?;
        let terms = [
            graph,
            triple.subject.as_str(),
            triple.predicate.as_str(),
            triple.object.as_str(),
        ];
        let mut nodes = Vec::with_capacity(terms.len());
        for term in terms {
            match self.pools.lookup(term)? {
                Some(node) => nodes.push(node),
                None => return Ok(false),
            }
        }
        let quad = Quad {
            graph: nodes[0],
            subject: nodes[1],
            predicate: nodes[2],
            object: nodes[3],
        };
        self.graphs.write(|state| state.remove(&quad))
    }

    /// Triples of `graph` matching the bound positions
    pub fn find(
        &self,
        graph: &str,
        subject: Option<&str>,
        predicate: Option<&str>,
        object: Option<&str>,
    ) -> Result<Vec<Triple>> {
        let Some(graph) = self.pools.lookup(graph)? else {
            return Ok(Vec::new());
        };
        let mut bound = [None; 3];
        for (slot, term) in bound.iter_mut().zip([subject, predicate, object]) {
            if let Some(term) = term {
                match self.pools.lookup(term)? {
                    Some(node) => *slot = Some(node),
                    // An unknown term matches nothing
                    None => return Ok(Vec::new()),
                }
            }
        }
        let quads = self
            .graphs
            .read(|state| state.matching(graph, bound[0], bound[1], bound[2]))?;
        quads
            .into_iter()
            .map(|q| {
                Ok(Triple {
                    subject: self.value(q.subject)?,
                    predicate: self.value(q.predicate)?,
                    object: self.value(q.object)?,
                })
            })
            .collect()
    }

    /// Number of triples in `graph`
    pub fn count(&self, graph: &str) -> Result<usize> {
        match self.pools.lookup(graph)? {
            Some(graph) => self
                .graphs
                .read(|state| state.matching(graph, None, None, None).len()),
            None => Ok(0),
        }
    }

    /// Names of every non-empty graph
    pub fn graphs(&self) -> Result<Vec<String>> {
        let nodes = self.graphs.read(GraphState::graphs)?;
        nodes.into_iter().map(|node| self.value(node)).collect()
    }

    /// Remove every triple of `graph`
    pub fn drop_graph(&self, graph: &str) -> Result<usize> {
        self.require_writable("drop")?;
        match self.pools.lookup(graph)? {
            Some(node) => self.graphs.write(|state| state.drop_graph(node)),
            None => Ok(0),
        }
    }

    /// Allocate a blank node and return its label
    pub fn new_blank_node(&self) -> Result<String> {
        self.require_writable("allocate blank node in")?;
        let node = self.pools.new_blank_node()?;
        Ok(format!("_:b{}", node.as_u64()))
    }

    fn value(&self, node: NodeId) -> Result<String> {
        self.pools.globalize(node)?.ok_or_else(|| {
            QuarryError::resource(GRAPH_STORE, format!("{} has no interned value", node))
        })
    }

    fn require_writable(&self, action: &str) -> Result<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(QuarryError::protocol(format!(
                "attempt to {} graph content in a read-only transaction",
                action
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::PhaseResource;
    use quarry_durability::{NodePool, StringPool, NODE_POOL, STRING_POOL};

    struct Stores {
        strings: Arc<StringPool>,
        nodes: Arc<NodePool>,
        graphs: Arc<GraphStore>,
    }

    fn stores() -> Stores {
        Stores {
            strings: Arc::new(StringPool::in_memory(STRING_POOL, 2)),
            nodes: Arc::new(NodePool::in_memory(NODE_POOL, 2)),
            graphs: Arc::new(GraphStore::in_memory(GRAPH_STORE, 2)),
        }
    }

    fn resolver(stores: &Stores, writable: bool) -> (GraphResolver, Arc<StringPoolHandle>, Arc<PhaseHandle<GraphState>>) {
        let pools = Arc::new(StringPoolHandle::new(
            stores.strings.clone(),
            stores.nodes.clone(),
            writable,
        ));
        let graphs = Arc::new(PhaseHandle::new(stores.graphs.clone(), writable));
        pools.refresh().unwrap();
        graphs.refresh().unwrap();
        (GraphResolver::new(pools.clone(), graphs.clone()), pools, graphs)
    }

    fn commit(pools: &StringPoolHandle, graphs: &PhaseHandle<GraphState>) {
        pools.prepare().unwrap();
        graphs.prepare().unwrap();
        pools.commit().unwrap();
        graphs.commit().unwrap();
        pools.release().unwrap();
        graphs.release().unwrap();
    }

    #[test]
    fn test_insert_find_delete() {
        let s = stores();
        let (r, _, _) = resolver(&s, true);
        let t = Triple::new("ex:alice", "ex:knows", "ex:bob");
        assert!(r.insert("ex:g", &t).unwrap());
        assert!(!r.insert("ex:g", &t).unwrap());
        r.insert("ex:g", &Triple::new("ex:alice", "ex:age", "42")).unwrap();

        assert_eq!(r.find("ex:g", Some("ex:alice"), None, None).unwrap().len(), 2);
        assert_eq!(
            r.find("ex:g", None, Some("ex:knows"), None).unwrap(),
            vec![t.clone()]
        );
        assert!(r.find("ex:g", Some("ex:carol"), None, None).unwrap().is_empty());
        assert!(r.find("ex:other", None, None, None).unwrap().is_empty());

        assert!(r.delete("ex:g", &t).unwrap());
        assert!(!r.delete("ex:g", &t).unwrap());
        assert_eq!(r.count("ex:g").unwrap(), 1);
    }

    #[test]
    fn test_graph_listing_and_drop() {
        let s = stores();
        let (r, _, _) = resolver(&s, true);
        r.insert("ex:g1", &Triple::new("a", "b", "c")).unwrap();
        r.insert("ex:g1", &Triple::new("a", "b", "d")).unwrap();
        r.insert("ex:g2", &Triple::new("a", "b", "c")).unwrap();

        let mut graphs = r.graphs().unwrap();
        graphs.sort();
        assert_eq!(graphs, vec!["ex:g1".to_string(), "ex:g2".to_string()]);

        assert_eq!(r.drop_graph("ex:g1").unwrap(), 2);
        assert_eq!(r.graphs().unwrap(), vec!["ex:g2".to_string()]);
        assert_eq!(r.drop_graph("ex:missing").unwrap(), 0);
    }

    #[test]
    fn test_reader_sees_committed_snapshot_only() {
        let s = stores();
        let (writer, pools, graphs) = resolver(&s, true);
        writer.insert("ex:g", &Triple::new("a", "b", "c")).unwrap();
        commit(&pools, &graphs);

        let (reader, _, _) = resolver(&s, false);
        let (writer, pools, graphs) = resolver(&s, true);
        writer.insert("ex:g", &Triple::new("a", "b", "d")).unwrap();
        commit(&pools, &graphs);

        assert_eq!(reader.count("ex:g").unwrap(), 1);
        let (late, _, _) = resolver(&s, false);
        assert_eq!(late.count("ex:g").unwrap(), 2);
    }

    #[test]
    fn test_reader_cannot_write() {
        let s = stores();
        let (r, _, _) = resolver(&s, false);
        let err = r.insert("ex:g", &Triple::new("a", "b", "c")).unwrap_err();
        assert!(err.is_protocol());
        assert!(r.new_blank_node().is_err());
    }

    #[test]
    fn test_blank_nodes_are_distinct() {
        let s = stores();
        let (r, _, _) = resolver(&s, true);
        let a = r.new_blank_node().unwrap();
        let b = r.new_blank_node().unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("_:b"));
    }
}
