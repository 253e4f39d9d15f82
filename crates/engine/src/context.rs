//! Operation context binding a transaction to the database stores
//!
//! On activation a transaction calls `initiate`, which builds the
//! transaction's phase handles, wraps them in a phase session and enlists
//! that session. Operations reach graph content through [`resolver`].
//! `clear` drops everything when the transaction terminates.
//!
//! [`resolver`]: DatabaseOperationContext::resolver

use crate::database::Stores;
use crate::resolver::GraphResolver;
use parking_lot::Mutex;
use quarry_concurrency::{Enlister, OperationContext};
use quarry_core::{Enlistable, PhaseResource, QuarryError, Result};
use quarry_durability::{PhaseHandle, PhaseSession, PhaseSessionResource, StringPoolHandle};
use std::sync::Arc;
use tracing::trace;

struct Active {
    resolver: Arc<GraphResolver>,
    resource: Arc<PhaseSessionResource>,
}

/// Per-transaction view of the database
pub struct DatabaseOperationContext {
    stores: Arc<Stores>,
    write: bool,
    active: Mutex<Option<Active>>,
}

impl DatabaseOperationContext {
    /// Context for a read or write transaction over `stores`
    pub fn new(stores: Arc<Stores>, write: bool) -> Arc<Self> {
        Arc::new(DatabaseOperationContext {
            stores,
            write,
            active: Mutex::new(None),
        })
    }

    /// True if the transaction may modify the stores
    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Graph access for the current transaction
    pub fn resolver(&self) -> Result<Arc<GraphResolver>> {
        self.active
            .lock()
            .as_ref()
            .map(|a| Arc::clone(&a.resolver))
            .ok_or_else(|| QuarryError::protocol("no transaction has initiated this context"))
    }

    /// Participant holding the content of `graph`
    ///
    /// Every graph lives in the quad store, so all graphs share the one
    /// phase session resource.
    pub fn active_resource_for(&self, graph: &str) -> Result<Arc<dyn Enlistable>> {
        self.active
            .lock()
            .as_ref()
            .map(|a| Arc::clone(&a.resource) as Arc<dyn Enlistable>)
            .ok_or_else(|| {
                QuarryError::protocol(format!("no active resource for graph {}", graph))
            })
    }
}

impl OperationContext for DatabaseOperationContext {
    fn initiate(&self, txn: Arc<dyn Enlister>) -> Result<()> {
        let pools = Arc::new(StringPoolHandle::new(
            Arc::clone(self.stores.strings()),
            Arc::clone(self.stores.nodes()),
            self.write,
        ));
        let graphs = Arc::new(PhaseHandle::new(Arc::clone(self.stores.graphs()), self.write));
        let mut peers: Vec<Arc<dyn PhaseResource>> =
            vec![Arc::clone(&graphs) as Arc<dyn PhaseResource>];
        if self.write {
            peers.extend(self.stores.participants().iter().cloned());
        }
        let session = Arc::new(PhaseSession::new(
            Arc::clone(&pools),
            Arc::clone(self.stores.locks()),
        ));
        let resource = Arc::new(PhaseSessionResource::new(session, peers));

        *self.active.lock() = Some(Active {
            resolver: Arc::new(GraphResolver::new(pools, graphs)),
            resource: Arc::clone(&resource),
        });
        trace!(target: "quarry::txn", txn_id = %txn.transaction_id(), write = self.write, "Initiated operation context");
        if let Err(e) = txn.enlist(resource) {
            *self.active.lock() = None;
            return Err(e);
        }
        Ok(())
    }

    fn clear(&self) {
        self.active.lock().take();
    }
}
