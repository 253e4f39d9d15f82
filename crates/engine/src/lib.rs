//! Database engine for Quarry
//!
//! This crate ties the lower layers together:
//! - Database: open, startup recovery, configuration
//! - Session: dual-mode transaction control and graph operations
//! - InternalFactory / ExternalFactory: per-session transaction factories
//! - SessionXaResource: the resource handle outside transaction managers drive
//! - DatabaseOperationContext: binds a transaction to the phased stores
//! - GraphResolver: quad storage over interned nodes

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod database;
pub mod factory;
pub mod resolver;
pub mod session;
pub mod xa_resource;

pub use context::DatabaseOperationContext;
pub use database::{Database, DatabaseBuilder, QuarryConfig, Stores, CONFIG_FILE_NAME};
pub use factory::{Bound, ExternalFactory, InternalFactory, SessionTimeouts};
pub use resolver::{GraphResolver, GraphState, GraphStore, Quad, Triple, GRAPH_STORE};
pub use session::{Session, TransactionHandle};
pub use xa_resource::SessionXaResource;
