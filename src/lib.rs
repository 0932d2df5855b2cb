//! vstore - an embedded, versioned object store
//!
//! Every store has exactly one schema version. Opening a store above its
//! version quiesces older connections, runs the caller's migration as one
//! isolated transaction, and commits the writes together with the new
//! version. `StoreFactory` is the entry point.

pub mod cli;
pub mod config;
pub mod factory;
pub mod ledger;
pub mod observability;
pub mod registry;
pub mod storage;
pub mod transaction;
pub mod upgrade;

pub use config::{EngineConfig, EngineKind};
pub use factory::StoreFactory;
pub use registry::{
    Connection, ConnectionControl, ConnectionId, ConnectionState, VersionChangeNotice,
};
pub use storage::TransactionMode;
pub use transaction::{Transaction, TransactionError, TransactionResult};
pub use upgrade::{OpenError, OpenErrorKind, OpenRequest, RequestEvent, RequestState, UpgradeError};
