//! Open and upgrade coordination
//!
//! An open request targets a version. Opening at the current version is a
//! plain registration. Opening above it runs a version change:
//!
//! 1. every Active connection bound below the target gets a notice
//! 2. the request waits until no connection below the target is open,
//!    reporting Blocked once if it has to wait
//! 3. the caller's migration runs as one isolated transaction whose
//!    writes and new version commit together, or not at all
//!
//! Requests for one store are evaluated one at a time, in arrival order.
//! Stores are independent.

mod controller;
mod coordinator;
mod dispatcher;
mod errors;
mod executor;
mod queue;
mod request;
mod state;
mod trace;

pub use controller::OpenRequestController;
pub use coordinator::{Quiescence, VersionChangeCoordinator};
pub use dispatcher::{DispatchResult, EventDispatcher};
pub use errors::{OpenError, OpenErrorKind, OpenResult, UpgradeError};
pub use executor::UpgradeTransactionExecutor;
pub use queue::{StoreQueue, StoreTurn, Ticket};
pub use request::{upgrade_callback, OpenRequest, RequestEvent, UpgradeCallback};
pub use state::RequestState;
pub use trace::{EventTrace, TraceEvent, TraceRecord, DEFAULT_TRACE_CAPACITY};
