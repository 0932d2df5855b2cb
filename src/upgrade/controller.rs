//! Open request controller
//!
//! Drives one open request from Pending to a terminal state:
//!
//! - target below current: VersionError, nobody is notified. Checked once
//!   before queueing and again once the request has its turn
//! - target equal to current: register a connection and succeed
//! - target above current: needs an upgrade callback, then hands off to
//!   the coordinator, then to the executor
//!
//! Each request takes a ticket on the store's queue when `open` is called,
//! then runs on its own task and waits for that ticket before reading the
//! ledger. The turn is held until the request ends, so at most one request
//! per store is past Pending at a time.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::coordinator::{cancelled, Quiescence, VersionChangeCoordinator};
use super::dispatcher::RequestChannel;
use super::errors::{OpenError, OpenErrorKind, OpenResult};
use super::executor::UpgradeTransactionExecutor;
use super::queue::{StoreQueue, Ticket};
use super::request::{OpenRequest, RequestEvent, UpgradeCallback};
use super::state::RequestState;
use super::trace::{EventTrace, TraceEvent};
use crate::ledger::VersionLedger;
use crate::observability::{Event, Telemetry};
use crate::registry::{
    Connection, ConnectionControl, ConnectionId, ConnectionRegistry, VersionChangeNotice,
};
use crate::storage::StorageEngine;

/// Drives open requests.
pub struct OpenRequestController {
    engine: Arc<dyn StorageEngine>,
    ledger: Arc<VersionLedger>,
    registry: Arc<ConnectionRegistry>,
    queue: StoreQueue,
    coordinator: VersionChangeCoordinator,
    executor: Arc<UpgradeTransactionExecutor>,
    telemetry: Arc<Telemetry>,
    trace: Arc<EventTrace>,
}

impl OpenRequestController {
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        registry: Arc<ConnectionRegistry>,
        telemetry: Arc<Telemetry>,
        trace: Arc<EventTrace>,
    ) -> Self {
        let ledger = Arc::new(VersionLedger::new(Arc::clone(&engine)));
        let coordinator = VersionChangeCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&telemetry),
            Arc::clone(&trace),
        );
        let executor = Arc::new(UpgradeTransactionExecutor::new(
            Arc::clone(&engine),
            Arc::clone(&ledger),
            Arc::clone(&telemetry),
            Arc::clone(&trace),
        ));
        Self {
            engine,
            ledger,
            registry,
            queue: StoreQueue::new(),
            coordinator,
            executor,
            telemetry,
            trace,
        }
    }

    /// Ledger backing this controller.
    pub fn ledger(&self) -> &Arc<VersionLedger> {
        &self.ledger
    }

    /// Whether an upgrade transaction is running for `store`.
    pub fn is_upgrading(&self, store: &str) -> bool {
        self.executor.is_running(store)
    }

    /// Start an open request on a new task and return its handle.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        self: &Arc<Self>,
        name: &str,
        target_version: u64,
        callback: Option<UpgradeCallback>,
    ) -> OpenRequest {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RequestState::Pending);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let request = OpenRequest::new(name, target_version, event_rx, state_rx, cancel_tx);
        let channel = RequestChannel::new(event_tx, state_tx);
        // Taken here, not on the task, so arrival order is call order.
        let ticket = self.queue.reserve(name);

        let controller = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            controller
                .drive(name, target_version, callback, ticket, channel, cancel_rx)
                .await;
        });
        request
    }

    async fn drive(
        self: Arc<Self>,
        name: String,
        target_version: u64,
        callback: Option<UpgradeCallback>,
        ticket: OpenResult<Ticket>,
        mut channel: RequestChannel,
        mut cancel: watch::Receiver<bool>,
    ) {
        let target = target_version.to_string();
        self.telemetry.emit(
            Event::OpenRequested,
            &[("store", &name), ("target_version", &target)],
        );

        match self
            .evaluate(&name, target_version, callback, ticket, &mut channel, &mut cancel)
            .await
        {
            Ok(conn) => self.succeeded(&name, conn, &mut channel),
            Err(err) => self.failed(&name, target_version, err, &mut channel),
        }
    }

    async fn evaluate(
        &self,
        name: &str,
        target_version: u64,
        callback: Option<UpgradeCallback>,
        ticket: OpenResult<Ticket>,
        channel: &mut RequestChannel,
        cancel: &mut watch::Receiver<bool>,
    ) -> OpenResult<Connection> {
        if target_version == 0 {
            return Err(OpenError::Version {
                store: name.to_string(),
                requested: 0,
                current: self.ledger.current_version(name)?,
            });
        }

        // Versions only grow, so a target already below the committed version
        // is rejected without waiting behind requests queued ahead of it.
        let current = self.ledger.current_version(name)?;
        if target_version < current {
            return Err(OpenError::Version {
                store: name.to_string(),
                requested: target_version,
                current,
            });
        }

        let ticket = ticket?;
        let _turn = tokio::select! {
            biased;
            _ = cancelled(cancel) => return Err(abort(name)),
            turn = ticket.admitted() => turn?,
        };
        if *cancel.borrow() {
            return Err(abort(name));
        }

        let current = self.ledger.current_version(name)?;
        if target_version < current {
            return Err(OpenError::Version {
                store: name.to_string(),
                requested: target_version,
                current,
            });
        }
        if target_version == current {
            let conn = self.connect(name, current)?;
            channel.transition(|s| s.open_directly(current))?;
            return Ok(conn);
        }

        let Some(callback) = callback else {
            return Err(OpenError::Configuration {
                store: name.to_string(),
                requested: target_version,
                current,
            });
        };

        let notice = VersionChangeNotice::new(current, target_version);
        channel.transition(|s| s.await_quiescence(current, target_version))?;
        match self
            .coordinator
            .await_quiescence(name, notice, channel, cancel)
            .await?
        {
            Quiescence::Cancelled => return Err(abort(name)),
            Quiescence::Reached { .. } => {}
        }

        channel.transition(|s| s.begin_upgrade())?;
        channel.notify(RequestEvent::UpgradeNeeded(notice));

        let executor = Arc::clone(&self.executor);
        let store = name.to_string();
        tokio::task::spawn_blocking(move || {
            executor.run(&store, current, target_version, callback)
        })
        .await
        .map_err(|e| OpenError::Internal(format!("upgrade task failed: {}", e)))??;

        let conn = self.connect(name, target_version)?;
        channel.transition(|s| s.complete_upgrade())?;
        Ok(conn)
    }

    fn connect(&self, name: &str, version: u64) -> OpenResult<Connection> {
        let id = ConnectionId::new();
        self.registry.register(name, id, version)?;
        let control = ConnectionControl::new(id, name, version, Arc::clone(&self.registry));
        Ok(Connection::new(control, Arc::clone(&self.engine)))
    }

    fn succeeded(&self, name: &str, conn: Connection, channel: &mut RequestChannel) {
        self.trace.record(TraceEvent::Opened {
            store: name.to_string(),
            connection: conn.id(),
            version: conn.version(),
        });
        self.telemetry.metrics().increment_opens_succeeded();
        let id = conn.id().to_string();
        let version = conn.version().to_string();
        self.telemetry.emit(
            Event::StoreOpened,
            &[("store", name), ("connection", &id), ("version", &version)],
        );
        channel.finish(RequestEvent::Succeeded(conn));
    }

    fn failed(
        &self,
        name: &str,
        target_version: u64,
        err: OpenError,
        channel: &mut RequestChannel,
    ) {
        let kind = err.kind();
        // A request that is already terminal keeps its published state.
        let _ = channel.transition(|s| match kind {
            OpenErrorKind::Abort => s.cancel(),
            _ => s.fail(kind),
        });

        self.trace.record(TraceEvent::Failed {
            store: name.to_string(),
            kind,
        });
        let metrics = self.telemetry.metrics();
        metrics.increment_opens_failed();
        if kind == OpenErrorKind::Abort {
            metrics.increment_cancellations();
        }

        let event = match kind {
            OpenErrorKind::Abort => Event::OpenAborted,
            OpenErrorKind::Version | OpenErrorKind::Configuration => Event::OpenRejected,
            _ => Event::OpenFailed,
        };
        let target = target_version.to_string();
        let message = err.to_string();
        self.telemetry.emit(
            event,
            &[
                ("store", name),
                ("target_version", &target),
                ("error_code", kind.code()),
                ("message", &message),
            ],
        );
        channel.finish(RequestEvent::Failed(err));
    }
}

fn abort(name: &str) -> OpenError {
    OpenError::Abort {
        store: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryEngine;
    use crate::upgrade::request::upgrade_callback;

    fn controller() -> Arc<OpenRequestController> {
        let telemetry = Arc::new(Telemetry::silent());
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&telemetry)));
        Arc::new(OpenRequestController::new(
            Arc::new(MemoryEngine::new()),
            registry,
            telemetry,
            Arc::new(EventTrace::new()),
        ))
    }

    #[tokio::test]
    async fn test_version_zero_is_rejected() {
        let controller = controller();
        let err = controller.open("db", 0, None).outcome().await.unwrap_err();
        assert_eq!(err.kind(), OpenErrorKind::Version);
    }

    #[tokio::test]
    async fn test_create_then_reopen_at_same_version() {
        let controller = controller();
        let first = controller
            .open("db", 1, Some(upgrade_callback(|_, _, _| Ok(()))))
            .outcome()
            .await
            .unwrap();
        assert_eq!(first.version(), 1);

        let mut request = controller.open("db", 1, None);
        let event = request.next_event().await.unwrap();
        assert_eq!(event.name(), "success");
        assert_eq!(request.state(), RequestState::Succeeded { version: 1 });
        assert_eq!(controller.ledger().current_version("db").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upgrade_without_callback_is_configuration_error() {
        let controller = controller();
        let mut request = controller.open("db", 1, None);
        match request.next_event().await.unwrap() {
            RequestEvent::Failed(err) => assert_eq!(err.kind(), OpenErrorKind::Configuration),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            request.state(),
            RequestState::Failed {
                kind: OpenErrorKind::Configuration
            }
        );
    }

    #[tokio::test]
    async fn test_upgrade_emits_upgrade_needed_before_success() {
        let controller = controller();
        let mut request = controller.open("db", 1, Some(upgrade_callback(|_, _, _| Ok(()))));
        let mut names = Vec::new();
        while let Some(event) = request.next_event().await {
            names.push(event.name());
        }
        assert_eq!(names, vec!["upgradeneeded", "success"]);
        assert!(!controller.is_upgrading("db"));
    }

    #[tokio::test]
    async fn test_cancel_while_queued_ends_as_abort() {
        let controller = controller();
        let turn = controller.queue.acquire("db").await.unwrap();
        let mut request = controller.open("db", 1, Some(upgrade_callback(|_, _, _| Ok(()))));
        request.cancel();

        match request.next_event().await.unwrap() {
            RequestEvent::Failed(err) => assert_eq!(err.kind(), OpenErrorKind::Abort),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            request.state(),
            RequestState::Failed {
                kind: OpenErrorKind::Abort
            }
        );
        drop(turn);
        assert_eq!(controller.ledger().current_version("db").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lower_version_rejected_while_store_is_queued() {
        let controller = controller();
        controller
            .open("db", 2, Some(upgrade_callback(|_, _, _| Ok(()))))
            .outcome()
            .await
            .unwrap();

        let turn = controller.queue.acquire("db").await.unwrap();
        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            controller.open("db", 1, None).outcome(),
        )
        .await
        .expect("lower version must not wait for the queue");
        assert_eq!(outcome.unwrap_err().kind(), OpenErrorKind::Version);

        drop(turn);
        assert!(!controller.queue.is_busy("db"));
    }
}
