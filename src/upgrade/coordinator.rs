//! Version change coordination
//!
//! Runs the handshake between an upgrading request and the connections
//! already open on its store:
//!
//! 1. subscribe to the store's registry changes
//! 2. deliver the notice to every Active connection bound below the target
//! 3. check for open connections below the target; if any remain, publish
//!    Blocked once
//! 4. wait for a registry change or a cancel, then check again
//!
//! The coordinator never closes connections itself and never times out.
//! Subscribing before the first check means a close that lands between a
//! check and the wait still wakes the waiter.

use std::sync::Arc;

use tokio::sync::watch;

use super::dispatcher::{EventDispatcher, RequestChannel};
use super::errors::{OpenError, OpenResult};
use super::request::RequestEvent;
use super::state::RequestState;
use super::trace::{EventTrace, TraceEvent};
use crate::observability::{Event, Telemetry};
use crate::registry::{ConnectionRegistry, RegistryError, VersionChangeNotice};

/// How a wait for quiescence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quiescence {
    /// No connection remains open below the target
    Reached {
        /// Whether the request was blocked on the way
        blocked: bool,
    },
    /// The caller cancelled the request
    Cancelled,
}

/// Coordinates one store's version transition with its open connections.
pub struct VersionChangeCoordinator {
    registry: Arc<ConnectionRegistry>,
    dispatcher: EventDispatcher,
    telemetry: Arc<Telemetry>,
    trace: Arc<EventTrace>,
}

impl VersionChangeCoordinator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        telemetry: Arc<Telemetry>,
        trace: Arc<EventTrace>,
    ) -> Self {
        let dispatcher = EventDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&telemetry),
            Arc::clone(&trace),
        );
        Self {
            registry,
            dispatcher,
            telemetry,
            trace,
        }
    }

    /// Notify older connections and wait until none is open.
    ///
    /// The request must be in AwaitingQuiescence. On return it is either
    /// still there or Blocked; the caller moves it on.
    pub(crate) async fn await_quiescence(
        &self,
        store: &str,
        notice: VersionChangeNotice,
        channel: &mut RequestChannel,
        cancel: &mut watch::Receiver<bool>,
    ) -> OpenResult<Quiescence> {
        let mut changes = self.registry.subscribe(store)?;

        let targets: Vec<_> = self
            .registry
            .list_active(store)?
            .into_iter()
            .filter(|conn| conn.bound_version < notice.new_version)
            .collect();
        self.dispatcher
            .deliver_version_change(store, &targets, notice)?;

        let mut blocked = false;
        loop {
            if *cancel.borrow_and_update() {
                return Ok(Quiescence::Cancelled);
            }

            changes.borrow_and_update();
            let open = self.registry.open_below(store, notice.new_version)?;
            if open.is_empty() {
                return Ok(Quiescence::Reached { blocked });
            }

            if !blocked {
                blocked = true;
                self.publish_blocked(store, notice, open.len(), channel)?;
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(OpenError::Registry(RegistryError::unavailable()));
                    }
                }
                _ = cancelled(cancel) => return Ok(Quiescence::Cancelled),
            }
        }
    }

    fn publish_blocked(
        &self,
        store: &str,
        notice: VersionChangeNotice,
        open: usize,
        channel: &mut RequestChannel,
    ) -> OpenResult<()> {
        if !matches!(channel.state(), RequestState::AwaitingQuiescence { .. }) {
            return Ok(());
        }
        channel.transition(|s| s.block())?;
        channel.notify(RequestEvent::Blocked(notice));

        self.trace.record(TraceEvent::Blocked {
            store: store.to_string(),
            old_version: notice.old_version,
            new_version: notice.new_version,
        });
        self.telemetry.metrics().increment_blocked_events();
        let old_version = notice.old_version.to_string();
        let new_version = notice.new_version.to_string();
        let open = open.to_string();
        self.telemetry.emit(
            Event::UpgradeBlocked,
            &[
                ("store", store),
                ("old_version", &old_version),
                ("new_version", &new_version),
                ("open_connections", &open),
            ],
        );
        Ok(())
    }
}

/// Resolves once the cancel flag is set or its sender is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionControl, ConnectionId};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        coordinator: VersionChangeCoordinator,
        trace: Arc<EventTrace>,
    }

    fn harness() -> Harness {
        let telemetry = Arc::new(Telemetry::silent());
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&telemetry)));
        let trace = Arc::new(EventTrace::new());
        let coordinator =
            VersionChangeCoordinator::new(Arc::clone(&registry), telemetry, Arc::clone(&trace));
        Harness {
            registry,
            coordinator,
            trace,
        }
    }

    fn channel() -> (
        RequestChannel,
        mpsc::UnboundedReceiver<RequestEvent>,
        watch::Sender<bool>,
        watch::Receiver<bool>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(RequestState::Pending);
        let channel = RequestChannel::new(event_tx, state_tx);
        channel.transition(|s| s.await_quiescence(1, 2)).unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (channel, event_rx, cancel_tx, cancel_rx)
    }

    #[tokio::test]
    async fn test_no_connections_reaches_quiescence_without_block() {
        let h = harness();
        let (mut channel, _events, _cancel_tx, mut cancel) = channel();

        let outcome = h
            .coordinator
            .await_quiescence("db", VersionChangeNotice::new(1, 2), &mut channel, &mut cancel)
            .await
            .unwrap();

        assert_eq!(outcome, Quiescence::Reached { blocked: false });
        assert!(h.trace.is_empty());
    }

    #[tokio::test]
    async fn test_listener_close_prevents_block() {
        let h = harness();
        let id = ConnectionId::new();
        h.registry.register("db", id, 1).unwrap();
        h.registry
            .add_listener(
                id,
                Arc::new(|_: &VersionChangeNotice, control: &ConnectionControl| {
                    control.close();
                }),
            )
            .unwrap();
        let (mut channel, _events, _cancel_tx, mut cancel) = channel();

        let outcome = h
            .coordinator
            .await_quiescence("db", VersionChangeNotice::new(1, 2), &mut channel, &mut cancel)
            .await
            .unwrap();

        assert_eq!(outcome, Quiescence::Reached { blocked: false });
        assert_eq!(channel.state().state_name(), "AwaitingQuiescence");
    }

    #[tokio::test]
    async fn test_open_connection_blocks_until_closed() {
        let h = harness();
        let id = ConnectionId::new();
        h.registry.register("db", id, 1).unwrap();
        let (mut channel, mut events, _cancel_tx, mut cancel) = channel();

        let registry = Arc::clone(&h.registry);
        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry.close(id).unwrap();
        });

        let outcome = h
            .coordinator
            .await_quiescence("db", VersionChangeNotice::new(1, 2), &mut channel, &mut cancel)
            .await
            .unwrap();
        closer.await.unwrap();

        assert_eq!(outcome, Quiescence::Reached { blocked: true });
        assert_eq!(channel.state().state_name(), "Blocked");
        assert_eq!(events.recv().await.unwrap().name(), "blocked");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_releases_waiter() {
        let h = harness();
        h.registry.register("db", ConnectionId::new(), 1).unwrap();
        let (mut channel, _events, cancel_tx, mut cancel) = channel();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_tx.send_replace(true);
        });

        let outcome = h
            .coordinator
            .await_quiescence("db", VersionChangeNotice::new(1, 2), &mut channel, &mut cancel)
            .await
            .unwrap();

        assert_eq!(outcome, Quiescence::Cancelled);
        assert_eq!(h.registry.list_open("db").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connections_at_target_do_not_block() {
        let h = harness();
        h.registry.register("db", ConnectionId::new(), 2).unwrap();
        let (mut channel, _events, _cancel_tx, mut cancel) = channel();

        let outcome = h
            .coordinator
            .await_quiescence("db", VersionChangeNotice::new(1, 2), &mut channel, &mut cancel)
            .await
            .unwrap();

        assert_eq!(outcome, Quiescence::Reached { blocked: false });
    }
}
