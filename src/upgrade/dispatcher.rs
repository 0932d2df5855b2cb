//! Event dispatch
//!
//! Two delivery paths, both strictly ordered:
//! - version-change notices to existing connections, one connection at a
//!   time, each listener running to completion before the next one starts
//! - request events to the caller that issued an open request, through a
//!   single FIFO channel that refuses anything after the terminal event
//!
//! Delivery for different stores may run concurrently; each request task
//! drives its own dispatch.
//!
//! A listener that panics is contained. The panic is logged and delivery
//! carries on with the next listener and the next connection.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::errors::OpenResult;
use super::request::RequestEvent;
use super::state::RequestState;
use super::trace::{EventTrace, TraceEvent};
use crate::observability::{Event, Telemetry};
use crate::registry::{
    ConnectionControl, ConnectionRegistry, ConnectionSnapshot, ConnectionState, RegistryResult,
    VersionChangeNotice,
};

/// Result of delivering one notice round
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchResult {
    /// Connections the notice was addressed to
    pub matched: usize,
    /// Connections that were still Active and received it
    pub delivered: usize,
    /// Connections that had already started closing
    pub skipped: usize,
    /// Listener invocations that panicked
    pub failed: usize,
}

/// Delivers version-change notices to registered connections.
pub struct EventDispatcher {
    registry: Arc<ConnectionRegistry>,
    telemetry: Arc<Telemetry>,
    trace: Arc<EventTrace>,
}

impl EventDispatcher {
    /// Create a dispatcher over a registry.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        telemetry: Arc<Telemetry>,
        trace: Arc<EventTrace>,
    ) -> Self {
        Self {
            registry,
            telemetry,
            trace,
        }
    }

    /// Deliver `notice` to each target in order.
    ///
    /// Listeners run synchronously with no registry lock held, so a listener
    /// may close its own connection before this returns.
    pub fn deliver_version_change(
        &self,
        store: &str,
        targets: &[ConnectionSnapshot],
        notice: VersionChangeNotice,
    ) -> RegistryResult<DispatchResult> {
        let mut result = DispatchResult {
            matched: targets.len(),
            ..DispatchResult::default()
        };

        for target in targets {
            if self.registry.state(target.id)? != ConnectionState::Active {
                result.skipped += 1;
                continue;
            }

            let listeners = self.registry.listeners(target.id)?;
            let control = ConnectionControl::new(
                target.id,
                store,
                target.bound_version,
                Arc::clone(&self.registry),
            );
            for listener in listeners {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(&notice, &control)));
                if outcome.is_err() {
                    result.failed += 1;
                    let connection = target.id.to_string();
                    self.telemetry.emit(
                        Event::ListenerFailed,
                        &[("store", store), ("connection", &connection)],
                    );
                }
            }

            result.delivered += 1;
            self.trace.record(TraceEvent::NoticeDelivered {
                store: store.to_string(),
                connection: target.id,
                old_version: notice.old_version,
                new_version: notice.new_version,
            });
            let connection = target.id.to_string();
            let old_version = notice.old_version.to_string();
            let new_version = notice.new_version.to_string();
            self.telemetry.emit(
                Event::VersionChangeDelivered,
                &[
                    ("store", store),
                    ("connection", &connection),
                    ("old_version", &old_version),
                    ("new_version", &new_version),
                ],
            );
        }

        self.telemetry
            .metrics()
            .add_notices_delivered(result.delivered as u64);
        Ok(result)
    }
}

/// Task-side end of an open request: publishes state and queues events.
pub(crate) struct RequestChannel {
    events: mpsc::UnboundedSender<RequestEvent>,
    state: watch::Sender<RequestState>,
    finished: bool,
}

impl RequestChannel {
    pub(crate) fn new(
        events: mpsc::UnboundedSender<RequestEvent>,
        state: watch::Sender<RequestState>,
    ) -> Self {
        Self {
            events,
            state,
            finished: false,
        }
    }

    /// Current request state.
    pub(crate) fn state(&self) -> RequestState {
        *self.state.borrow()
    }

    /// Apply a checked transition and publish the new state.
    pub(crate) fn transition<F>(&self, step: F) -> OpenResult<RequestState>
    where
        F: FnOnce(RequestState) -> OpenResult<RequestState>,
    {
        let next = step(self.state())?;
        self.state.send_replace(next);
        Ok(next)
    }

    /// Queue a non-terminal event. Dropped once the request has finished.
    pub(crate) fn notify(&self, event: RequestEvent) {
        if self.finished || event.is_terminal() {
            return;
        }
        // A caller that dropped its handle no longer listens.
        let _ = self.events.send(event);
    }

    /// Queue the terminal event. Only the first one is sent.
    pub(crate) fn finish(&mut self, event: RequestEvent) {
        if self.finished || !event.is_terminal() {
            return;
        }
        self.finished = true;
        // An undelivered connection is dropped here, which closes it.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionId;
    use crate::upgrade::errors::OpenError;
    use std::sync::Mutex;

    fn setup() -> (Arc<ConnectionRegistry>, Arc<EventTrace>, EventDispatcher) {
        let telemetry = Arc::new(Telemetry::silent());
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&telemetry)));
        let trace = Arc::new(EventTrace::new());
        let dispatcher = EventDispatcher::new(Arc::clone(&registry), telemetry, Arc::clone(&trace));
        (registry, trace, dispatcher)
    }

    #[test]
    fn test_notices_reach_listeners_in_target_order() {
        let (registry, trace, dispatcher) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ids = [ConnectionId::new(), ConnectionId::new()];
        for id in ids {
            registry.register("db", id, 1).unwrap();
            let sink = Arc::clone(&seen);
            registry
                .add_listener(
                    id,
                    Arc::new(move |notice: &VersionChangeNotice, control: &ConnectionControl| {
                        sink.lock().unwrap().push((control.id(), *notice));
                    }),
                )
                .unwrap();
        }

        let targets = registry.list_active("db").unwrap();
        let notice = VersionChangeNotice::new(1, 2);
        let result = dispatcher
            .deliver_version_change("db", &targets, notice)
            .unwrap();

        assert_eq!(result.delivered, 2);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[(ids[0], notice), (ids[1], notice)]
        );
        assert_eq!(trace.events_for("db").len(), 2);
    }

    #[test]
    fn test_listener_closing_a_later_target_skips_it() {
        let (registry, _trace, dispatcher) = setup();
        let first = ConnectionId::new();
        let second = ConnectionId::new();
        registry.register("db", first, 1).unwrap();
        registry.register("db", second, 1).unwrap();
        let closer = Arc::clone(&registry);
        registry
            .add_listener(
                first,
                Arc::new(move |_: &VersionChangeNotice, _: &ConnectionControl| {
                    closer.close(second).unwrap();
                }),
            )
            .unwrap();

        let targets = registry.list_active("db").unwrap();
        let result = dispatcher
            .deliver_version_change("db", &targets, VersionChangeNotice::new(1, 2))
            .unwrap();

        assert_eq!(result.matched, 2);
        assert_eq!(result.delivered, 1);
        assert_eq!(result.skipped, 1);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_delivery() {
        let (registry, trace, dispatcher) = setup();
        let first = ConnectionId::new();
        let second = ConnectionId::new();
        registry.register("db", first, 1).unwrap();
        registry.register("db", second, 1).unwrap();
        registry
            .add_listener(
                first,
                Arc::new(|_: &VersionChangeNotice, _: &ConnectionControl| {
                    panic!("listener bug");
                }),
            )
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry
            .add_listener(
                second,
                Arc::new(move |notice: &VersionChangeNotice, control: &ConnectionControl| {
                    sink.lock().unwrap().push((control.id(), *notice));
                    control.close();
                }),
            )
            .unwrap();

        let targets = registry.list_active("db").unwrap();
        let notice = VersionChangeNotice::new(1, 2);
        let result = dispatcher
            .deliver_version_change("db", &targets, notice)
            .unwrap();

        assert_eq!(result.delivered, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(seen.lock().unwrap().as_slice(), &[(second, notice)]);
        assert_eq!(registry.state(second).unwrap(), ConnectionState::Closed);
        assert_eq!(registry.state(first).unwrap(), ConnectionState::Active);
        assert_eq!(trace.events_for("db").len(), 2);
    }

    #[tokio::test]
    async fn test_request_channel_sends_one_terminal_event() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (state_tx, _state_rx) = watch::channel(RequestState::Pending);
        let mut channel = RequestChannel::new(event_tx, state_tx);

        channel.notify(RequestEvent::Blocked(VersionChangeNotice::new(1, 2)));
        channel.finish(RequestEvent::Failed(OpenError::Internal("first".into())));
        channel.finish(RequestEvent::Failed(OpenError::Internal("second".into())));
        channel.notify(RequestEvent::UpgradeNeeded(VersionChangeNotice::new(1, 2)));
        drop(channel);

        let mut names = Vec::new();
        while let Some(event) = event_rx.recv().await {
            names.push(event.name());
        }
        assert_eq!(names, vec!["blocked", "error"]);
    }

    #[test]
    fn test_transition_publishes_state() {
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RequestState::Pending);
        let channel = RequestChannel::new(event_tx, state_tx);

        channel.transition(|s| s.await_quiescence(1, 2)).unwrap();
        assert_eq!(state_rx.borrow().state_name(), "AwaitingQuiescence");
        assert!(channel.transition(|s| s.complete_upgrade()).is_err());
        assert_eq!(channel.state().state_name(), "AwaitingQuiescence");
    }
}
