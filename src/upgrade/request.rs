//! Open request handle
//!
//! `OpenRequest` is what the caller holds while an open runs in the
//! background. Events arrive in generation order: at most one `Blocked`,
//! then `UpgradeNeeded` if an upgrade runs, then exactly one terminal
//! `Succeeded` or `Failed`. Dropping the handle cancels the request if it
//! has not started upgrading.

use std::fmt;

use tokio::sync::{mpsc, watch};

use super::errors::{OpenError, UpgradeError};
use super::state::RequestState;
use crate::registry::{Connection, VersionChangeNotice};
use crate::transaction::Transaction;

/// Migration logic run inside the upgrade transaction as `(tx, old, new)`.
pub type UpgradeCallback =
    Box<dyn FnOnce(&mut Transaction, u64, u64) -> Result<(), UpgradeError> + Send + 'static>;

/// Box a closure as an `UpgradeCallback`.
pub fn upgrade_callback<F>(callback: F) -> UpgradeCallback
where
    F: FnOnce(&mut Transaction, u64, u64) -> Result<(), UpgradeError> + Send + 'static,
{
    Box::new(callback)
}

/// Event delivered to the caller of an open request.
pub enum RequestEvent {
    /// Older connections stayed open after the notices went out
    Blocked(VersionChangeNotice),
    /// The upgrade transaction is about to run
    UpgradeNeeded(VersionChangeNotice),
    /// The store is open
    Succeeded(Connection),
    /// The request failed
    Failed(OpenError),
}

impl RequestEvent {
    /// Event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Blocked(_) => "blocked",
            Self::UpgradeNeeded(_) => "upgradeneeded",
            Self::Succeeded(_) => "success",
            Self::Failed(_) => "error",
        }
    }

    /// Whether this event ends the request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_))
    }
}

impl fmt::Debug for RequestEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked(notice) => f.debug_tuple("Blocked").field(notice).finish(),
            Self::UpgradeNeeded(notice) => f.debug_tuple("UpgradeNeeded").field(notice).finish(),
            Self::Succeeded(conn) => f.debug_tuple("Succeeded").field(conn).finish(),
            Self::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
        }
    }
}

/// Caller's handle to an in-flight open.
pub struct OpenRequest {
    store: String,
    target_version: u64,
    events: mpsc::UnboundedReceiver<RequestEvent>,
    state: watch::Receiver<RequestState>,
    cancel: watch::Sender<bool>,
    finished: bool,
}

impl OpenRequest {
    pub(crate) fn new(
        store: &str,
        target_version: u64,
        events: mpsc::UnboundedReceiver<RequestEvent>,
        state: watch::Receiver<RequestState>,
        cancel: watch::Sender<bool>,
    ) -> Self {
        Self {
            store: store.to_string(),
            target_version,
            events,
            state,
            cancel,
            finished: false,
        }
    }

    /// Store being opened.
    pub fn store(&self) -> &str {
        &self.store
    }

    /// Requested version.
    pub fn target_version(&self) -> u64 {
        self.target_version
    }

    /// Latest published state.
    pub fn state(&self) -> RequestState {
        *self.state.borrow()
    }

    /// Wait until the request reaches a state matching `predicate`, and
    /// return it. Returns the last state if the request ends first.
    pub async fn wait_for_state<F>(&mut self, predicate: F) -> RequestState
    where
        F: Fn(&RequestState) -> bool,
    {
        let reached = self
            .state
            .wait_for(|s| predicate(s) || s.is_terminal())
            .await
            .map(|s| *s);
        reached.unwrap_or_else(|_| *self.state.borrow())
    }

    /// Ask the request to stop. Honored while Pending, AwaitingQuiescence
    /// or Blocked; ignored once the upgrade transaction has started.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Next event, in generation order. `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<RequestEvent> {
        if self.finished {
            return None;
        }
        match self.events.recv().await {
            Some(event) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Some(event)
            }
            None => {
                self.finished = true;
                Some(RequestEvent::Failed(OpenError::Internal(format!(
                    "open request for '{}' ended without an outcome",
                    self.store
                ))))
            }
        }
    }

    /// Drain events to the terminal outcome.
    pub async fn outcome(mut self) -> Result<Connection, OpenError> {
        while let Some(event) = self.next_event().await {
            match event {
                RequestEvent::Succeeded(conn) => return Ok(conn),
                RequestEvent::Failed(err) => return Err(err),
                RequestEvent::Blocked(_) | RequestEvent::UpgradeNeeded(_) => {}
            }
        }
        Err(OpenError::Internal(format!(
            "open request for '{}' was already finished",
            self.store
        )))
    }
}

impl Drop for OpenRequest {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel.send_replace(true);
        }
    }
}

impl fmt::Debug for OpenRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenRequest")
            .field("store", &self.store)
            .field("target_version", &self.target_version)
            .field("state", &self.state())
            .finish()
    }
}
