//! Per-store request queue
//!
//! Every open request for a store takes a ticket on that store's lane when
//! it is issued, and waits for the ticket to be served before it looks at
//! the ledger. Tickets are served in issue order, so requests are evaluated
//! in arrival order and a request never sees a version change that is half
//! done. Different stores never share a lane.
//!
//! A ticket dropped before it is served is skipped; the turn passes to the
//! next live ticket without waiting for it.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use super::errors::{OpenError, OpenResult};

fn unavailable() -> OpenError {
    OpenError::Internal("store queue unavailable".to_string())
}

#[derive(Debug, Default)]
struct LaneState {
    next_ticket: u64,
    abandoned: BTreeSet<u64>,
}

#[derive(Debug)]
struct Lane {
    state: Mutex<LaneState>,
    serving: watch::Sender<u64>,
}

impl Lane {
    fn new() -> Self {
        let (serving, _) = watch::channel(0);
        Self {
            state: Mutex::new(LaneState::default()),
            serving,
        }
    }

    /// Move the turn past `ticket`, skipping abandoned tickets.
    fn advance(&self, state: &mut LaneState, ticket: u64) {
        let mut next = ticket + 1;
        while state.abandoned.remove(&next) {
            next += 1;
        }
        self.serving.send_replace(next);
    }

    fn release(&self, ticket: u64) {
        if let Ok(mut state) = self.state.lock() {
            self.advance(&mut state, ticket);
        }
    }

    fn abandon(&self, ticket: u64) {
        if let Ok(mut state) = self.state.lock() {
            let serving = *self.serving.borrow();
            if serving == ticket {
                self.advance(&mut state, ticket);
            } else {
                state.abandoned.insert(ticket);
            }
        }
    }
}

/// A place in a store's lane. Dropping it gives up the place.
#[derive(Debug)]
pub struct Ticket {
    store: String,
    number: u64,
    lane: Option<Arc<Lane>>,
}

impl Ticket {
    /// Store this ticket belongs to.
    pub fn store(&self) -> &str {
        &self.store
    }

    /// Wait until every earlier ticket on the lane is done.
    pub async fn admitted(mut self) -> OpenResult<StoreTurn> {
        let lane = self.lane.as_ref().map(Arc::clone).ok_or_else(unavailable)?;
        let mut serving = lane.serving.subscribe();
        let number = self.number;
        serving
            .wait_for(|s| *s == number)
            .await
            .map_err(|_| unavailable())?;

        self.lane = None;
        Ok(StoreTurn {
            store: std::mem::take(&mut self.store),
            number,
            lane,
        })
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(lane) = self.lane.take() {
            lane.abandon(self.number);
        }
    }
}

/// Exclusive turn on one store. Released on drop.
#[derive(Debug)]
pub struct StoreTurn {
    store: String,
    number: u64,
    lane: Arc<Lane>,
}

impl StoreTurn {
    /// Store this turn belongs to.
    pub fn store(&self) -> &str {
        &self.store
    }
}

impl Drop for StoreTurn {
    fn drop(&mut self) {
        self.lane.release(self.number);
    }
}

/// FIFO lanes keyed by store name.
#[derive(Debug, Default)]
pub struct StoreQueue {
    lanes: Mutex<HashMap<String, Arc<Lane>>>,
}

impl StoreQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&self, store: &str) -> OpenResult<Arc<Lane>> {
        let mut lanes = self.lanes.lock().map_err(|_| unavailable())?;
        Ok(Arc::clone(
            lanes
                .entry(store.to_string())
                .or_insert_with(|| Arc::new(Lane::new())),
        ))
    }

    /// Take the next ticket on a store's lane. Does not wait.
    pub fn reserve(&self, store: &str) -> OpenResult<Ticket> {
        let lane = self.lane(store)?;
        let number = {
            let mut state = lane.state.lock().map_err(|_| unavailable())?;
            let number = state.next_ticket;
            state.next_ticket += 1;
            number
        };
        Ok(Ticket {
            store: store.to_string(),
            number,
            lane: Some(lane),
        })
    }

    /// Take a ticket and wait for its turn.
    pub async fn acquire(&self, store: &str) -> OpenResult<StoreTurn> {
        self.reserve(store)?.admitted().await
    }

    /// Whether any ticket on the store's lane is held or waiting.
    pub fn is_busy(&self, store: &str) -> bool {
        let Ok(lane) = self.lane(store) else {
            return true;
        };
        let Ok(state) = lane.state.lock() else {
            return true;
        };
        let serving = *lane.serving.borrow();
        serving < state.next_ticket
    }
}
