//! SubLane: a module's subscription handle on a lane.
//!
//! Subscriptions are owned by the SubLane, never by the lane directly.
//! Dropping the SubLane deactivates every handler it registered before
//! removing them, so nothing queued afterwards can reach a handler whose
//! owner is gone.

use std::any::Any;
use std::sync::Arc;

use tracing::trace;

use super::envelope::{DestinationFilter, DestinationId, Envelope, EventId, SenderId};
use super::handler::{FnHandler, Handler};
use super::lane::{Emitter, LaneShared, Subscription};

/// Per-module handle for subscribing to and emitting events on one lane.
pub struct SubLane {
    lane: Arc<LaneShared>,
    emitter: Emitter,
    subscriptions: Vec<Arc<Subscription>>,
}

impl SubLane {
    pub(crate) fn new(lane: Arc<LaneShared>) -> Self {
        let emitter = lane.emitter();
        Self {
            lane,
            emitter,
            subscriptions: Vec::new(),
        }
    }

    /// Sender id stamped on everything this SubLane emits.
    pub fn id(&self) -> SenderId {
        self.emitter.sender_id()
    }

    /// Name of the lane this SubLane is bound to.
    pub fn lane_name(&self) -> &str {
        &self.lane.name
    }

    /// Register a handler for `event`.
    ///
    /// The handler is invoked on the lane's thread for every message whose
    /// envelope passes `filter` and whose payload is a `P`.
    pub fn connect<P, H>(&mut self, event: EventId, filter: impl Into<DestinationFilter>, handler: H)
    where
        P: Any + Send + Sync,
        H: Handler<P> + 'static,
    {
        let subscription = Arc::new(Subscription::new::<P, H>(
            event,
            filter.into(),
            self.id(),
            handler,
        ));
        trace!(lane = %self.lane.name, %event, "subscription added");
        self.lane.register(subscription.clone());
        self.subscriptions.push(subscription);
    }

    /// Register a closure for `event`.
    pub fn connect_fn<P, F>(&mut self, event: EventId, filter: impl Into<DestinationFilter>, f: F)
    where
        P: Any + Send + Sync,
        F: FnMut(&Envelope, &P) + Send + 'static,
    {
        self.connect::<P, _>(event, filter, FnHandler(f));
    }

    /// Broadcast a payload on the lane.
    pub fn emit<P: Any + Send + Sync>(&self, event: EventId, payload: P) {
        self.emitter.emit(event, payload);
    }

    /// Send a payload to one destination on the lane.
    pub fn emit_to<P: Any + Send + Sync>(&self, event: EventId, payload: P, destination: DestinationId) {
        self.emitter.emit_to(event, payload, destination);
    }

    /// Cloneable emitter sharing this SubLane's sender id.
    pub fn emitter(&self) -> Emitter {
        self.emitter.clone()
    }

    /// Remove every handler registered for `event`. Returns how many.
    pub fn disconnect(&mut self, event: EventId) -> usize {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .subscriptions
            .drain(..)
            .partition(|s| s.event == event);
        self.lane.unregister(&removed);
        self.subscriptions = kept;
        removed.len()
    }

    /// Remove every handler registered through this SubLane.
    pub fn disconnect_all(&mut self) {
        let removed = std::mem::take(&mut self.subscriptions);
        self.lane.unregister(&removed);
    }

    /// Number of handlers registered through this SubLane.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl Drop for SubLane {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

impl std::fmt::Debug for SubLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubLane")
            .field("lane", &self.lane.name)
            .field("id", &self.id())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}
