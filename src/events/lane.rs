//! Lane: the per-thread event bus.
//!
//! A lane owns a FIFO queue of `(Envelope, payload)` messages and a table of
//! subscriptions keyed by [`EventId`]. Messages can be posted from any thread
//! (through a [`SubLane`] or an [`Emitter`]) but are only ever dispatched by
//! the thread that drives the lane, so every handler registered on one lane
//! runs on that thread, never concurrently with another handler of the same
//! lane.
//!
//! Messages for which no subscription matches are dropped silently. Not every
//! module cares about every event, and that is not an error.

use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use super::envelope::{DestinationFilter, DestinationId, Envelope, EventId, SenderId};
use super::handler::Handler;
use super::sub_lane::SubLane;
use crate::sync::synchronizer::{TickAck, TickData};

/// Upper bound on follow-up messages drained inside one tick pass.
///
/// Anything left over is dispatched after the tick is acknowledged.
pub const FOLLOW_UP_LIMIT: usize = 1024;

/// Type-erased payload as stored in the queue.
pub(crate) type Payload = Arc<dyn Any + Send + Sync>;

/// Items carried by a lane queue.
pub(crate) enum LaneItem {
    /// Regular message.
    Message { envelope: Envelope, payload: Payload },
    /// Synchronizer tick.
    Tick(TickData),
    /// Stop the lane thread.
    Stop,
}

type ErasedCallback = Box<dyn FnMut(&Envelope, &dyn Any) -> bool + Send>;

/// One registered handler.
pub(crate) struct Subscription {
    pub(crate) event: EventId,
    pub(crate) filter: DestinationFilter,
    pub(crate) owner: SenderId,
    payload_type: &'static str,
    active: AtomicBool,
    callback: Mutex<ErasedCallback>,
}

impl Subscription {
    pub(crate) fn new<P, H>(
        event: EventId,
        filter: DestinationFilter,
        owner: SenderId,
        mut handler: H,
    ) -> Self
    where
        P: Any + Send + Sync,
        H: Handler<P> + 'static,
    {
        let callback: ErasedCallback = Box::new(move |envelope: &Envelope, payload: &dyn Any| {
            match payload.downcast_ref::<P>() {
                Some(payload) => {
                    handler.handle(envelope, payload);
                    true
                }
                None => false,
            }
        });

        Self {
            event,
            filter,
            owner,
            payload_type: type_name::<P>(),
            active: AtomicBool::new(true),
            callback: Mutex::new(callback),
        }
    }

    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Invoke the handler. Returns false if the payload type does not match.
    fn invoke(&self, envelope: &Envelope, payload: &dyn Any) -> bool {
        // A handler that panicked earlier leaves the mutex poisoned; the
        // handler itself is still usable.
        let mut callback = self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (*callback)(envelope, payload)
    }
}

/// State shared between a lane and every handle created from it.
pub(crate) struct LaneShared {
    pub(crate) name: String,
    tx: mpsc::UnboundedSender<LaneItem>,
    table: Mutex<BTreeMap<EventId, Vec<Arc<Subscription>>>>,
    next_sender: AtomicU64,
}

impl LaneShared {
    fn table(&self) -> MutexGuard<'_, BTreeMap<EventId, Vec<Arc<Subscription>>>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn allocate_sender(&self) -> SenderId {
        SenderId(self.next_sender.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn emitter(&self) -> Emitter {
        Emitter {
            sender: self.allocate_sender(),
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn register(&self, subscription: Arc<Subscription>) {
        let mut table = self.table();
        table.entry(subscription.event).or_default().push(subscription);
    }

    /// Deactivate then remove the given subscriptions under one lock.
    pub(crate) fn unregister(&self, subscriptions: &[Arc<Subscription>]) {
        if subscriptions.is_empty() {
            return;
        }

        // Deactivate first: a dispatch that already took its snapshot
        // checks the flag before every invocation.
        for subscription in subscriptions {
            subscription.deactivate();
        }

        let mut table = self.table();
        for subscription in subscriptions {
            if let Some(list) = table.get_mut(&subscription.event) {
                list.retain(|s| !Arc::ptr_eq(s, subscription));
                if list.is_empty() {
                    table.remove(&subscription.event);
                }
            }
        }
    }

    /// Subscriptions matching an envelope, in registration order.
    fn matching(&self, envelope: &Envelope) -> Vec<Arc<Subscription>> {
        let table = self.table();
        match table.get(&envelope.event) {
            Some(list) => list
                .iter()
                .filter(|s| s.filter.accepts(envelope))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    fn subscription_count(&self) -> usize {
        self.table().values().map(Vec::len).sum()
    }
}

/// Cloneable, thread-safe handle that posts messages into a lane.
///
/// Used by asynchronous collaborators (socket loops, timers) that complete on
/// other threads and need to re-enter the lane.
#[derive(Clone)]
pub struct Emitter {
    sender: SenderId,
    tx: mpsc::UnboundedSender<LaneItem>,
}

impl Emitter {
    /// Sender id stamped on every envelope from this emitter.
    pub fn sender_id(&self) -> SenderId {
        self.sender
    }

    /// Broadcast a payload. Never blocks.
    ///
    /// Returns false if the lane has already shut down and the message was
    /// discarded.
    pub fn emit<P: Any + Send + Sync>(&self, event: EventId, payload: P) -> bool {
        self.emit_to(event, payload, DestinationId::BROADCAST)
    }

    /// Send a payload to one destination. Never blocks.
    pub fn emit_to<P: Any + Send + Sync>(
        &self,
        event: EventId,
        payload: P,
        destination: DestinationId,
    ) -> bool {
        let envelope = Envelope::new(event, destination, self.sender);
        let queued = self
            .tx
            .send(LaneItem::Message { envelope, payload: Arc::new(payload) })
            .is_ok();
        if !queued {
            trace!(%event, "lane closed, message discarded");
        }
        queued
    }
}

/// Handle used by the synchronizer to inject ticks and stop requests.
#[derive(Clone)]
pub(crate) struct LaneControl {
    tx: mpsc::UnboundedSender<LaneItem>,
}

impl LaneControl {
    pub(crate) fn tick(&self, tick: TickData) -> bool {
        self.tx.send(LaneItem::Tick(tick)).is_ok()
    }

    pub(crate) fn stop(&self) -> bool {
        self.tx.send(LaneItem::Stop).is_ok()
    }
}

/// Everything a lane thread needs from its synchronizer.
pub(crate) struct LaneContext {
    pub(crate) index: usize,
    pub(crate) acks: mpsc::UnboundedSender<TickAck>,
    pub(crate) stopped: Arc<AtomicBool>,
    pub(crate) exited: oneshot::Sender<()>,
}

/// A thread-confined event bus.
pub struct Lane {
    shared: Arc<LaneShared>,
    queue: mpsc::UnboundedReceiver<LaneItem>,
}

impl Lane {
    /// Create a new lane.
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, queue) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(LaneShared {
                name: name.into(),
                tx,
                table: Mutex::new(BTreeMap::new()),
                // SenderId 0 is the engine itself
                next_sender: AtomicU64::new(1),
            }),
            queue,
        }
    }

    /// Lane name (used for thread names and logs).
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Create a subscription handle bound to this lane.
    pub fn create_sub_lane(&self) -> SubLane {
        SubLane::new(self.shared.clone())
    }

    /// Create a cross-thread emitter for this lane.
    pub fn emitter(&self) -> Emitter {
        self.shared.emitter()
    }

    pub(crate) fn control(&self) -> LaneControl {
        LaneControl { tx: self.shared.tx.clone() }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.shared.subscription_count()
    }

    /// Dispatch everything currently queued, on the calling thread.
    ///
    /// Returns the number of messages taken off the queue. Messages emitted
    /// by handlers during this call are dispatched too.
    pub fn process_pending(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(item) = self.queue.try_recv() {
            match item {
                LaneItem::Message { envelope, payload } => {
                    self.dispatch(&envelope, &*payload, None);
                    processed += 1;
                }
                LaneItem::Tick(tick) => {
                    self.dispatch_tick(&tick, None);
                }
                LaneItem::Stop => {
                    debug!(lane = %self.name(), "stop request ignored outside synchronizer");
                }
            }
        }
        processed
    }

    /// Deliver one tick to the lane's `EventId::TICK` subscribers.
    pub(crate) fn dispatch_tick(&self, tick: &TickData, stopped: Option<&AtomicBool>) -> usize {
        let envelope = Envelope::broadcast(EventId::TICK, SenderId::ENGINE);
        self.dispatch(&envelope, tick, stopped)
    }

    /// Dispatch one message to every matching subscription.
    ///
    /// A panicking handler is logged and skipped; the remaining subscribers
    /// and messages are still delivered. Once `stopped` is set no further
    /// handler is started, even mid-message.
    fn dispatch(&self, envelope: &Envelope, payload: &dyn Any, stopped: Option<&AtomicBool>) -> usize {
        let targets = self.shared.matching(envelope);
        if targets.is_empty() {
            trace!(lane = %self.name(), event = %envelope.event, "no subscriber, dropped");
            return 0;
        }

        let mut delivered = 0;
        for subscription in targets {
            if stopped.is_some_and(|flag| flag.load(Ordering::Acquire)) {
                debug!(lane = %self.name(), event = %envelope.event, "stopped mid-dispatch");
                break;
            }

            // Checked per invocation: an earlier handler may have dropped
            // the SubLane owning this subscription.
            if !subscription.is_active() {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| subscription.invoke(envelope, payload))) {
                Ok(true) => delivered += 1,
                Ok(false) => {
                    error!(
                        lane = %self.name(),
                        event = %envelope.event,
                        expected = subscription.payload_type,
                        "payload type mismatch, subscriber skipped"
                    );
                }
                Err(panic) => {
                    error!(
                        lane = %self.name(),
                        event = %envelope.event,
                        subscriber = subscription.owner.0,
                        "handler panicked: {}",
                        panic_message(panic.as_ref())
                    );
                }
            }
        }

        delivered
    }

    /// Lane thread body, driven by the synchronizer.
    pub(crate) fn run(mut self, ctx: LaneContext) {
        info!(lane = %self.name(), "lane thread started");

        while let Some(item) = self.queue.blocking_recv() {
            if ctx.stopped.load(Ordering::Acquire) {
                break;
            }

            match item {
                LaneItem::Message { envelope, payload } => {
                    self.dispatch(&envelope, &*payload, Some(&*ctx.stopped));
                }
                LaneItem::Tick(tick) => {
                    self.dispatch_tick(&tick, Some(&*ctx.stopped));
                    // Follow-ups produced by the tick belong to the same pass.
                    if !self.drain_follow_ups(&ctx) {
                        break;
                    }
                    let _ = ctx.acks.send(TickAck { lane: ctx.index, tick: tick.index });
                }
                LaneItem::Stop => break,
            }
        }

        info!(lane = %self.name(), "lane thread stopped");
        let _ = ctx.exited.send(());
    }

    /// Dispatch queued messages after a tick. Returns false when the lane
    /// must stop.
    fn drain_follow_ups(&mut self, ctx: &LaneContext) -> bool {
        for _ in 0..FOLLOW_UP_LIMIT {
            let item = match self.queue.try_recv() {
                Ok(item) => item,
                Err(_) => return true,
            };

            if ctx.stopped.load(Ordering::Acquire) {
                return false;
            }

            match item {
                LaneItem::Message { envelope, payload } => {
                    self.dispatch(&envelope, &*payload, Some(&*ctx.stopped));
                }
                LaneItem::Tick(tick) => {
                    warn!(lane = %self.name(), tick = tick.index, "tick queued before previous ack");
                    self.dispatch_tick(&tick, Some(&*ctx.stopped));
                    let _ = ctx.acks.send(TickAck { lane: ctx.index, tick: tick.index });
                }
                LaneItem::Stop => return false,
            }
        }
        true
    }
}

impl std::fmt::Debug for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lane")
            .field("name", &self.shared.name)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const PING: EventId = EventId(1000);
    const PONG: EventId = EventId(1001);

    #[derive(Debug, Clone, PartialEq)]
    struct Ping(u32);

    #[test]
    fn test_emit_without_subscriber_is_silent() {
        let mut lane = Lane::new("test");
        let sub = lane.create_sub_lane();

        sub.emit_to(PING, Ping(1), DestinationId(99));
        sub.emit(EventId(4242), Ping(2));

        assert_eq!(lane.process_pending(), 2);
    }

    #[test]
    fn test_broadcast_reaches_all_subscribers() {
        let mut lane = Lane::new("test");
        let hits = Arc::new(AtomicUsize::new(0));

        let mut a = lane.create_sub_lane();
        let mut b = lane.create_sub_lane();
        for sub in [&mut a, &mut b] {
            let hits = hits.clone();
            sub.connect_fn(PING, DestinationFilter::Exact(DestinationId(5)), move |_: &Envelope, _: &Ping| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        a.emit(PING, Ping(1));
        lane.process_pending();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_exact_destination_only() {
        let mut lane = Lane::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut sub = lane.create_sub_lane();
        {
            let seen = seen.clone();
            sub.connect_fn(PING, DestinationId(7), move |env: &Envelope, p: &Ping| {
                seen.lock().unwrap().push((env.destination, p.0));
            });
        }

        sub.emit_to(PING, Ping(1), DestinationId(7));
        sub.emit_to(PING, Ping(2), DestinationId(8));
        lane.process_pending();

        assert_eq!(*seen.lock().unwrap(), vec![(DestinationId(7), 1)]);
    }

    #[test]
    fn test_fifo_order() {
        let mut lane = Lane::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut sub = lane.create_sub_lane();
        {
            let seen = seen.clone();
            sub.connect_fn(PING, DestinationFilter::Any, move |_: &Envelope, p: &Ping| {
                seen.lock().unwrap().push(p.0);
            });
        }

        for i in 0..100 {
            sub.emit(PING, Ping(i));
        }
        lane.process_pending();

        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let mut lane = Lane::new("test");
        let hits = Arc::new(AtomicUsize::new(0));

        let mut first = lane.create_sub_lane();
        first.connect_fn(PING, DestinationFilter::Any, |_: &Envelope, p: &Ping| {
            if p.0 == 1 {
                panic!("boom");
            }
        });

        let mut second = lane.create_sub_lane();
        {
            let hits = hits.clone();
            second.connect_fn(PING, DestinationFilter::Any, move |_: &Envelope, _: &Ping| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        first.emit(PING, Ping(1));
        first.emit(PING, Ping(2));
        lane.process_pending();

        // Both messages reached the second subscriber
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_type_mismatch_is_skipped() {
        let mut lane = Lane::new("test");
        let hits = Arc::new(AtomicUsize::new(0));

        let mut sub = lane.create_sub_lane();
        {
            let hits = hits.clone();
            sub.connect_fn(PING, DestinationFilter::Any, move |_: &Envelope, _: &Ping| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        sub.emit(PING, "not a ping");
        sub.emit(PING, Ping(3));
        lane.process_pending();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_can_emit_follow_up() {
        let mut lane = Lane::new("test");
        let pongs = Arc::new(AtomicUsize::new(0));

        let mut sub = lane.create_sub_lane();
        let emitter = sub.emitter();
        sub.connect_fn(PING, DestinationFilter::Any, move |_: &Envelope, p: &Ping| {
            emitter.emit(PONG, Ping(p.0 + 1));
        });
        {
            let pongs = pongs.clone();
            sub.connect_fn(PONG, DestinationFilter::Any, move |_: &Envelope, _: &Ping| {
                pongs.fetch_add(1, Ordering::SeqCst);
            });
        }

        sub.emit(PING, Ping(0));
        assert_eq!(lane.process_pending(), 2);
        assert_eq!(pongs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emitter_from_other_thread() {
        let mut lane = Lane::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut sub = lane.create_sub_lane();
        {
            let seen = seen.clone();
            sub.connect_fn(PING, DestinationFilter::Any, move |env: &Envelope, p: &Ping| {
                seen.lock().unwrap().push((env.sender, p.0));
            });
        }

        let emitter = lane.emitter();
        let sender = emitter.sender_id();
        std::thread::spawn(move || {
            for i in 0..10 {
                assert!(emitter.emit(PING, Ping(i)));
            }
        })
        .join()
        .unwrap();

        lane.process_pending();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 10);
        assert!(seen.iter().all(|(s, _)| *s == sender));
    }

    #[test]
    fn test_sender_ids_are_unique() {
        let lane = Lane::new("test");
        let a = lane.create_sub_lane();
        let b = lane.create_sub_lane();
        let e = lane.emitter();

        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), e.sender_id());
        assert_ne!(a.id(), SenderId::ENGINE);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
