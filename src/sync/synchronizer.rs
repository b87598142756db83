//! Tick Synchronizer
//!
//! Drives N lanes, each on its own OS thread, in barrier-synchronized
//! lockstep. Once per period the coordinator task sends a [`TickData`] to
//! every lane, then waits until every lane has dispatched it (handlers
//! invoked, follow-up messages drained) before the next period may begin.
//!
//! Tick N+1 never reaches any lane before every lane is done with tick N.
//! This trades throughput for deterministic cross-module ordering of
//! per-frame work, without exposing threads to module authors.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Deserialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

use crate::events::lane::{Lane, LaneContext, LaneControl};

/// Payload delivered to `EventId::TICK` subscribers once per period.
///
/// This is the sole timing primitive: simulation code must use
/// `time_since_last_tick_ms`, never the wall clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickData {
    /// Tick number, starting at 1.
    pub index: u64,
    /// Milliseconds elapsed since the previous tick (0 for the first).
    pub time_since_last_tick_ms: u64,
}

/// Sent by a lane thread once a tick is fully dispatched.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TickAck {
    pub(crate) lane: usize,
    pub(crate) tick: u64,
}

/// Synchronizer configuration.
#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    /// Tick period.
    pub period: Duration,
    /// Bounded wait for the coordinator and lane threads on `finish()`.
    pub shutdown_timeout: Duration,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_micros(1_000_000 / 60), // 60 Hz
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

impl SynchronizerConfig {
    /// Config ticking at `hz` times per second.
    ///
    /// Rates above 1 MHz are clamped to a 1 µs period.
    pub fn from_tick_rate(hz: u32) -> Self {
        Self {
            period: Duration::from_micros((1_000_000 / hz.max(1) as u64).max(1)),
            ..Default::default()
        }
    }
}

/// Synchronizer errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// `start()` called twice.
    #[error("Synchronizer already started")]
    AlreadyStarted,

    /// No lane registered.
    #[error("No lanes registered")]
    NoLanes,

    /// Configured tick period is zero.
    #[error("Tick period must be positive")]
    ZeroPeriod,

    /// `start()` called outside a tokio runtime.
    #[error("Synchronizer must be started from within a tokio runtime")]
    NoRuntime,

    /// Spawning a lane thread failed.
    #[error("Failed to spawn thread for lane {lane}: {source}")]
    ThreadSpawn {
        /// Lane name.
        lane: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of [`Synchronizer::finish`].
#[derive(Debug, Clone, Default)]
pub struct FinishReport {
    /// Ticks fully completed by every lane.
    pub ticks: u64,
    /// Lanes whose threads were joined.
    pub joined: Vec<String>,
    /// Lanes still stuck in a callback when the timeout expired.
    pub detached: Vec<String>,
}

impl FinishReport {
    /// Whether every lane thread was joined.
    pub fn is_clean(&self) -> bool {
        self.detached.is_empty()
    }
}

/// A running lane thread.
struct LaneThread {
    name: String,
    control: LaneControl,
    handle: std::thread::JoinHandle<()>,
    exited: oneshot::Receiver<()>,
}

struct Running {
    stopped: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    coordinator: JoinHandle<()>,
    lanes: Vec<LaneThread>,
}

impl Running {
    fn signal_stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        for lane in &self.lanes {
            lane.control.stop();
        }
    }
}

/// Coordinates periodic ticking of multiple lanes.
pub struct Synchronizer {
    config: SynchronizerConfig,
    pending: Vec<Lane>,
    running: Option<Running>,
    ticks_completed: Arc<AtomicU64>,
}

impl Synchronizer {
    /// Create a synchronizer with no lanes.
    pub fn new(config: SynchronizerConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            running: None,
            ticks_completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a lane. Lanes must be added before `start()`.
    pub fn add_lane(&mut self, lane: Lane) -> Result<(), SyncError> {
        if self.running.is_some() {
            return Err(SyncError::AlreadyStarted);
        }
        self.pending.push(lane);
        Ok(())
    }

    /// Number of lanes registered or running.
    pub fn lane_count(&self) -> usize {
        match &self.running {
            Some(running) => running.lanes.len(),
            None => self.pending.len(),
        }
    }

    /// Check if the synchronizer is running.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Ticks fully completed by every lane so far.
    pub fn ticks_completed(&self) -> u64 {
        self.ticks_completed.load(Ordering::Acquire)
    }

    /// Spawn one thread per lane and begin period-gated ticking.
    ///
    /// Must be called from within a tokio runtime; the coordinator runs as a
    /// task on it.
    pub fn start(&mut self) -> Result<(), SyncError> {
        if self.running.is_some() {
            return Err(SyncError::AlreadyStarted);
        }
        if self.pending.is_empty() {
            return Err(SyncError::NoLanes);
        }
        if self.config.period.is_zero() {
            return Err(SyncError::ZeroPeriod);
        }
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;

        let stopped = Arc::new(AtomicBool::new(false));
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let mut lanes: Vec<LaneThread> = Vec::with_capacity(self.pending.len());

        for (index, lane) in self.pending.drain(..).enumerate() {
            let name = lane.name().to_string();
            let control = lane.control();
            let (exited_tx, exited) = oneshot::channel();
            let ctx = LaneContext {
                index,
                acks: ack_tx.clone(),
                stopped: stopped.clone(),
                exited: exited_tx,
            };

            let spawned = std::thread::Builder::new()
                .name(format!("lane-{}", name))
                .spawn(move || lane.run(ctx));

            match spawned {
                Ok(handle) => lanes.push(LaneThread { name, control, handle, exited }),
                Err(source) => {
                    // Unwind the lanes already running
                    stopped.store(true, Ordering::Release);
                    for started in &lanes {
                        started.control.stop();
                    }
                    return Err(SyncError::ThreadSpawn { lane: name, source });
                }
            }
        }
        drop(ack_tx);

        let controls: Vec<LaneControl> = lanes.iter().map(|l| l.control.clone()).collect();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let coordinator = runtime.spawn(run_coordinator(
            self.config.period,
            controls,
            ack_rx,
            shutdown_rx,
            self.ticks_completed.clone(),
        ));

        info!(
            "Synchronizer started: {} lanes, period {:?}",
            lanes.len(),
            self.config.period
        );

        self.running = Some(Running {
            stopped,
            shutdown_tx,
            coordinator,
            lanes,
        });
        Ok(())
    }

    /// Stop ticking and collect every lane thread.
    ///
    /// Consumes the synchronizer, so it can only run once. Waits at most
    /// `shutdown_timeout` for the lanes; a lane still blocked inside a
    /// callback after that is detached and reported. No tick callback starts
    /// after this returns.
    pub async fn finish(mut self) -> FinishReport {
        let running = match self.running.take() {
            Some(running) => running,
            None => {
                debug!("finish() on a synchronizer that never started");
                return FinishReport::default();
            }
        };

        info!("Stopping synchronizer");
        running.signal_stop();

        let Running { mut coordinator, lanes, .. } = running;
        if timeout(self.config.shutdown_timeout, &mut coordinator).await.is_err() {
            warn!("Coordinator did not stop in time, aborting");
            coordinator.abort();
        }

        let mut report = FinishReport {
            ticks: self.ticks_completed(),
            ..Default::default()
        };

        let deadline = Instant::now() + self.config.shutdown_timeout;
        for lane in lanes {
            // A closed channel also means the thread is past its loop
            match timeout_at(deadline, lane.exited).await {
                Ok(_) => {
                    let handle = lane.handle;
                    let _ = tokio::task::spawn_blocking(move || handle.join()).await;
                    report.joined.push(lane.name);
                }
                Err(_) => {
                    warn!(lane = %lane.name, "Lane still busy after shutdown timeout, detaching");
                    report.detached.push(lane.name);
                }
            }
        }

        info!(
            "Synchronizer stopped after {} ticks ({} joined, {} detached)",
            report.ticks,
            report.joined.len(),
            report.detached.len()
        );
        report
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            warn!("Synchronizer dropped without finish(), detaching lanes");
            running.signal_stop();
            running.coordinator.abort();
        }
    }
}

/// Tick generation with a global barrier per tick.
#[instrument(skip_all, fields(lanes = controls.len()))]
async fn run_coordinator(
    period: Duration,
    controls: Vec<LaneControl>,
    mut acks: mpsc::UnboundedReceiver<TickAck>,
    mut shutdown: watch::Receiver<bool>,
    ticks_completed: Arc<AtomicU64>,
) {
    let mut tick_interval = interval(period);
    tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last = Instant::now();
    let mut index = 0u64;

    loop {
        tokio::select! {
            _ = tick_interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        let now = Instant::now();
        index += 1;
        let tick = TickData {
            index,
            time_since_last_tick_ms: if index == 1 {
                0
            } else {
                now.duration_since(last).as_millis() as u64
            },
        };
        last = now;

        for control in &controls {
            if !control.tick(tick) {
                warn!(tick = index, "Lane queue closed, stopping coordinator");
                return;
            }
        }

        // Barrier: every lane must acknowledge this tick
        let mut outstanding = controls.len();
        while outstanding > 0 {
            tokio::select! {
                ack = acks.recv() => match ack {
                    Some(ack) if ack.tick == index => outstanding -= 1,
                    Some(ack) => trace!(lane = ack.lane, tick = ack.tick, "stale ack"),
                    None => {
                        warn!("All lanes gone, stopping coordinator");
                        return;
                    }
                },
                _ = shutdown.changed() => return,
            }
        }

        ticks_completed.store(index, Ordering::Release);
        trace!(tick = index, "tick complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DestinationFilter, Envelope, EventId};
    use std::sync::Mutex;

    fn fast_config() -> SynchronizerConfig {
        SynchronizerConfig {
            period: Duration::from_millis(5),
            shutdown_timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_config_default() {
        let config = SynchronizerConfig::default();
        assert_eq!(config.period, Duration::from_micros(16_666));
        assert_eq!(SynchronizerConfig::from_tick_rate(100).period, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_start_without_lanes() {
        let mut sync = Synchronizer::new(fast_config());
        assert!(matches!(sync.start(), Err(SyncError::NoLanes)));
    }

    #[tokio::test]
    async fn test_start_with_zero_period() {
        let mut sync = Synchronizer::new(SynchronizerConfig {
            period: Duration::ZERO,
            ..fast_config()
        });
        sync.add_lane(Lane::new("model")).unwrap();
        assert!(matches!(sync.start(), Err(SyncError::ZeroPeriod)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_extreme_tick_rate_is_clamped() {
        let config = SynchronizerConfig::from_tick_rate(2_000_000);
        assert_eq!(config.period, Duration::from_micros(1));
        assert_eq!(SynchronizerConfig::from_tick_rate(u32::MAX).period, Duration::from_micros(1));

        let lane = Lane::new("model");
        let ticks = Arc::new(AtomicU64::new(0));
        let mut sub = lane.create_sub_lane();
        {
            let ticks = ticks.clone();
            sub.connect_fn(EventId::TICK, DestinationFilter::Any, move |_: &Envelope, _: &TickData| {
                ticks.fetch_add(1, Ordering::SeqCst);
            });
        }

        let mut sync = Synchronizer::new(SynchronizerConfig {
            shutdown_timeout: Duration::from_millis(500),
            ..config
        });
        sync.add_lane(lane).unwrap();
        sync.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = sync.finish().await;
        assert!(report.is_clean());
        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_start_outside_runtime() {
        let mut sync = Synchronizer::new(fast_config());
        sync.add_lane(Lane::new("model")).unwrap();
        assert!(matches!(sync.start(), Err(SyncError::NoRuntime)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_twice() {
        let mut sync = Synchronizer::new(fast_config());
        sync.add_lane(Lane::new("model")).unwrap();
        sync.start().unwrap();

        assert!(matches!(sync.start(), Err(SyncError::AlreadyStarted)));
        assert!(matches!(sync.add_lane(Lane::new("late")), Err(SyncError::AlreadyStarted)));

        let report = sync.finish().await;
        assert!(report.is_clean());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ticks_delivered() {
        let lane = Lane::new("model");
        let ticks = Arc::new(Mutex::new(Vec::new()));

        let mut sub = lane.create_sub_lane();
        {
            let ticks = ticks.clone();
            sub.connect_fn(EventId::TICK, DestinationFilter::Any, move |_: &Envelope, t: &TickData| {
                ticks.lock().unwrap().push(*t);
            });
        }

        let mut sync = Synchronizer::new(fast_config());
        sync.add_lane(lane).unwrap();
        sync.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let report = sync.finish().await;

        let ticks = ticks.lock().unwrap();
        assert!(ticks.len() >= 3, "only {} ticks", ticks.len());
        assert_eq!(ticks[0].index, 1);
        assert_eq!(ticks[0].time_since_last_tick_ms, 0);
        for pair in ticks.windows(2) {
            assert_eq!(pair[1].index, pair[0].index + 1);
        }
        assert!(report.ticks >= 3);
        assert_eq!(report.joined, vec!["model".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_ticks_after_finish() {
        let lane = Lane::new("view");
        let count = Arc::new(AtomicU64::new(0));

        let mut sub = lane.create_sub_lane();
        {
            let count = count.clone();
            sub.connect_fn(EventId::TICK, DestinationFilter::Any, move |_: &Envelope, _: &TickData| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        let mut sync = Synchronizer::new(fast_config());
        sync.add_lane(lane).unwrap();
        sync.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        sync.finish().await;

        let at_finish = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), at_finish);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_finish_with_stuck_lane() {
        let lane = Lane::new("stuck");
        let started = Arc::new(AtomicU64::new(0));

        let mut sub = lane.create_sub_lane();
        {
            let started = started.clone();
            sub.connect_fn(EventId::TICK, DestinationFilter::Any, move |_: &Envelope, _: &TickData| {
                started.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(600));
            });
        }

        let mut sync = Synchronizer::new(SynchronizerConfig {
            period: Duration::from_millis(5),
            shutdown_timeout: Duration::from_millis(100),
        });
        sync.add_lane(lane).unwrap();
        sync.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let begin = std::time::Instant::now();
        let report = sync.finish().await;
        assert!(begin.elapsed() < Duration::from_millis(550));
        assert_eq!(report.detached, vec!["stuck".to_string()]);

        let at_finish = started.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(started.load(Ordering::SeqCst), at_finish);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_finish_skips_remaining_tick_subscribers() {
        let lane = Lane::new("stuck");
        let slow_entered = Arc::new(AtomicU64::new(0));
        let fast_ticks = Arc::new(AtomicU64::new(0));

        let mut sub = lane.create_sub_lane();
        {
            let slow_entered = slow_entered.clone();
            sub.connect_fn(EventId::TICK, DestinationFilter::Any, move |_: &Envelope, _: &TickData| {
                slow_entered.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(400));
            });
        }
        {
            let fast_ticks = fast_ticks.clone();
            sub.connect_fn(EventId::TICK, DestinationFilter::Any, move |_: &Envelope, _: &TickData| {
                fast_ticks.fetch_add(1, Ordering::SeqCst);
            });
        }

        let mut sync = Synchronizer::new(SynchronizerConfig {
            period: Duration::from_millis(5),
            shutdown_timeout: Duration::from_millis(50),
        });
        sync.add_lane(lane).unwrap();
        sync.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(slow_entered.load(Ordering::SeqCst), 1);

        let report = sync.finish().await;
        assert_eq!(report.detached, vec!["stuck".to_string()]);
        assert_eq!(fast_ticks.load(Ordering::SeqCst), 0);

        // The slow handler returns after finish; its neighbour must not run
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fast_ticks.load(Ordering::SeqCst), 0);
        assert_eq!(slow_entered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_tick_handler_does_not_stall() {
        let lane = Lane::new("audio");
        let mut sub = lane.create_sub_lane();
        sub.connect_fn(EventId::TICK, DestinationFilter::Any, |_: &Envelope, t: &TickData| {
            if t.index == 2 {
                panic!("bad frame");
            }
        });

        let mut sync = Synchronizer::new(fast_config());
        sync.add_lane(lane).unwrap();
        sync.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(sync.ticks_completed() > 2);
        assert!(sync.finish().await.is_clean());
    }

    #[tokio::test]
    async fn test_finish_never_started() {
        let sync = Synchronizer::new(fast_config());
        let report = sync.finish().await;
        assert_eq!(report.ticks, 0);
        assert!(report.joined.is_empty());
    }
}
