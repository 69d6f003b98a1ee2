use crate::engine::Engine;
use crate::router::RoutedMessage;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Operational counters shared across the listener, lanes, and the storage
/// worker.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub malformed_payloads: AtomicU64,
    pub unknown_topics: AtomicU64,
    pub dropped_messages: AtomicU64,
    pub storage_retries: AtomicU64,
    pub storage_drops: AtomicU64,
    pub lanes_active: AtomicU64,
    pub mqtt_connected: AtomicBool,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_malformed(&self) {
        self.malformed_payloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_topic(&self) {
        self.unknown_topics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_retry(&self) {
        self.storage_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_drop(&self) {
        self.storage_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }
}

struct LaneQueue {
    deque: Mutex<VecDeque<RoutedMessage>>,
    notify: Notify,
}

impl LaneQueue {
    fn new() -> Self {
        Self {
            deque: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

/// Outcome of pushing onto a bounded lane.
#[derive(Debug, PartialEq, Eq)]
enum PushOutcome {
    Queued,
    /// Queued after evicting an older routine sample.
    QueuedWithEviction,
    /// The incoming routine sample was dropped; the lane is full of
    /// higher-priority work.
    Rejected,
}

/// Bounded-lane admission: when the lane is full, the oldest droppable
/// (routine sensor/battery/location) entry gives way first. A status/job
/// message against a lane with nothing droppable may overflow up to twice
/// the capacity; past that hard cap even high-priority messages are dropped
/// so one device can never grow its lane without bound.
fn push_bounded(
    deque: &mut VecDeque<RoutedMessage>,
    msg: RoutedMessage,
    capacity: usize,
) -> PushOutcome {
    if deque.len() < capacity {
        deque.push_back(msg);
        return PushOutcome::Queued;
    }
    if let Some(pos) = deque.iter().position(RoutedMessage::is_droppable) {
        deque.remove(pos);
        deque.push_back(msg);
        return PushOutcome::QueuedWithEviction;
    }
    if msg.is_droppable() || deque.len() >= capacity.saturating_mul(2) {
        return PushOutcome::Rejected;
    }
    deque.push_back(msg);
    PushOutcome::Queued
}

/// Fan-out point between the transport listener and the per-device lanes.
/// Each device owns one ordered queue consumed by one worker task, so every
/// state transition for a device observes a single linear history.
pub struct LaneRouter {
    engine: Engine,
    lanes: Mutex<HashMap<String, Arc<LaneQueue>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl LaneRouter {
    pub fn new(engine: Engine, capacity: usize, stats: Arc<IngestStats>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            lanes: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            stats,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Enqueues a message onto its device lane, spawning the lane worker on
    /// first contact. Never blocks the caller.
    pub fn dispatch(self: &Arc<Self>, msg: RoutedMessage) {
        if self.closed.load(Ordering::Relaxed) {
            self.stats.record_dropped();
            return;
        }

        let lane = {
            let mut lanes = self.lanes.lock();
            match lanes.get(&msg.device_id) {
                Some(lane) => lane.clone(),
                None => {
                    let lane = Arc::new(LaneQueue::new());
                    lanes.insert(msg.device_id.clone(), lane.clone());
                    self.stats.lanes_active.store(lanes.len() as u64, Ordering::Relaxed);
                    let handle = self.spawn_lane_worker(msg.device_id.clone(), lane.clone());
                    self.tasks.lock().push(handle);
                    lane
                }
            }
        };

        let outcome = {
            let mut deque = lane.deque.lock();
            push_bounded(&mut deque, msg, self.capacity)
        };
        match outcome {
            PushOutcome::Queued => {}
            PushOutcome::QueuedWithEviction | PushOutcome::Rejected => {
                self.stats.record_dropped();
            }
        }
        lane.notify.notify_one();
    }

    fn spawn_lane_worker(
        self: &Arc<Self>,
        device_id: String,
        lane: Arc<LaneQueue>,
    ) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let next = lane.deque.lock().pop_front();
                match next {
                    Some(msg) => engine.handle(msg),
                    None => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        tokio::select! {
                            _ = lane.notify.notified() => {}
                            _ = cancel.cancelled() => {
                                // Drain whatever is already queued, then exit.
                                if lane.deque.lock().is_empty() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            tracing::debug!(device = %device_id, "lane worker stopped");
        })
    }

    fn all_lanes_empty(&self) -> bool {
        let lanes = self.lanes.lock();
        lanes.values().all(|lane| lane.deque.lock().is_empty())
    }

    /// Stops intake, drains in-flight lanes up to the grace deadline, then
    /// cancels the remaining workers. Each message is handled to completion
    /// or not at all; no transition is left half-applied.
    pub async fn shutdown(self: &Arc<Self>, grace: Duration) {
        self.closed.store(true, Ordering::Relaxed);
        let deadline = tokio::time::Instant::now() + grace;
        while !self.all_lanes_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if !self.all_lanes_empty() {
            tracing::warn!("shutdown grace expired with messages still queued");
        }
        self.cancel.cancel();
        {
            let lanes = self.lanes.lock();
            for lane in lanes.values() {
                lane.notify.notify_one();
            }
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for handle in tasks {
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                tracing::warn!("lane worker did not stop within a second");
            }
        }
    }
}
