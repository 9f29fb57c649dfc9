// =============================================================================
// Event Bus — in-process publish/subscribe fan-out
// =============================================================================
//
// Every component publishes its state deltas here; subscribers (the SSE
// endpoint, tests) consume them as an ordered stream.
//
// Contract:
//   - Each subscription owns an independent bounded buffer (default 256).
//   - On overflow the OLDEST event is dropped and the subscription's lag
//     counter increments; the subscription itself survives.
//   - publish() never blocks and never awaits.
//   - FIFO is guaranteed per subscription (and therefore per topic within a
//     subscription); there is no cross-subscription ordering.
//   - A new subscription sees a synthetic `connected` event first.
//   - close() is idempotent; publishing to a closed subscription is a no-op.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

/// Default per-subscription buffer capacity.
pub const DEFAULT_BUFFER: usize = 256;

// =============================================================================
// Topics
// =============================================================================

pub mod topic {
    pub const CONNECTED: &str = "connected";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const PORTFOLIO_UPDATED: &str = "portfolio:updated";
    pub const APPROVAL_CREATED: &str = "approval:created";
    pub const APPROVAL_UPDATED: &str = "approval:updated";
    pub const TRADE_SUBMITTED: &str = "trade:submitted";
    pub const TRADE_RESULT: &str = "trade:result";
    pub const KILL_SWITCH_CHANGED: &str = "killswitch:changed";
    pub const ALERT: &str = "alert";
    pub const RULES_UPDATED: &str = "rules:updated";
    pub const SYSTEM_RECONNECTED: &str = "system:reconnected";
}

// =============================================================================
// Event
// =============================================================================

/// A single event on the bus.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub topic: String,
    pub data: serde_json::Value,
    /// Milliseconds since the UNIX epoch, UTC.
    pub ts: i64,
}

impl BusEvent {
    fn new(topic: &str, data: serde_json::Value) -> Self {
        Self {
            topic: topic.to_string(),
            data,
            ts: Utc::now().timestamp_millis(),
        }
    }
}

// =============================================================================
// Internals
// =============================================================================

/// State shared between the bus registry and one subscription handle.
struct SubShared {
    /// Topics this subscription wants; `None` means all.
    topics: Option<HashSet<String>>,
    queue: Mutex<VecDeque<BusEvent>>,
    notify: Notify,
    closed: AtomicBool,
    /// Number of events dropped due to buffer overflow.
    lag: AtomicU64,
}

impl SubShared {
    /// Enqueue one event, dropping the oldest on overflow. Never blocks.
    fn push(&self, capacity: usize, event: BusEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.queue.lock();
            if queue.len() >= capacity {
                queue.pop_front();
                self.lag.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn wants(&self, topic: &str) -> bool {
        match &self.topics {
            None => true,
            // Synthetic markers are always delivered.
            Some(set) => {
                topic == self::topic::CONNECTED
                    || topic == self::topic::HEARTBEAT
                    || set.contains(topic)
            }
        }
    }
}

// =============================================================================
// EventBus
// =============================================================================

/// Multi-producer, multi-consumer fan-out bus for a single process.
pub struct EventBus {
    subs: Mutex<HashMap<u64, Arc<SubShared>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Publish an event to every live subscription interested in `topic`.
    /// Never blocks; closed subscriptions are skipped and reaped.
    pub fn publish(&self, topic: &str, data: serde_json::Value) {
        let event = BusEvent::new(topic, data);
        let mut subs = self.subs.lock();
        subs.retain(|_, shared| !shared.closed.load(Ordering::Acquire));
        for shared in subs.values() {
            if shared.wants(topic) {
                shared.push(self.capacity, event.clone());
            }
        }
    }

    /// Emit the periodic heartbeat marker to every subscription.
    pub fn publish_heartbeat(&self) {
        self.publish(topic::HEARTBEAT, serde_json::json!({}));
    }

    /// Create a subscription. `topics = None` receives everything; otherwise
    /// only the listed topics (plus the synthetic connected/heartbeat
    /// markers). The first event received is always `connected`.
    pub fn subscribe(&self, topics: Option<&[&str]>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(SubShared {
            topics: topics.map(|list| list.iter().map(|t| t.to_string()).collect()),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            lag: AtomicU64::new(0),
        });

        shared.push(
            self.capacity,
            BusEvent::new(
                topic::CONNECTED,
                serde_json::json!({ "subscription": id }),
            ),
        );

        self.subs.lock().insert(id, shared.clone());
        Subscription { id, shared }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let subs = self.subs.lock();
        subs.values()
            .filter(|s| !s.closed.load(Ordering::Acquire))
            .count()
    }

    /// Close every subscription (shutdown path).
    pub fn close_all(&self) {
        let mut subs = self.subs.lock();
        for shared in subs.values() {
            shared.closed.store(true, Ordering::Release);
            shared.queue.lock().clear();
            shared.notify.notify_one();
        }
        subs.clear();
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Consumer handle for one bounded event stream. Dropping the handle closes
/// the subscription.
pub struct Subscription {
    id: u64,
    shared: Arc<SubShared>,
}

impl Subscription {
    /// Receive the next event in FIFO order. Returns `None` once the
    /// subscription has been closed and its buffer drained.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(event) = self.shared.queue.lock().pop_front() {
                return Some(event);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Non-blocking receive; `None` when the buffer is currently empty.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.shared.queue.lock().pop_front()
    }

    /// Events dropped from this subscription's buffer due to overflow.
    pub fn lag(&self) -> u64 {
        self.shared.lag.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Close the subscription: drains the buffer and detaches from the bus.
    /// Idempotent.
    pub fn close(&mut self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            self.shared.queue.lock().clear();
            self.shared.notify.notify_one();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
