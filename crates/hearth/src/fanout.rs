//! Event Fan-out
//!
//! Every subscriber owns a bounded queue. Publishing never waits: when a
//! queue is full its oldest event is dropped, so one slow client cannot hold
//! up the others. Closed subscriptions are pruned on the next publish.
//!
//! Delivery is at-least-once; [`Subscription`] discards repeats and events
//! older than the newest version it has already seen for a device.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use wildmatch::WildMatch;

use crate::dispatch::{IntentId, IntentStatus};
use crate::escalation::Alert;
use crate::types::{DeviceId, DeviceState, Version};

/// Recently seen event ids kept per subscription for duplicate detection
const SEEN_WINDOW: usize = 512;

/// Payload of a fan-out event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    StateChanged {
        state: DeviceState,
        reachable: bool,
    },
    Liveness {
        reachable: bool,
    },
    IntentResolved {
        intent_id: IntentId,
        token: String,
        status: IntentStatus,
    },
    Alert(Alert),
}

impl EventKind {
    /// Whether the event describes device state and is ordered by version
    fn is_versioned(&self) -> bool {
        matches!(self, EventKind::StateChanged { .. } | EventKind::Liveness { .. })
    }
}

/// A fan-out event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique per process, used for duplicate suppression
    pub id: u64,
    pub device_id: DeviceId,
    pub version: Version,
    #[serde(flatten)]
    pub kind: EventKind,
    pub at: DateTime<Utc>,
}

struct Queue {
    client_id: String,
    events: Mutex<VecDeque<Arc<Event>>>,
    /// Device id patterns; empty means everything
    filter: RwLock<Vec<WildMatch>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Queue {
    fn accepts(&self, event: &Event) -> bool {
        // Alerts go to everyone, intent outcomes are already addressed
        if matches!(event.kind, EventKind::Alert(_) | EventKind::IntentResolved { .. }) {
            return true;
        }
        let filter = self.filter.read();
        filter.is_empty() || filter.iter().any(|p| p.matches(event.device_id.as_str()))
    }

    fn push(&self, event: Arc<Event>, capacity: usize) {
        {
            let mut events = self.events.lock();
            if events.len() >= capacity {
                events.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    client_id = %self.client_id,
                    dropped,
                    "Subscriber queue full, dropped oldest event"
                );
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Broadcasts events to subscribers
pub struct Fanout {
    queues: DashMap<u64, Arc<Queue>>,
    next_event: AtomicU64,
    next_subscriber: AtomicU64,
    capacity: usize,
}

impl Fanout {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            next_event: AtomicU64::new(1),
            next_subscriber: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to every device
    pub fn subscribe(&self, client_id: impl Into<String>) -> Subscription {
        self.subscribe_filtered(client_id, Vec::<String>::new())
    }

    /// Subscribe to devices whose id matches any pattern
    pub fn subscribe_filtered<S: AsRef<str>>(
        &self,
        client_id: impl Into<String>,
        patterns: impl IntoIterator<Item = S>,
    ) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(Queue {
            client_id: client_id.into(),
            events: Mutex::new(VecDeque::with_capacity(self.capacity.min(64))),
            filter: RwLock::new(compile(patterns)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        self.queues.insert(id, queue.clone());
        tracing::debug!(subscriber = id, client_id = %queue.client_id, "Subscriber added");

        Subscription {
            id,
            queue,
            last_versions: HashMap::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    fn make_event(&self, device_id: &DeviceId, version: Version, kind: EventKind) -> Arc<Event> {
        Arc::new(Event {
            id: self.next_event.fetch_add(1, Ordering::Relaxed),
            device_id: device_id.clone(),
            version,
            kind,
            at: Utc::now(),
        })
    }

    /// Deliver to every live subscriber whose filter accepts the device
    pub fn publish(&self, device_id: &DeviceId, version: Version, kind: EventKind) -> Arc<Event> {
        let event = self.make_event(device_id, version, kind);
        self.deliver(&event, |_| true);
        event
    }

    /// Deliver only to the subscriptions of one client
    pub fn send_to(
        &self,
        client_id: &str,
        device_id: &DeviceId,
        version: Version,
        kind: EventKind,
    ) -> Arc<Event> {
        let event = self.make_event(device_id, version, kind);
        self.deliver(&event, |queue| queue.client_id == client_id);
        event
    }

    fn deliver(&self, event: &Arc<Event>, target: impl Fn(&Queue) -> bool) {
        let mut stale = false;
        for entry in self.queues.iter() {
            let queue = entry.value();
            if queue.is_closed() {
                stale = true;
                continue;
            }
            if target(queue) && queue.accepts(event) {
                queue.push(event.clone(), self.capacity);
            }
        }
        if stale {
            self.prune();
        }
    }

    fn prune(&self) {
        let before = self.queues.len();
        self.queues.retain(|_, queue| !queue.is_closed());
        let pruned = before.saturating_sub(self.queues.len());
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned closed subscribers");
        }
    }

    /// Replace the device filter of a live subscription
    pub fn set_filter<S: AsRef<str>>(
        &self,
        subscriber: u64,
        patterns: impl IntoIterator<Item = S>,
    ) -> bool {
        match self.queues.get(&subscriber) {
            Some(queue) if !queue.is_closed() => {
                *queue.filter.write() = compile(patterns);
                true
            }
            _ => false,
        }
    }

    /// Live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.queues.iter().filter(|q| !q.is_closed()).count()
    }

    /// End every subscription; pending `recv` calls return `None`
    pub fn close_all(&self) {
        for entry in self.queues.iter() {
            entry.value().close();
        }
        self.queues.clear();
    }
}

fn compile<S: AsRef<str>>(patterns: impl IntoIterator<Item = S>) -> Vec<WildMatch> {
    patterns
        .into_iter()
        .map(|p| WildMatch::new(p.as_ref()))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription
// ─────────────────────────────────────────────────────────────────────────────

/// Receiving end of a subscriber queue
pub struct Subscription {
    id: u64,
    queue: Arc<Queue>,
    last_versions: HashMap<DeviceId, Version>,
    seen: HashSet<u64>,
    seen_order: VecDeque<u64>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.queue.client_id
    }

    /// Replace the device filter
    pub fn set_filter<S: AsRef<str>>(&self, patterns: impl IntoIterator<Item = S>) {
        *self.queue.filter.write() = compile(patterns);
    }

    /// Events lost to overflow so far
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Wait for the next fresh event. `None` once the fan-out is closed.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.queue.is_closed() {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Next fresh event without waiting
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        loop {
            let event = self.queue.events.lock().pop_front()?;
            if self.accept(&event) {
                return Some(event);
            }
        }
    }

    fn accept(&mut self, event: &Event) -> bool {
        if !self.seen.insert(event.id) {
            tracing::trace!(event_id = event.id, "Duplicate event discarded");
            return false;
        }
        self.seen_order.push_back(event.id);
        if self.seen_order.len() > SEEN_WINDOW {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }

        if event.kind.is_versioned() {
            let last = self
                .last_versions
                .entry(event.device_id.clone())
                .or_insert(event.version);
            if event.version < *last {
                tracing::trace!(
                    device_id = %event.device_id,
                    version = event.version,
                    newest = *last,
                    "Stale event discarded"
                );
                return false;
            }
            *last = event.version;
        }
        true
    }

    #[cfg(test)]
    fn inject(&self, event: Arc<Event>) {
        self.queue.push(event, usize::MAX);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    fn state_changed(on: bool) -> EventKind {
        EventKind::StateChanged {
            state: DeviceState::Light { on, brightness: None },
            reachable: true,
        }
    }

    fn light() -> DeviceId {
        DeviceId::from("hall_light")
    }

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let fanout = Fanout::new(8);
        let mut a = fanout.subscribe("a");
        let mut b = fanout.subscribe("b");

        fanout.publish(&light(), 1, state_changed(true));

        assert_eq!(a.try_recv().unwrap().version, 1);
        assert_eq!(b.try_recv().unwrap().version, 1);
        assert!(a.try_recv().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let fanout = Fanout::new(2);
        let mut slow = fanout.subscribe("slow");
        let mut fast = fanout.subscribe("fast");

        fanout.publish(&light(), 1, state_changed(true));
        assert!(fast.try_recv().is_some());
        fanout.publish(&light(), 2, state_changed(false));
        assert!(fast.try_recv().is_some());
        fanout.publish(&light(), 3, state_changed(true));
        assert!(fast.try_recv().is_some());

        assert_eq!(slow.dropped(), 1);
        assert_eq!(slow.try_recv().unwrap().version, 2);
        assert_eq!(slow.try_recv().unwrap().version, 3);
        assert_eq!(fast.dropped(), 0);
    }

    #[test]
    fn test_stale_and_duplicate_events_discarded() {
        let fanout = Fanout::new(8);
        let mut sub = fanout.subscribe("ui");

        let v7 = fanout.publish(&light(), 7, state_changed(true));
        fanout.publish(&light(), 5, state_changed(false));
        sub.inject(v7.clone());

        assert_eq!(sub.try_recv().unwrap().version, 7);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_filter_and_direct_delivery() {
        let fanout = Fanout::new(8);
        let mut kitchen = fanout.subscribe_filtered("kitchen-panel", ["kitchen_*"]);
        let mut phone = fanout.subscribe("phone");

        fanout.publish(&light(), 1, state_changed(true));
        fanout.publish(&DeviceId::from("kitchen_fan"), 1, EventKind::Liveness { reachable: false });
        fanout.send_to(
            "phone",
            &light(),
            1,
            EventKind::IntentResolved {
                intent_id: IntentId::new(),
                token: "t".into(),
                status: IntentStatus::Acknowledged,
            },
        );

        assert_eq!(kitchen.try_recv().unwrap().device_id.as_str(), "kitchen_fan");
        assert!(kitchen.try_recv().is_none());

        assert_eq!(phone.try_recv().unwrap().version, 1);
        assert_eq!(phone.try_recv().unwrap().device_id.as_str(), "kitchen_fan");
        assert!(matches!(phone.try_recv().unwrap().kind, EventKind::IntentResolved { .. }));

        kitchen.set_filter(["*"]);
        fanout.publish(&light(), 2, state_changed(false));
        assert!(kitchen.try_recv().is_some());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let fanout = Fanout::new(8);
        let sub = fanout.subscribe("gone");
        let _keep = fanout.subscribe("stays");
        assert_eq!(fanout.subscriber_count(), 2);

        drop(sub);
        assert_eq!(fanout.subscriber_count(), 1);
        fanout.publish(&light(), 1, state_changed(true));
        assert_eq!(fanout.queues.len(), 1);
    }

    #[test]
    fn test_recv_wakes_on_publish() {
        let fanout = Fanout::new(8);
        let mut sub = fanout.subscribe("ui");

        let mut recv = task::spawn(sub.recv());
        assert_pending!(recv.poll());

        fanout.publish(&light(), 1, state_changed(true));
        assert!(recv.is_woken());
        let event = assert_ready!(recv.poll());
        assert_eq!(event.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_close_all_ends_recv() {
        let fanout = Fanout::new(8);
        let mut sub = fanout.subscribe("ui");
        fanout.close_all();
        assert!(sub.recv().await.is_none());
    }
}
