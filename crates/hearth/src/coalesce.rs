//! Coalescing state-change emitter
//!
//! Mutations only mark a device dirty. The first mark schedules a flush
//! after a short window; the flush reads the final snapshot and publishes it
//! unless that version was already published. N intents landing inside the
//! window produce exactly one event carrying the final state.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::fanout::{EventKind, Fanout};
use crate::store::{SnapshotDb, Store};
use crate::types::{DeviceId, Version};

pub struct Coalescer {
    store: Arc<Store>,
    fanout: Arc<Fanout>,
    persist: Option<Arc<SnapshotDb>>,
    window: Duration,
    scheduled: DashMap<DeviceId, ()>,
    /// Highest version published per device; the lock orders publishes
    emitted: DashMap<DeviceId, Arc<Mutex<Version>>>,
    this: Weak<Coalescer>,
}

impl Coalescer {
    pub fn new(
        store: Arc<Store>,
        fanout: Arc<Fanout>,
        persist: Option<Arc<SnapshotDb>>,
        window: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            store,
            fanout,
            persist,
            window,
            scheduled: DashMap::new(),
            emitted: DashMap::new(),
            this: this.clone(),
        })
    }

    /// Record that `device_id` changed. Flushes immediately with a zero
    /// window, otherwise at most one flush is pending per device.
    pub fn mark(&self, device_id: &DeviceId) {
        if self.window.is_zero() {
            self.flush(device_id);
            return;
        }
        if self.scheduled.insert(device_id.clone(), ()).is_some() {
            return;
        }

        let Some(this) = self.this.upgrade() else {
            return;
        };
        let device_id = device_id.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // Unschedule first so a change racing the flush schedules anew
            this.scheduled.remove(&device_id);
            this.flush(&device_id);
        });
    }

    /// Publish the current snapshot if its version is new. Returns the
    /// published version.
    pub fn flush(&self, device_id: &DeviceId) -> Option<Version> {
        let guard = self
            .emitted
            .entry(device_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .value()
            .clone();
        let mut last = guard.lock();

        let snapshot = match self.store.get(device_id.as_str()) {
            Ok(snapshot) => snapshot,
            Err(_) => {
                tracing::debug!(device_id = %device_id, "Device gone before flush");
                return None;
            }
        };
        if snapshot.version <= *last {
            return None;
        }
        *last = snapshot.version;

        if let Some(db) = &self.persist {
            if let Err(e) = db.save(device_id, &snapshot.state, snapshot.version) {
                tracing::error!(device_id = %device_id, "Failed to persist state: {}", e);
            }
        }

        tracing::debug!(device_id = %device_id, version = snapshot.version, "State change published");
        self.fanout.publish(
            device_id,
            snapshot.version,
            EventKind::StateChanged {
                state: snapshot.state,
                reachable: snapshot.reachable,
            },
        );
        Some(snapshot.version)
    }

    /// Treat `version` as already published (state restored from disk)
    pub fn prime(&self, device_id: &DeviceId, version: Version) {
        let guard = self
            .emitted
            .entry(device_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .value()
            .clone();
        let mut last = guard.lock();
        *last = (*last).max(version);
    }

    pub fn forget(&self, device_id: &str) {
        self.scheduled.remove(device_id);
        self.emitted.remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Device;
    use crate::store::{CasOutcome, StoreConfig};
    use crate::types::{DeviceClass, DeviceState};

    fn setup(window: Duration) -> (Arc<Store>, Arc<Fanout>, Arc<Coalescer>) {
        let store = Arc::new(Store::new(StoreConfig::default()));
        store.ensure(&Device::new("hall_light", DeviceClass::Light, "hall"));
        let fanout = Arc::new(Fanout::new(16));
        let coalescer = Coalescer::new(store.clone(), fanout.clone(), None, window);
        (store, fanout, coalescer)
    }

    fn toggle(store: &Store, on: bool) {
        let version = store.version_of("hall_light").unwrap();
        let outcome = store
            .compare_and_set("hall_light", version, DeviceState::Light { on, brightness: None })
            .unwrap();
        assert!(matches!(outcome, CasOutcome::Applied { changed: true, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_produces_one_event() {
        let (store, fanout, coalescer) = setup(Duration::from_millis(50));
        let mut sub = fanout.subscribe("ui");
        let id = DeviceId::from("hall_light");

        for on in [true, false, true] {
            toggle(&store, on);
            coalescer.mark(&id);
        }

        tokio::time::sleep(Duration::from_millis(60)).await;

        let event = sub.try_recv().unwrap();
        assert_eq!(event.version, 3);
        assert!(matches!(
            &event.kind,
            EventKind::StateChanged { state: DeviceState::Light { on: true, .. }, .. }
        ));
        assert!(sub.try_recv().is_none());

        // Re-marking without a new version publishes nothing
        coalescer.mark(&id);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_zero_window_flushes_inline() {
        let (store, fanout, coalescer) = setup(Duration::ZERO);
        let mut sub = fanout.subscribe("ui");
        let id = DeviceId::from("hall_light");

        toggle(&store, true);
        coalescer.mark(&id);
        assert_eq!(sub.try_recv().unwrap().version, 1);

        coalescer.prime(&id, 5);
        toggle(&store, false);
        assert_eq!(coalescer.flush(&id), None);
    }
}
