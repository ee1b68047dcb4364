//! State Store
//!
//! Authoritative map of device id to current state and version.
//! Every device gets its own lock; the outer map is only touched to find
//! the slot, so writers on one device never stall readers of another.

mod persist;

pub use persist::*;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::registry::Device;
use crate::transport::{Reading, TelemetryEvent};
use crate::types::{DeviceId, DeviceState, Error, Result, Version};

/// Point-in-time view of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub device_id: DeviceId,
    pub state: DeviceState,
    pub version: Version,
    pub reachable: bool,
    pub last_seen: DateTime<Utc>,
}

/// Outcome of [`Store::compare_and_set`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// `changed` is false when the new state equals the current one
    Applied { version: Version, changed: bool },
    Conflict { current: Version },
}

/// Outcome of an unconditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Written {
    pub version: Version,
    pub changed: bool,
}

/// Outcome of [`Store::record_telemetry`]
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub version: Version,
    pub changed: bool,
    /// Device was unreachable before this record
    pub revived: bool,
    pub state: DeviceState,
}

#[derive(Debug)]
struct Slot {
    state: DeviceState,
    version: Version,
    reachable: bool,
    last_seen: Instant,
    last_seen_at: DateTime<Utc>,
    last_source_ts: Option<DateTime<Utc>>,
}

impl Slot {
    fn new(state: DeviceState) -> Self {
        Self {
            state,
            version: 0,
            reachable: true,
            last_seen: Instant::now(),
            last_seen_at: Utc::now(),
            last_source_ts: None,
        }
    }

    fn snapshot(&self, device_id: &DeviceId) -> Snapshot {
        Snapshot {
            device_id: device_id.clone(),
            state: self.state.clone(),
            version: self.version,
            reachable: self.reachable,
            last_seen: self.last_seen_at,
        }
    }

    fn write(&mut self, state: DeviceState) -> Written {
        let changed = state != self.state;
        if changed {
            self.state = state;
            self.version += 1;
        }
        Written {
            version: self.version,
            changed,
        }
    }
}

/// Store tuning
#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// Silence after which a device is marked unreachable
    pub liveness_window: Duration,

    /// Source timestamps that go backwards by more than this are a clock
    /// reset on the hardware, not reordering
    pub clock_tolerance: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            liveness_window: Duration::from_secs(30),
            clock_tolerance: Duration::from_secs(60),
        }
    }
}

/// Per-device partitioned state map
pub struct Store {
    slots: DashMap<DeviceId, Arc<Mutex<Slot>>>,
    config: StoreConfig,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            slots: DashMap::new(),
            config,
        }
    }

    fn slot(&self, id: &str) -> Result<Arc<Mutex<Slot>>> {
        self.slots
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::NotFound(format!("device {id}")))
    }

    /// Create the entry for a registered device. Returns false if present.
    pub fn ensure(&self, device: &Device) -> bool {
        let mut inserted = false;
        self.slots.entry(device.id.clone()).or_insert_with(|| {
            inserted = true;
            Arc::new(Mutex::new(Slot::new(DeviceState::initial(
                device.class,
                &device.capabilities,
            ))))
        });
        inserted
    }

    /// Reset the entry when a reloaded descriptor changes the state shape.
    /// The version keeps counting so it never goes backwards.
    pub fn reshape(&self, device: &Device) {
        let initial = DeviceState::initial(device.class, &device.capabilities);
        match self.slot(device.id.as_str()) {
            Ok(slot) => {
                let mut slot = slot.lock();
                if !slot.state.same_shape(&initial) {
                    slot.write(initial);
                }
            }
            Err(_) => {
                self.ensure(device);
            }
        }
    }

    /// Load a persisted value. Ignored when the shape no longer matches the
    /// device or the stored version is older than what is in memory.
    pub fn restore(&self, id: &str, state: DeviceState, version: Version) -> bool {
        let Ok(slot) = self.slot(id) else {
            return false;
        };
        let mut slot = slot.lock();
        if !state.same_shape(&slot.state) || version < slot.version {
            return false;
        }
        slot.state = state;
        slot.version = version;
        true
    }

    pub fn remove(&self, id: &str) -> bool {
        self.slots.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Result<Snapshot> {
        let slot = self.slot(id)?;
        let slot = slot.lock();
        Ok(slot.snapshot(&DeviceId::from(id)))
    }

    pub fn version_of(&self, id: &str) -> Result<Version> {
        Ok(self.slot(id)?.lock().version)
    }

    /// All devices ordered by id
    pub fn snapshot_all(&self) -> Vec<Snapshot> {
        let slots: Vec<(DeviceId, Arc<Mutex<Slot>>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut all: Vec<Snapshot> = slots
            .iter()
            .map(|(id, slot)| slot.lock().snapshot(id))
            .collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    /// Write `state` only if the version is still `expected`
    pub fn compare_and_set(
        &self,
        id: &str,
        expected: Version,
        state: DeviceState,
    ) -> Result<CasOutcome> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock();

        if slot.version != expected {
            return Ok(CasOutcome::Conflict {
                current: slot.version,
            });
        }
        if state.class() != slot.state.class() {
            return Err(Error::InvalidState {
                device: DeviceId::from(id),
                reason: format!("expected a {} state", slot.state.class()),
            });
        }

        let written = slot.write(state);
        Ok(CasOutcome::Applied {
            version: written.version,
            changed: written.changed,
        })
    }

    /// Unconditional write, used by telemetry and safety overrides
    pub fn force_set(&self, id: &str, state: DeviceState) -> Result<Written> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock();

        if state.class() != slot.state.class() {
            return Err(Error::InvalidState {
                device: DeviceId::from(id),
                reason: format!("expected a {} state", slot.state.class()),
            });
        }
        Ok(slot.write(state))
    }

    /// Apply a hardware report. Hardware is authoritative, so accepted
    /// records overwrite whatever was optimistically applied.
    pub fn record_telemetry(&self, event: &TelemetryEvent) -> Result<Recorded> {
        let slot = self.slot(event.device_id.as_str())?;
        let mut slot = slot.lock();

        if let (Some(ts), Some(last)) = (event.source_ts, slot.last_source_ts) {
            if ts < last {
                let regression = (last - ts).to_std().unwrap_or_default();
                if regression <= self.config.clock_tolerance {
                    return Err(Error::OutOfOrder(event.device_id.clone()));
                }
                tracing::warn!(
                    device_id = %event.device_id,
                    regression_ms = regression.as_millis() as u64,
                    "Device clock went backwards, treating as a reset"
                );
            }
        }

        let next = match &event.reading {
            Reading::State(state) => {
                if state.class() != slot.state.class() {
                    return Err(Error::InvalidState {
                        device: event.device_id.clone(),
                        reason: format!("telemetry reports a {} state", state.class()),
                    });
                }
                state.clone()
            }
            Reading::Value(value) => slot
                .state
                .with_measurement(*value)
                .map_err(|reason| Error::InvalidState {
                    device: event.device_id.clone(),
                    reason,
                })?,
            Reading::Heartbeat => slot.state.clone(),
        };

        if event.source_ts.is_some() {
            slot.last_source_ts = event.source_ts;
        }
        slot.last_seen = Instant::now();
        slot.last_seen_at = event.received_at;
        let revived = !slot.reachable;
        slot.reachable = true;

        let written = slot.write(next);
        Ok(Recorded {
            version: written.version,
            changed: written.changed,
            revived,
            state: slot.state.clone(),
        })
    }

    /// Mark devices silent for longer than the liveness window unreachable.
    /// Each device is reported once per transition.
    pub fn sweep(&self, now: Instant) -> Vec<Snapshot> {
        let slots: Vec<(DeviceId, Arc<Mutex<Slot>>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut lost = Vec::new();
        for (id, slot) in slots {
            let mut slot = slot.lock();
            if slot.reachable
                && now.saturating_duration_since(slot.last_seen) > self.config.liveness_window
            {
                slot.reachable = false;
                lost.push(slot.snapshot(&id));
            }
        }
        lost
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
