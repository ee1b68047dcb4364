//! Hub
//!
//! Owns the registry, store, dispatcher, fan-out and escalator and wires
//! them together. Transports, services and the client channel only talk to
//! the hub.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::coalesce::Coalescer;
use crate::dispatch::{AckOutcome, DispatchConfig, Dispatcher, IntentHandle, IntentId, IntentRequest, IntentView};
use crate::escalation::{Alert, Escalator, PlanAction, SafetyConfig};
use crate::fanout::{EventKind, Fanout, Subscription};
use crate::home::Settings;
use crate::registry::{Device, Registration, Registry};
use crate::store::{Recorded, Snapshot, SnapshotDb, Store, StoreConfig};
use crate::transport::{
    Ack, CommandQueue, CommandReceivers, Inbound, InboundSink, Reading, TelemetryEvent, command_queue,
    legacy,
};
use crate::types::{DeviceId, Error, Result};

/// Tunables for a hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub store: StoreConfig,
    pub dispatch: DispatchConfig,
    pub coalesce_window: Duration,
    pub fanout_capacity: usize,
    pub command_buffer: usize,
    pub priority_buffer: usize,
    pub safety: SafetyConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            dispatch: DispatchConfig::default(),
            coalesce_window: Duration::from_millis(50),
            fanout_capacity: 256,
            command_buffer: 64,
            priority_buffer: 64,
            safety: SafetyConfig::default(),
        }
    }
}

impl HubConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let timing = &settings.timing;
        Self {
            store: StoreConfig {
                liveness_window: timing.liveness_window(),
                clock_tolerance: timing.clock_tolerance(),
            },
            dispatch: DispatchConfig {
                ack_timeout: timing.ack_timeout(),
                long_travel_timeout: timing.long_travel_timeout(),
                retention: timing.intent_retention(),
            },
            coalesce_window: timing.coalesce_window(),
            fanout_capacity: settings.fanout.queue_capacity,
            command_buffer: settings.commands.buffer,
            priority_buffer: settings.commands.priority_buffer,
            safety: settings.safety.clone(),
        }
    }
}

/// Result of applying a device list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub added: Vec<DeviceId>,
    pub updated: Vec<DeviceId>,
    pub removed: Vec<DeviceId>,
    /// Devices refused by the registry, with the reason
    pub rejected: Vec<(DeviceId, String)>,
}

impl ReloadSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.rejected.is_empty()
    }
}

enum Change {
    Added,
    Updated,
}

pub struct Hub {
    registry: Arc<Registry>,
    store: Arc<Store>,
    fanout: Arc<Fanout>,
    coalescer: Arc<Coalescer>,
    dispatcher: Arc<Dispatcher>,
    escalator: Escalator,
    persist: Option<Arc<SnapshotDb>>,
    commands: CommandQueue,
}

impl Hub {
    /// Build a hub. The returned receivers belong to the controller link.
    pub fn new(config: HubConfig, persist: Option<Arc<SnapshotDb>>) -> (Arc<Self>, CommandReceivers) {
        let registry = Arc::new(Registry::new());
        let store = Arc::new(Store::new(config.store));
        let fanout = Arc::new(Fanout::new(config.fanout_capacity));
        let coalescer = Coalescer::new(
            Arc::clone(&store),
            Arc::clone(&fanout),
            persist.clone(),
            config.coalesce_window,
        );
        let (commands, receivers) = command_queue(config.command_buffer, config.priority_buffer);
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&fanout),
            Arc::clone(&coalescer),
            commands.clone(),
            config.dispatch,
        );
        let escalator = Escalator::new(
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            Arc::clone(&fanout),
            commands.clone(),
            config.safety,
        );

        let hub = Arc::new(Self {
            registry,
            store,
            fanout,
            coalescer,
            dispatcher,
            escalator,
            persist,
            commands,
        });
        (hub, receivers)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Devices
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a device and create its state entry
    pub fn register_device(&self, device: Device) -> Result<Registration> {
        let registration = self.registry.register(device.clone())?;
        if registration == Registration::Added {
            self.store.ensure(&device);
        }
        Ok(registration)
    }

    /// Initial population: register devices, then load persisted state
    pub fn install(&self, devices: Vec<Device>) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        for device in devices {
            let id = device.id.clone();
            match self.register_device(device) {
                Ok(Registration::Added) => summary.added.push(id),
                Ok(Registration::Unchanged) => {}
                Err(e) => {
                    tracing::warn!(device_id = %id, "Device not registered: {}", e);
                    summary.rejected.push((id, e.to_string()));
                }
            }
        }
        self.restore_persisted();
        tracing::info!(devices = self.registry.len(), "Home installed");
        summary
    }

    fn restore_persisted(&self) {
        let Some(db) = &self.persist else {
            return;
        };
        let records = match db.load_all() {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("Failed to load persisted state: {}", e);
                return;
            }
        };

        let mut restored = 0;
        for record in records {
            if !self.registry.contains(record.device_id.as_str()) {
                if let Err(e) = db.remove(record.device_id.as_str()) {
                    tracing::warn!(device_id = %record.device_id, "Failed to drop stale record: {}", e);
                }
                continue;
            }
            if self.store.restore(record.device_id.as_str(), record.state, record.version) {
                self.coalescer.prime(&record.device_id, record.version);
                restored += 1;
            } else {
                tracing::warn!(device_id = %record.device_id, "Persisted state no longer fits device");
            }
        }
        tracing::info!(restored, "Restored persisted device state");
    }

    /// Bring the registry in line with a reloaded device list. Identical
    /// devices are left alone; devices missing from the list are removed.
    pub fn apply_devices(&self, devices: Vec<Device>) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let wanted: HashSet<DeviceId> = devices.iter().map(|d| d.id.clone()).collect();

        for device in devices {
            let id = device.id.clone();
            let outcome = match self.registry.lookup(id.as_str()) {
                Err(_) => self.register_device(device).map(|_| Some(Change::Added)),
                Ok(existing) if *existing == device => Ok(None),
                Ok(existing) => self
                    .update_device(&existing, device)
                    .map(|_| Some(Change::Updated)),
            };
            match outcome {
                Ok(Some(Change::Added)) => summary.added.push(id),
                Ok(Some(Change::Updated)) => summary.updated.push(id),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(device_id = %id, "Reloaded device refused: {}", e);
                    summary.rejected.push((id, e.to_string()));
                }
            }
        }

        for device in self.registry.devices() {
            if !wanted.contains(&device.id) {
                self.remove_device(device.id.as_str());
                summary.removed.push(device.id.clone());
            }
        }

        summary
    }

    fn update_device(&self, existing: &Device, device: Device) -> Result<()> {
        let reshaped = existing.class != device.class || existing.capabilities != device.capabilities;
        self.registry.replace(device.clone())?;
        if reshaped {
            // The old intent's command targets a shape that no longer exists
            self.dispatcher.forget_device(device.id.as_str());
            self.escalator.forget(device.id.as_str());
            self.store.reshape(&device);
            self.coalescer.mark(&device.id);
        }
        tracing::info!(device_id = %device.id, reshaped, "Device descriptor updated");
        Ok(())
    }

    /// Remove a device, rejecting only its own in-flight intent
    pub fn remove_device(&self, id: &str) -> bool {
        let Some(device) = self.registry.remove(id) else {
            return false;
        };
        self.dispatcher.forget_device(id);
        self.escalator.forget(id);
        self.coalescer.forget(id);
        self.store.remove(id);
        if let Some(db) = &self.persist {
            if let Err(e) = db.remove(id) {
                tracing::warn!(device_id = %id, "Failed to drop persisted state: {}", e);
            }
        }
        tracing::info!(device_id = %device.id, "Device removed");
        true
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.registry.devices()
    }

    pub fn device(&self, id: &str) -> Result<Arc<Device>> {
        self.registry.lookup(id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Client surface
    // ─────────────────────────────────────────────────────────────────────────

    pub fn submit_intent(&self, request: IntentRequest) -> Result<IntentHandle> {
        self.dispatcher.submit(request)
    }

    /// Submit a legacy `room_class_verb` code
    pub fn submit_legacy(
        &self,
        client_id: impl Into<String>,
        code: &str,
        token: impl Into<String>,
    ) -> Result<IntentHandle> {
        let (device_id, action) = legacy::decode(code)?;
        self.dispatcher
            .submit(IntentRequest::new(client_id, device_id, action, token))
    }

    pub fn intent(&self, id: IntentId) -> Option<IntentView> {
        self.dispatcher.intent(id)
    }

    pub fn active_intent(&self, device_id: &str) -> Option<IntentView> {
        self.dispatcher.active_intent(device_id)
    }

    /// Current state of every device, for reconnect catch-up
    pub fn snapshot(&self) -> Vec<Snapshot> {
        self.store.snapshot_all()
    }

    pub fn device_snapshot(&self, id: &str) -> Result<Snapshot> {
        self.store.get(id)
    }

    pub fn subscribe(&self, client_id: impl Into<String>) -> Subscription {
        self.fanout.subscribe(client_id)
    }

    pub fn subscribe_filtered<S: AsRef<str>>(
        &self,
        client_id: impl Into<String>,
        patterns: impl IntoIterator<Item = S>,
    ) -> Subscription {
        self.fanout.subscribe_filtered(client_id, patterns)
    }

    /// Change which devices a subscription receives
    pub fn set_subscription_filter<S: AsRef<str>>(
        &self,
        subscriber: u64,
        patterns: impl IntoIterator<Item = S>,
    ) -> bool {
        self.fanout.set_filter(subscriber, patterns)
    }

    pub fn subscriber_count(&self) -> usize {
        self.fanout.subscriber_count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Controller traffic
    // ─────────────────────────────────────────────────────────────────────────

    pub fn ingest(&self, inbound: Inbound) {
        match inbound {
            Inbound::Telemetry(event) => {
                let _ = self.ingest_telemetry(event);
            }
            Inbound::Ack(ack) => {
                self.on_ack(&ack);
            }
        }
    }

    /// Apply a hardware report. Unknown devices and reordered records are
    /// dropped with a warning.
    pub fn ingest_telemetry(&self, event: TelemetryEvent) -> Result<Recorded> {
        let recorded = match self.store.record_telemetry(&event) {
            Ok(recorded) => recorded,
            Err(e) => {
                match &e {
                    Error::NotFound(_) => {
                        tracing::warn!(device_id = %event.device_id, "Telemetry for unknown device")
                    }
                    Error::OutOfOrder(_) => {
                        tracing::warn!(device_id = %event.device_id, "Out-of-order telemetry dropped")
                    }
                    other => tracing::warn!(device_id = %event.device_id, "Telemetry rejected: {}", other),
                }
                return Err(e);
            }
        };

        if recorded.revived {
            tracing::info!(device_id = %event.device_id, "Device reachable again");
            self.fanout.publish(
                &event.device_id,
                recorded.version,
                EventKind::Liveness { reachable: true },
            );
        }
        if recorded.changed {
            tracing::debug!(device_id = %event.device_id, version = recorded.version, "Telemetry changed state");
            self.coalescer.mark(&event.device_id);
        }

        let reading = match &event.reading {
            Reading::Value(value) => Some(*value),
            Reading::State(_) => recorded.state.measurement(),
            Reading::Heartbeat => None,
        };
        if let Some(reading) = reading {
            let critical = self
                .registry
                .lookup(event.device_id.as_str())
                .is_ok_and(|d| d.safety_class().is_some());
            if critical {
                self.escalator.on_critical_telemetry(&event.device_id, reading);
            }
        }

        Ok(recorded)
    }

    pub fn on_ack(&self, ack: &Ack) -> AckOutcome {
        self.dispatcher.on_ack(ack)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Housekeeping
    // ─────────────────────────────────────────────────────────────────────────

    /// Mark silent devices unreachable, one event per transition
    pub fn sweep_liveness(&self, now: Instant) -> usize {
        let lost = self.store.sweep(now);
        for snapshot in &lost {
            tracing::warn!(device_id = %snapshot.device_id, "Device unreachable");
            self.fanout.publish(
                &snapshot.device_id,
                snapshot.version,
                EventKind::Liveness { reachable: false },
            );
        }
        lost.len()
    }

    pub fn collect_garbage(&self, now: Instant) -> usize {
        self.dispatcher.collect_garbage(now)
    }

    pub fn retained_intents(&self) -> usize {
        self.dispatcher.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Security
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_armed(&self) -> bool {
        self.escalator.is_armed()
    }

    pub fn arm(&self) -> Vec<PlanAction> {
        self.escalator.arm()
    }

    pub fn disarm(&self) -> Vec<PlanAction> {
        self.escalator.disarm()
    }

    pub fn lockdown(&self) -> Alert {
        self.escalator.lockdown()
    }

    /// Free slots in the normal egress buffer
    pub fn command_capacity(&self) -> usize {
        self.commands.capacity()
    }

    /// Close every subscriber queue
    pub fn close(&self) {
        self.fanout.close_all();
    }
}

impl InboundSink for Hub {
    fn deliver(&self, inbound: Inbound) {
        self.ingest(inbound);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{IntentStatus, RejectReason};
    use crate::escalation::AlertCause;
    use crate::fanout::Event;
    use crate::types::{Action, DeviceClass, DeviceState, SensorKind};

    fn home() -> Vec<Device> {
        vec![
            Device::new("living_room_light", DeviceClass::Light, "living_room")
                .with_capabilities([crate::types::Capability::OnOff, crate::types::Capability::Brightness]),
            Device::new("hall_light", DeviceClass::Light, "hall"),
            Device::new("bedroom_fan_2", DeviceClass::Fan, "bedroom"),
            Device::new("garage_door_3", DeviceClass::Door, "garage").egress(true),
            Device::new("kitchen_gas", DeviceClass::Sensor, "kitchen").with_sensor_kind(SensorKind::Gas),
        ]
    }

    fn hub_with(config: HubConfig) -> (Arc<Hub>, CommandReceivers) {
        let (hub, receivers) = Hub::new(config, None);
        let summary = hub.install(home());
        assert_eq!(summary.added.len(), 5);
        (hub, receivers)
    }

    fn hub() -> (Arc<Hub>, CommandReceivers) {
        hub_with(HubConfig::default())
    }

    fn drain(sub: &mut Subscription) -> Vec<Arc<Event>> {
        std::iter::from_fn(|| sub.try_recv()).collect()
    }

    fn state_changes(events: Vec<Arc<Event>>) -> Vec<Arc<Event>> {
        events
            .into_iter()
            .filter(|e| matches!(e.kind, EventKind::StateChanged { .. }))
            .collect()
    }

    fn submit(hub: &Hub, client: &str, device: &str, action: Action, token: &str) -> IntentHandle {
        hub.submit_intent(IntentRequest::new(client, device, action, token))
            .unwrap()
    }

    fn ack(device: &str, version: u64, token: &str) -> Ack {
        Ack {
            device_id: DeviceId::from(device),
            version,
            token: Some(token.to_string()),
            ok: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_final_state() {
        let (hub, _rx) = hub();
        let mut watcher = hub.subscribe("watcher");

        for (i, level) in [10u8, 20, 30, 40, 50].into_iter().enumerate() {
            submit(&hub, "app", "living_room_light", Action::Brightness(level), &format!("t{i}"));
        }
        tokio::time::sleep(Duration::from_millis(120)).await;

        let events = drain(&mut watcher);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].version, 5);
        assert_eq!(
            events[0].kind,
            EventKind::StateChanged {
                state: DeviceState::Light {
                    on: true,
                    brightness: Some(50),
                },
                reachable: true,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_versions_only_grow() {
        let (hub, _rx) = hub();
        let mut last = hub.device_snapshot("hall_light").unwrap().version;

        for (i, on) in [true, false, true, true, false].into_iter().enumerate() {
            submit(&hub, "app", "hall_light", Action::Power(on), &format!("p{i}"));
            let version = hub.device_snapshot("hall_light").unwrap().version;
            assert!(version >= last);
            last = version;
        }
        let _ = hub.ingest_telemetry(TelemetryEvent::new(
            "hall_light",
            Reading::State(DeviceState::Light {
                on: true,
                brightness: None,
            }),
        ));
        assert!(hub.device_snapshot("hall_light").unwrap().version > last);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_token_applies_once() {
        let (hub, mut rx) = hub();

        let first = submit(&hub, "app", "hall_light", Action::Power(true), "tok-1");
        let again = submit(&hub, "app", "hall_light", Action::Power(true), "tok-1");

        assert_eq!(first.id, again.id);
        assert_eq!(hub.device_snapshot("hall_light").unwrap().version, 1);
        assert!(rx.normal.try_recv().is_ok());
        assert!(rx.normal.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_noop_intent_keeps_version() {
        let (hub, mut rx) = hub();

        let handle = submit(&hub, "app", "hall_light", Action::Power(false), "noop");

        assert_eq!(handle.status(), IntentStatus::InFlight);
        assert_eq!(hub.device_snapshot("hall_light").unwrap().version, 0);
        let command = rx.normal.try_recv().unwrap();
        assert_eq!(command.version, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failures_leave_no_trace() {
        let (hub, mut rx) = hub();

        let unknown = hub.submit_intent(IntentRequest::new("app", "attic_light", Action::Power(true), "u"));
        assert!(matches!(unknown, Err(Error::NotFound(_))));

        let unsupported = hub.submit_intent(IntentRequest::new(
            "app",
            "hall_light",
            Action::Brightness(40),
            "b",
        ));
        assert!(matches!(unsupported, Err(Error::InvalidState { .. })));

        let too_fast = hub.submit_intent(IntentRequest::new(
            "app",
            "bedroom_fan_2",
            Action::Speed(9),
            "s",
        ));
        assert!(matches!(too_fast, Err(Error::InvalidState { .. })));

        assert_eq!(hub.device_snapshot("hall_light").unwrap().version, 0);
        assert_eq!(hub.device_snapshot("bedroom_fan_2").unwrap().version, 0);
        assert!(rx.normal.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_egress_refuses_without_applying() {
        let (hub, _rx) = hub_with(HubConfig {
            command_buffer: 1,
            ..HubConfig::default()
        });

        submit(&hub, "app", "hall_light", Action::Power(true), "a");
        let refused = hub.submit_intent(IntentRequest::new(
            "app",
            "bedroom_fan_2",
            Action::Power(true),
            "b",
        ));

        assert!(matches!(refused, Err(Error::TransportUnavailable(_))));
        assert_eq!(hub.device_snapshot("bedroom_fan_2").unwrap().version, 0);
        assert_eq!(hub.command_capacity(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_overrides_optimistic_state() {
        let (hub, _rx) = hub();
        let handle = submit(&hub, "app", "hall_light", Action::Power(true), "on");

        let recorded = hub
            .ingest_telemetry(TelemetryEvent::new(
                "hall_light",
                Reading::State(DeviceState::Light {
                    on: false,
                    brightness: None,
                }),
            ))
            .unwrap();

        assert_eq!(recorded.version, 2);
        let snapshot = hub.device_snapshot("hall_light").unwrap();
        assert_eq!(
            snapshot.state,
            DeviceState::Light {
                on: false,
                brightness: None,
            }
        );
        // Telemetry alone never settles the intent
        assert_eq!(handle.status(), IntentStatus::InFlight);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_ack_is_ignored() {
        let (hub, _rx) = hub();
        let handle = submit(&hub, "app", "hall_light", Action::Power(true), "on");
        assert_eq!(hub.device_snapshot("hall_light").unwrap().version, 1);

        for on in [false, true] {
            hub.ingest_telemetry(TelemetryEvent::new(
                "hall_light",
                Reading::State(DeviceState::Light {
                    on,
                    brightness: None,
                }),
            ))
            .unwrap();
        }
        assert_eq!(hub.device_snapshot("hall_light").unwrap().version, 3);

        assert_eq!(hub.on_ack(&ack("hall_light", 1, "on")), AckOutcome::Stale);
        assert_eq!(handle.status(), IntentStatus::InFlight);
        assert_eq!(hub.device_snapshot("hall_light").unwrap().version, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_settles_and_notifies_submitter() {
        let (hub, _rx) = hub();
        let mut app = hub.subscribe("app");
        let handle = submit(&hub, "app", "hall_light", Action::Power(true), "on");

        assert_eq!(
            hub.on_ack(&ack("hall_light", 1, "on")),
            AckOutcome::Acknowledged(handle.id)
        );
        assert_eq!(handle.status(), IntentStatus::Acknowledged);
        assert!(hub.active_intent("hall_light").is_none());

        let resolved = drain(&mut app)
            .into_iter()
            .find(|e| matches!(e.kind, EventKind::IntentResolved { .. }))
            .unwrap();
        assert!(matches!(
            &resolved.kind,
            EventKind::IntentResolved { status: IntentStatus::Acknowledged, token, .. } if token == "on"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_intent_supersedes_older() {
        let (hub, _rx) = hub();
        let mut client_a = hub.subscribe("client-a");

        let a = submit(&hub, "client-a", "hall_light", Action::Power(true), "a-1");
        let b = submit(&hub, "client-b", "hall_light", Action::Power(false), "b-1");

        assert_eq!(a.status(), IntentStatus::Superseded);
        assert_eq!(b.status(), IntentStatus::InFlight);
        assert_eq!(hub.active_intent("hall_light").unwrap().id, b.id);
        assert_eq!(
            hub.device_snapshot("hall_light").unwrap().state,
            DeviceState::Light {
                on: false,
                brightness: None,
            }
        );

        // An ack for A's command no longer matches anything
        assert_eq!(hub.on_ack(&ack("hall_light", 1, "a-1")), AckOutcome::Stale);

        let superseded = drain(&mut client_a)
            .into_iter()
            .any(|e| matches!(e.kind, EventKind::IntentResolved { status: IntentStatus::Superseded, .. }));
        assert!(superseded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_telemetry_corrects_state() {
        let (hub, _rx) = hub();
        let mut watcher = hub.subscribe_filtered("watcher", ["bedroom_fan_2"]);
        let mut handle = submit(&hub, "app", "bedroom_fan_2", Action::Power(true), "fan-on");

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(handle.settled().await, IntentStatus::TimedOut);
        assert_eq!(
            hub.device_snapshot("bedroom_fan_2").unwrap().state,
            DeviceState::Fan {
                on: true,
                speed: Some(1),
            }
        );

        hub.ingest_telemetry(TelemetryEvent::new(
            "bedroom_fan_2",
            Reading::State(DeviceState::Fan {
                on: false,
                speed: Some(1),
            }),
        ))
        .unwrap();

        let snapshot = hub.device_snapshot("bedroom_fan_2").unwrap();
        assert_eq!(snapshot.version, 2);
        assert_eq!(
            snapshot.state,
            DeviceState::Fan {
                on: false,
                speed: Some(1),
            }
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        let last = state_changes(drain(&mut watcher)).pop().unwrap();
        assert_eq!(last.version, 2);
        assert_eq!(
            last.kind,
            EventKind::StateChanged {
                state: DeviceState::Fan {
                    on: false,
                    speed: Some(1),
                },
                reachable: true,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_door_gets_long_travel_window() {
        let (hub, _rx) = hub();
        let handle = submit(&hub, "app", "garage_door_3", Action::Open(true), "open");

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(handle.status(), IntentStatus::InFlight);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(handle.status(), IntentStatus::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_transitions_reported_once() {
        let (hub, _rx) = hub();
        let mut watcher = hub.subscribe_filtered("watcher", ["hall_light"]);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(hub.sweep_liveness(Instant::now()), 5);
        assert_eq!(hub.sweep_liveness(Instant::now()), 0);
        assert!(!hub.device_snapshot("hall_light").unwrap().reachable);

        let lost = drain(&mut watcher);
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].kind, EventKind::Liveness { reachable: false });

        let recorded = hub
            .ingest_telemetry(TelemetryEvent::new("hall_light", Reading::Heartbeat))
            .unwrap();
        assert!(recorded.revived);
        assert!(!recorded.changed);

        let back = drain(&mut watcher);
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].kind, EventKind::Liveness { reachable: true });
    }

    #[tokio::test(start_paused = true)]
    async fn test_reordered_telemetry_dropped() {
        let (hub, _rx) = hub();
        let base = 1_700_000_000_000;

        hub.ingest_telemetry(TelemetryEvent::new("kitchen_gas", Reading::Value(12.0)).at_source_millis(base))
            .unwrap();
        let late = hub.ingest_telemetry(
            TelemetryEvent::new("kitchen_gas", Reading::Value(30.0)).at_source_millis(base - 5_000),
        );
        assert!(matches!(late, Err(Error::OutOfOrder(_))));

        // A jump far beyond the tolerance is a reset on the device
        hub.ingest_telemetry(
            TelemetryEvent::new("kitchen_gas", Reading::Value(14.0)).at_source_millis(base - 3_600_000),
        )
        .unwrap();
        assert_eq!(
            hub.device_snapshot("kitchen_gas").unwrap().state,
            DeviceState::Sensor { value: Some(14.0) }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gas_threshold_overrides_pending_close() {
        let (hub, mut rx) = hub();
        let mut everyone = hub.subscribe_filtered("panel", ["nothing_*"]);

        hub.ingest_telemetry(TelemetryEvent::new(
            "garage_door_3",
            Reading::State(DeviceState::Door { open: true }),
        ))
        .unwrap();
        let close = submit(&hub, "app", "garage_door_3", Action::Open(false), "close");
        assert_eq!(close.status(), IntentStatus::InFlight);
        let _ = rx.normal.try_recv();

        hub.ingest_telemetry(TelemetryEvent::new("kitchen_gas", Reading::Value(520.0)))
            .unwrap();

        assert_eq!(close.status(), IntentStatus::Superseded);
        let door = hub.device_snapshot("garage_door_3").unwrap();
        assert_eq!(door.state, DeviceState::Door { open: true });
        assert_eq!(door.version, 3);
        assert_eq!(
            hub.device_snapshot("bedroom_fan_2").unwrap().state,
            DeviceState::Fan {
                on: true,
                speed: Some(1),
            }
        );

        let mut priority = Vec::new();
        while let Ok(command) = rx.priority.try_recv() {
            priority.push(command);
        }
        assert!(priority
            .iter()
            .any(|c| c.device_id.as_str() == "garage_door_3" && c.action == Action::Open(true)));
        // Regular traffic never jumps the queue
        assert!(rx.normal.try_recv().is_err());

        // Alerts ignore subscription filters
        let alert = drain(&mut everyone)
            .into_iter()
            .find_map(|e| match &e.kind {
                EventKind::Alert(alert) => Some(alert.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(alert.cause, AlertCause::Gas);
        assert_eq!(alert.source.as_str(), "kitchen_gas");

        // Still above the limit: no second escalation
        hub.ingest_telemetry(TelemetryEvent::new("kitchen_gas", Reading::Value(530.0)))
            .unwrap();
        assert!(rx.priority.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_rejects_removed_device_only() {
        let (hub, _rx) = hub();
        let fan = submit(&hub, "app", "bedroom_fan_2", Action::Power(true), "fan");
        let light = submit(&hub, "app", "hall_light", Action::Power(true), "light");

        let mut devices = home();
        devices.retain(|d| d.id.as_str() != "bedroom_fan_2");
        devices.push(Device::new("porch_light", DeviceClass::Light, "porch"));
        let summary = hub.apply_devices(devices);

        assert_eq!(summary.added, vec![DeviceId::from("porch_light")]);
        assert_eq!(summary.removed, vec![DeviceId::from("bedroom_fan_2")]);
        assert_eq!(
            fan.status(),
            IntentStatus::Rejected(RejectReason::DeviceRemoved)
        );
        assert_eq!(light.status(), IntentStatus::InFlight);
        assert!(matches!(hub.device_snapshot("bedroom_fan_2"), Err(Error::NotFound(_))));
        assert_eq!(hub.device_snapshot("porch_light").unwrap().version, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_reshapes_dimmer_into_switch() {
        let (hub, _rx) = hub();
        let mut watcher = hub.subscribe_filtered("watcher", ["living_room_light"]);
        let dim = submit(&hub, "app", "living_room_light", Action::Brightness(40), "dim");
        tokio::time::sleep(Duration::from_millis(120)).await;
        drain(&mut watcher);

        let devices: Vec<Device> = home()
            .into_iter()
            .map(|d| {
                if d.id.as_str() == "living_room_light" {
                    Device::new("living_room_light", DeviceClass::Light, "living_room")
                } else {
                    d
                }
            })
            .collect();
        let summary = hub.apply_devices(devices);

        assert_eq!(summary.updated, vec![DeviceId::from("living_room_light")]);
        assert_eq!(dim.status(), IntentStatus::Rejected(RejectReason::DeviceRemoved));
        let snapshot = hub.device_snapshot("living_room_light").unwrap();
        assert_eq!(
            snapshot.state,
            DeviceState::Light {
                on: false,
                brightness: None,
            }
        );
        assert_eq!(snapshot.version, 2);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let changes = state_changes(drain(&mut watcher));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persisted_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(SnapshotDb::open(dir.path().join("hearth.redb")).unwrap());

        let (first, _rx) = Hub::new(HubConfig::default(), Some(db.clone()));
        first.install(home());
        submit(&first, "app", "hall_light", Action::Power(true), "on");
        submit(&first, "app", "bedroom_fan_2", Action::Power(true), "fan");
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(db.load_all().unwrap().len(), 2);
        first.close();

        // The fan is gone from the new configuration
        let (second, _rx2) = Hub::new(HubConfig::default(), Some(db.clone()));
        let mut watcher = second.subscribe("watcher");
        let mut devices = home();
        devices.retain(|d| d.id.as_str() != "bedroom_fan_2");
        second.install(devices);

        let light = second.device_snapshot("hall_light").unwrap();
        assert_eq!(light.version, 1);
        assert_eq!(
            light.state,
            DeviceState::Light {
                on: true,
                brightness: None,
            }
        );
        let records = db.load_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].device_id.as_str(), "hall_light");

        // Restored state is not published again
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(state_changes(drain(&mut watcher)).is_empty());

        submit(&second, "app", "hall_light", Action::Power(false), "off");
        assert_eq!(second.device_snapshot("hall_light").unwrap().version, 2);
        tokio::time::sleep(Duration::from_millis(120)).await;
        let changes = state_changes(drain(&mut watcher));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].version, 2);
        assert_eq!(db.load_all().unwrap()[0].version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_code_submission() {
        let (hub, mut rx) = hub();

        let handle = hub.submit_legacy("panel", "hall_light_on", "legacy-1").unwrap();

        assert_eq!(handle.device_id.as_str(), "hall_light");
        assert_eq!(rx.normal.try_recv().unwrap().action, Action::Power(true));
        assert!(hub.submit_legacy("panel", "hall_light_dance", "legacy-2").is_err());
    }
}
