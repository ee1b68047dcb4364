//! Command Dispatcher / Reconciler
//!
//! Turns client intents into optimistic store writes plus outbound commands,
//! then reconciles acknowledgments and timeouts against the store.
//!
//! # Ordering
//!
//! Every intent gets a sequence number at intake. Intents for one device
//! serialize on that device's lane; within a lane the highest sequence wins
//! and anything older still active is superseded. Unrelated devices never
//! share a lock.
//!
//! # Outcomes
//!
//! Validation failures and a full egress buffer are returned to the caller
//! synchronously. Everything else (acknowledged, timed out, superseded,
//! conflict) arrives through the intent handle and as an `IntentResolved`
//! fan-out event addressed to the submitting client.

mod intent;

pub use intent::*;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::coalesce::Coalescer;
use crate::fanout::{EventKind, Fanout};
use crate::registry::Registry;
use crate::store::{CasOutcome, Store, Written};
use crate::transport::{Ack, CommandQueue, OutboundCommand};
use crate::types::{Action, DeviceId, DeviceState, Error, Result, Version};

/// Dispatcher timing
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub ack_timeout: Duration,
    /// Doors and other slow actuators
    pub long_travel_timeout: Duration,
    /// How long terminal intents (and their tokens) are kept
    pub retention: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            long_travel_timeout: Duration::from_secs(30),
            retention: Duration::from_secs(300),
        }
    }
}

/// What an acknowledgment did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged(IntentId),
    Refused(IntentId),
    /// Version or token no longer matches the active intent
    Stale,
    /// Nothing in flight for the device
    Unmatched,
}

#[derive(Default)]
struct Lane {
    active: Option<Arc<IntentCell>>,
    /// Highest sequence that reached this lane
    last_seq: u64,
    /// Version carried by the last command sent on this lane
    last_sent: Option<Version>,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    store: Arc<Store>,
    fanout: Arc<Fanout>,
    coalescer: Arc<Coalescer>,
    commands: CommandQueue,
    config: DispatchConfig,
    seq: AtomicU64,
    intents: DashMap<IntentId, Arc<IntentCell>>,
    tokens: DashMap<(DeviceId, String), IntentId>,
    lanes: DashMap<DeviceId, Arc<Mutex<Lane>>>,
    this: Weak<Dispatcher>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<Store>,
        fanout: Arc<Fanout>,
        coalescer: Arc<Coalescer>,
        commands: CommandQueue,
        config: DispatchConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            registry,
            store,
            fanout,
            coalescer,
            commands,
            config,
            seq: AtomicU64::new(0),
            intents: DashMap::new(),
            tokens: DashMap::new(),
            lanes: DashMap::new(),
            this: this.clone(),
        })
    }

    fn lane(&self, device_id: &DeviceId) -> Arc<Mutex<Lane>> {
        self.lanes
            .entry(device_id.clone())
            .or_default()
            .value()
            .clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Intake
    // ─────────────────────────────────────────────────────────────────────────

    /// Accept an intent. A repeated (device, token) pair returns the
    /// original intent instead of applying again.
    pub fn submit(&self, request: IntentRequest) -> Result<IntentHandle> {
        let key = (request.device_id.clone(), request.token.clone());
        let cell = match self.tokens.entry(key) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                drop(existing);
                return self.replay(id);
            }
            Entry::Vacant(slot) => {
                let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
                let cell = Arc::new(IntentCell::new(seq, request));
                self.intents.insert(cell.id, cell.clone());
                slot.insert(cell.id);
                cell
            }
        };

        tracing::debug!(
            intent_id = %cell.id,
            seq = cell.seq,
            device_id = %cell.request.device_id,
            client_id = %cell.request.client_id,
            action = cell.request.action.wire_name(),
            "Intent received"
        );

        if let Err(e) = self.process(&cell) {
            tracing::warn!(
                intent_id = %cell.id,
                device_id = %cell.request.device_id,
                "Intent rejected: {}",
                e
            );
            self.settle(&cell, IntentStatus::Rejected(RejectReason::from_error(&e)));
            return Err(e);
        }
        Ok(cell.handle())
    }

    fn replay(&self, id: IntentId) -> Result<IntentHandle> {
        let cell = self
            .intents
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or_else(|| Error::NotFound(format!("intent {id}")))?;

        tracing::debug!(intent_id = %id, token = %cell.request.token, "Duplicate token, returning original intent");
        if let IntentStatus::Rejected(reason) = cell.status() {
            if let Some(error) = reason.to_error(&cell.request.device_id) {
                return Err(error);
            }
        }
        Ok(cell.handle())
    }

    fn process(&self, cell: &Arc<IntentCell>) -> Result<()> {
        let request = &cell.request;
        let device = self
            .registry
            .validate(request.device_id.as_str(), &request.action)?;
        let observed = self.store.get(device.id.as_str())?;
        let invalid = |reason: String| Error::InvalidState {
            device: device.id.clone(),
            reason,
        };
        observed.state.apply(&request.action).map_err(invalid)?;

        let lane = self.lane(&device.id);
        let mut lane = lane.lock();

        if lane.last_seq > cell.seq {
            tracing::debug!(intent_id = %cell.id, "Newer intent already owns the device");
            self.settle(cell, IntentStatus::Superseded);
            return Ok(());
        }

        // Claim egress before touching state so a full buffer leaves no trace
        let permit = self.commands.reserve()?;

        if let Some(previous) = lane.active.take() {
            tracing::debug!(intent_id = %previous.id, by = %cell.id, "Intent superseded");
            self.settle(&previous, IntentStatus::Superseded);
        }
        lane.last_seq = cell.seq;

        let mut expected = observed.version;
        let mut base = observed.state;
        let mut retried = false;
        let (version, changed) = loop {
            let next = base.apply(&request.action).map_err(invalid)?;
            match self.store.compare_and_set(device.id.as_str(), expected, next)? {
                CasOutcome::Applied { version, changed } => break (version, changed),
                CasOutcome::Conflict { current } if !retried => {
                    tracing::debug!(intent_id = %cell.id, expected, current, "Version moved, revalidating");
                    retried = true;
                    let fresh = self.store.get(device.id.as_str())?;
                    expected = fresh.version;
                    base = fresh.state;
                }
                CasOutcome::Conflict { current } => {
                    tracing::warn!(intent_id = %cell.id, device_id = %device.id, current, "Conflict persisted after retry");
                    drop(permit);
                    self.settle(cell, IntentStatus::Rejected(RejectReason::Conflict));
                    return Ok(());
                }
            }
        };

        {
            let mut progress = cell.progress.lock();
            progress.produced_version = Some(version);
            progress.shared_version = lane.last_sent == Some(version);
        }
        lane.last_sent = Some(version);
        permit.send(OutboundCommand {
            device_id: device.id.clone(),
            action: request.action,
            token: request.token.clone(),
            version,
            intent_id: Some(cell.id),
        });
        cell.advance(IntentStatus::InFlight);

        let timeout = if device.class.is_long_travel() {
            self.config.long_travel_timeout
        } else {
            self.config.ack_timeout
        };
        self.arm_timeout(cell, timeout);
        lane.active = Some(cell.clone());
        drop(lane);

        if changed {
            self.coalescer.mark(&device.id);
        }
        tracing::debug!(intent_id = %cell.id, device_id = %device.id, version, changed, "Intent in flight");
        Ok(())
    }

    fn arm_timeout(&self, cell: &IntentCell, timeout: Duration) {
        let this = self.this.clone();
        let id = cell.id;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(dispatcher) = this.upgrade() {
                dispatcher.expire(id);
            }
        });
        cell.progress.lock().timeout = Some(task.abort_handle());
    }

    /// Terminal transition plus notification of the submitting client
    fn settle(&self, cell: &IntentCell, outcome: IntentStatus) {
        if !cell.finish(outcome.clone()) {
            return;
        }
        let version = cell
            .produced_version()
            .or_else(|| self.store.version_of(cell.request.device_id.as_str()).ok())
            .unwrap_or_default();

        tracing::debug!(intent_id = %cell.id, status = %outcome, "Intent settled");
        self.fanout.send_to(
            &cell.request.client_id,
            &cell.request.device_id,
            version,
            EventKind::IntentResolved {
                intent_id: cell.id,
                token: cell.request.token.clone(),
                status: outcome,
            },
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reconciliation
    // ─────────────────────────────────────────────────────────────────────────

    /// Match a controller acknowledgment against the active intent
    pub fn on_ack(&self, ack: &Ack) -> AckOutcome {
        let Some(lane) = self.lanes.get(ack.device_id.as_str()).map(|l| l.value().clone()) else {
            return AckOutcome::Unmatched;
        };
        let mut lane = lane.lock();

        let Some(active) = lane.active.clone() else {
            tracing::debug!(device_id = %ack.device_id, version = ack.version, "Ack with nothing in flight");
            return AckOutcome::Unmatched;
        };

        if ack.token.as_ref().is_some_and(|t| *t != active.request.token) {
            tracing::debug!(device_id = %ack.device_id, "Ack for an older command ignored");
            return AckOutcome::Stale;
        }

        if ack.token.is_none() && active.progress.lock().shared_version {
            tracing::debug!(device_id = %ack.device_id, version = ack.version, "Untokened ack is ambiguous, ignored");
            return AckOutcome::Stale;
        }

        let produced = active.produced_version().unwrap_or_default();
        let current = self
            .store
            .version_of(ack.device_id.as_str())
            .unwrap_or(produced);
        if ack.version < produced || current > ack.version.saturating_add(1) {
            tracing::debug!(
                device_id = %ack.device_id,
                ack_version = ack.version,
                produced,
                current,
                "Stale ack ignored"
            );
            return AckOutcome::Stale;
        }

        lane.active = None;
        drop(lane);

        if ack.ok {
            self.settle(&active, IntentStatus::Acknowledged);
            self.coalescer.mark(&ack.device_id);
            AckOutcome::Acknowledged(active.id)
        } else {
            tracing::warn!(intent_id = %active.id, device_id = %ack.device_id, "Controller refused command");
            self.settle(&active, IntentStatus::Rejected(RejectReason::ControllerRefused));
            AckOutcome::Refused(active.id)
        }
    }

    /// Time out an in-flight intent. The optimistic state stays; telemetry
    /// corrects it if the hardware never moved.
    pub fn expire(&self, id: IntentId) -> bool {
        let Some(cell) = self.intents.get(&id).map(|c| c.value().clone()) else {
            return false;
        };
        let lane = self.lane(&cell.request.device_id);
        let mut lane = lane.lock();

        if cell.status().is_terminal() {
            return false;
        }
        if lane.active.as_ref().is_some_and(|a| a.id == id) {
            lane.active = None;
        }
        drop(lane);

        tracing::warn!(intent_id = %id, device_id = %cell.request.device_id, "No acknowledgment, intent timed out");
        self.settle(&cell, IntentStatus::TimedOut);
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Overrides
    // ─────────────────────────────────────────────────────────────────────────

    /// Force a state with no version negotiation, superseding whatever is
    /// active on the device
    pub fn force_state(&self, device_id: &DeviceId, state: DeviceState) -> Result<Written> {
        self.registry.lookup(device_id.as_str())?;
        let lane = self.lane(device_id);
        let lane_guard = lane.lock();
        self.force_locked(lane_guard, device_id, state)
    }

    /// Force the result of an action
    pub fn force_action(&self, device_id: &DeviceId, action: &Action) -> Result<Written> {
        let device = self.registry.validate(device_id.as_str(), action)?;
        let lane = self.lane(device_id);
        let lane_guard = lane.lock();

        let current = self.store.get(device_id.as_str())?;
        let next = current
            .state
            .apply(action)
            .map_err(|reason| Error::InvalidState {
                device: device.id.clone(),
                reason,
            })?;
        self.force_locked(lane_guard, device_id, next)
    }

    fn force_locked(
        &self,
        mut lane: parking_lot::MutexGuard<'_, Lane>,
        device_id: &DeviceId,
        state: DeviceState,
    ) -> Result<Written> {
        if let Some(active) = lane.active.take() {
            tracing::info!(intent_id = %active.id, device_id = %device_id, "Intent superseded by override");
            self.settle(&active, IntentStatus::Superseded);
        }
        let written = self.store.force_set(device_id.as_str(), state)?;
        drop(lane);

        if written.changed {
            self.coalescer.mark(device_id);
        }
        Ok(written)
    }

    /// Drop a removed device's lane, rejecting its active intent
    pub fn forget_device(&self, device_id: &str) {
        if let Some((_, lane)) = self.lanes.remove(device_id) {
            let active = lane.lock().active.take();
            if let Some(active) = active {
                self.settle(&active, IntentStatus::Rejected(RejectReason::DeviceRemoved));
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries and housekeeping
    // ─────────────────────────────────────────────────────────────────────────

    pub fn intent(&self, id: IntentId) -> Option<IntentView> {
        self.intents.get(&id).map(|c| c.view())
    }

    pub fn active_intent(&self, device_id: &str) -> Option<IntentView> {
        let lane = self.lanes.get(device_id)?.value().clone();
        let lane = lane.lock();
        lane.active.as_ref().map(|c| c.view())
    }

    /// Drop terminal intents older than the retention window
    pub fn collect_garbage(&self, now: Instant) -> usize {
        let retention = self.config.retention;
        let expired: Vec<Arc<IntentCell>> = self
            .intents
            .iter()
            .filter(|c| {
                c.progress
                    .lock()
                    .finished_at
                    .is_some_and(|t| now.saturating_duration_since(t) >= retention)
            })
            .map(|c| c.value().clone())
            .collect();

        for cell in &expired {
            self.intents.remove(&cell.id);
            let key = (cell.request.device_id.clone(), cell.request.token.clone());
            self.tokens.remove_if(&key, |_, id| *id == cell.id);
        }
        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "Collected terminal intents");
        }
        expired.len()
    }

    /// Intents currently retained
    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}
