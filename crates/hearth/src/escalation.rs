// Safety Escalation - smoke, gas and intrusion readings drive emergency plans
//
// A reading that crosses its threshold skips the intent pipeline entirely:
// every plan step is forced into the store (superseding active intents) and
// sent on the priority buffer. Commands are fire-and-forget; a repeated
// action is preferable to a missed one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::fanout::{EventKind, Fanout};
use crate::registry::Registry;
use crate::transport::{CommandQueue, OutboundCommand};
use crate::types::{Action, DeviceClass, DeviceId, SafetyClass, Version};

/// Pseudo device id used for house-wide alerts
pub const HOME_DEVICE: &str = "home";

/// When a safety reading counts as tripped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TripCondition {
    /// Value at or above the limit
    HighLimit { value: f64 },
    /// Any non-zero reading
    Active,
}

impl TripCondition {
    fn evaluate(&self, reading: f64) -> bool {
        match self {
            TripCondition::HighLimit { value } => reading >= *value,
            TripCondition::Active => reading > 0.0,
        }
    }

    fn description(&self) -> String {
        match self {
            TripCondition::HighLimit { value } => format!("reached {value}"),
            TripCondition::Active => "active".to_string(),
        }
    }
}

/// Trip conditions per safety class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub smoke: TripCondition,
    /// ppm
    pub gas: TripCondition,
    pub intrusion: TripCondition,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            smoke: TripCondition::Active,
            gas: TripCondition::HighLimit { value: 400.0 },
            intrusion: TripCondition::Active,
        }
    }
}

impl Thresholds {
    fn condition(&self, class: SafetyClass) -> &TripCondition {
        match class {
            SafetyClass::Smoke => &self.smoke,
            SafetyClass::Gas => &self.gas,
            SafetyClass::Intrusion => &self.intrusion,
        }
    }
}

/// One step of an emergency plan: apply `action` to every device of `class`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub class: DeviceClass,
    /// Restrict to doors flagged as egress
    #[serde(default)]
    pub egress_only: bool,
    pub action: Action,
}

impl PlanStep {
    pub fn new(class: DeviceClass, action: Action) -> Self {
        Self {
            class,
            egress_only: false,
            action,
        }
    }

    pub fn egress(mut self) -> Self {
        self.egress_only = true;
        self
    }
}

/// Emergency plans
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Plans {
    pub smoke: Vec<PlanStep>,
    pub gas: Vec<PlanStep>,
    pub intrusion: Vec<PlanStep>,
    pub lockdown: Vec<PlanStep>,
}

impl Default for Plans {
    fn default() -> Self {
        use DeviceClass::*;
        Self {
            smoke: vec![
                PlanStep::new(Door, Action::Open(true)).egress(),
                PlanStep::new(Light, Action::Power(true)),
                PlanStep::new(Fan, Action::Power(false)),
                PlanStep::new(SecurityZone, Action::Siren(true)),
            ],
            gas: vec![
                PlanStep::new(Door, Action::Open(true)).egress(),
                PlanStep::new(Fan, Action::Power(true)),
                PlanStep::new(SecurityZone, Action::Siren(true)),
            ],
            intrusion: vec![
                PlanStep::new(Light, Action::Power(true)),
                PlanStep::new(Camera, Action::Record(true)),
                PlanStep::new(SecurityZone, Action::Siren(true)),
            ],
            lockdown: vec![
                PlanStep::new(Door, Action::Open(false)),
                PlanStep::new(SecurityZone, Action::Arm(true)),
                PlanStep::new(SecurityZone, Action::Siren(true)),
                PlanStep::new(Camera, Action::Record(true)),
            ],
        }
    }
}

impl Plans {
    fn for_class(&self, class: SafetyClass) -> &[PlanStep] {
        match class {
            SafetyClass::Smoke => &self.smoke,
            SafetyClass::Gas => &self.gas,
            SafetyClass::Intrusion => &self.intrusion,
        }
    }
}

/// Safety configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub thresholds: Thresholds,
    /// Armed state at boot
    pub armed: bool,
    pub plans: Plans,
}

/// Why an alert was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCause {
    Smoke,
    Gas,
    Intrusion,
    Lockdown,
}

impl From<SafetyClass> for AlertCause {
    fn from(class: SafetyClass) -> Self {
        match class {
            SafetyClass::Smoke => AlertCause::Smoke,
            SafetyClass::Gas => AlertCause::Gas,
            SafetyClass::Intrusion => AlertCause::Intrusion,
        }
    }
}

/// A command issued by an emergency plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanAction {
    pub device_id: DeviceId,
    pub action: Action,
    pub version: Version,
}

/// Broadcast to every subscriber when a plan runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub cause: AlertCause,
    pub source: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reading: Option<f64>,
    pub actions: Vec<PlanAction>,
    pub raised_at: DateTime<Utc>,
}

pub struct Escalator {
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    fanout: Arc<Fanout>,
    commands: CommandQueue,
    thresholds: Thresholds,
    plans: Plans,
    armed: AtomicBool,
    /// Last evaluation per device, for rising-edge detection
    tripped: DashMap<DeviceId, bool>,
}

impl Escalator {
    pub fn new(
        registry: Arc<Registry>,
        dispatcher: Arc<Dispatcher>,
        fanout: Arc<Fanout>,
        commands: CommandQueue,
        config: SafetyConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            fanout,
            commands,
            thresholds: config.thresholds,
            plans: config.plans,
            armed: AtomicBool::new(config.armed),
            tripped: DashMap::new(),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Evaluate a safety reading. Runs the plan when the reading newly
    /// crosses its threshold; stays quiet until it falls back below.
    pub fn on_critical_telemetry(&self, device_id: &DeviceId, reading: f64) -> Option<Alert> {
        let device = self.registry.lookup(device_id.as_str()).ok()?;
        let class = device.safety_class()?;
        let condition = self.thresholds.condition(class);

        let tripped = condition.evaluate(reading);
        let was_tripped = self
            .tripped
            .insert(device_id.clone(), tripped)
            .unwrap_or(false);
        if !tripped || was_tripped {
            return None;
        }

        if class == SafetyClass::Intrusion && !self.is_armed() {
            tracing::info!(device_id = %device_id, reading, "Intrusion reading while disarmed");
            return None;
        }

        tracing::error!(
            class = %class,
            device_id = %device_id,
            reading,
            "Safety threshold {}, running emergency plan",
            condition.description()
        );
        let actions = self.run_plan(self.plans.for_class(class));
        Some(self.raise(AlertCause::from(class), device_id.clone(), Some(reading), actions))
    }

    /// Arm the system and every security zone
    pub fn arm(&self) -> Vec<PlanAction> {
        self.armed.store(true, Ordering::SeqCst);
        tracing::info!("Security system armed");
        self.run_plan(&[PlanStep::new(DeviceClass::SecurityZone, Action::Arm(true))])
    }

    /// Disarm; zones clear their trip and silence sirens
    pub fn disarm(&self) -> Vec<PlanAction> {
        self.armed.store(false, Ordering::SeqCst);
        tracing::info!("Security system disarmed");
        self.run_plan(&[PlanStep::new(DeviceClass::SecurityZone, Action::Arm(false))])
    }

    /// Manual emergency lockdown
    pub fn lockdown(&self) -> Alert {
        self.armed.store(true, Ordering::SeqCst);
        tracing::error!("Emergency lockdown requested");
        let actions = self.run_plan(&self.plans.lockdown);
        self.raise(AlertCause::Lockdown, DeviceId::from(HOME_DEVICE), None, actions)
    }

    /// Forget edge state for a removed device
    pub fn forget(&self, device_id: &str) {
        self.tripped.remove(device_id);
    }

    fn run_plan(&self, steps: &[PlanStep]) -> Vec<PlanAction> {
        let mut issued = Vec::new();
        for step in steps {
            let targets = self
                .registry
                .of_class(step.class)
                .into_iter()
                .filter(|d| !step.egress_only || d.egress)
                .filter(|d| d.has(step.action.capability()));

            for device in targets {
                let written = match self.dispatcher.force_action(&device.id, &step.action) {
                    Ok(written) => written,
                    Err(e) => {
                        tracing::warn!(device_id = %device.id, "Emergency step skipped: {}", e);
                        continue;
                    }
                };

                let command = OutboundCommand {
                    device_id: device.id.clone(),
                    action: step.action,
                    token: format!("safety-{}", Uuid::new_v4()),
                    version: written.version,
                    intent_id: None,
                };
                if let Err(e) = self.commands.send_priority(command) {
                    tracing::error!(device_id = %device.id, "Emergency command not queued: {}", e);
                }
                issued.push(PlanAction {
                    device_id: device.id.clone(),
                    action: step.action,
                    version: written.version,
                });
            }
        }
        issued
    }

    fn raise(
        &self,
        cause: AlertCause,
        source: DeviceId,
        reading: Option<f64>,
        actions: Vec<PlanAction>,
    ) -> Alert {
        let alert = Alert {
            cause,
            source: source.clone(),
            reading,
            actions,
            raised_at: Utc::now(),
        };
        self.fanout
            .publish(&source, 0, EventKind::Alert(alert.clone()));
        alert
    }
}
