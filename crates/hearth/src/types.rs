use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-device mutation counter
pub type Version = u64;

/// Highest fan speed step accepted by the controller firmware
pub const MAX_FAN_SPEED: u8 = 5;

/// Highest brightness (percent)
pub const MAX_BRIGHTNESS: u8 = 100;

/// Stable, globally unique device identifier (e.g. "kitchen_light")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Light,
    Fan,
    Door,
    Sensor,
    Camera,
    #[serde(alias = "security-zone")]
    SecurityZone,
}

impl DeviceClass {
    /// Capabilities a device of this class gets when none are configured
    pub fn default_capabilities(&self) -> BTreeSet<Capability> {
        let caps: &[Capability] = match self {
            DeviceClass::Light => &[Capability::OnOff],
            DeviceClass::Fan => &[Capability::OnOff, Capability::Speed],
            DeviceClass::Door => &[Capability::OpenClose],
            DeviceClass::Sensor => &[Capability::Measure],
            DeviceClass::Camera => &[Capability::Record],
            DeviceClass::SecurityZone => &[Capability::Arm, Capability::Siren],
        };
        caps.iter().copied().collect()
    }

    /// Whether a capability makes sense for this class at all
    pub fn allows(&self, capability: Capability) -> bool {
        use Capability::*;
        match self {
            DeviceClass::Light => matches!(capability, OnOff | Brightness),
            DeviceClass::Fan => matches!(capability, OnOff | Speed),
            DeviceClass::Door => matches!(capability, OpenClose),
            DeviceClass::Sensor => matches!(capability, Measure),
            DeviceClass::Camera => matches!(capability, Record),
            DeviceClass::SecurityZone => matches!(capability, Arm | Siren | Measure),
        }
    }

    /// Doors travel slowly and get the long acknowledgment window
    pub fn is_long_travel(&self) -> bool {
        matches!(self, DeviceClass::Door)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Light => "light",
            DeviceClass::Fan => "fan",
            DeviceClass::Door => "door",
            DeviceClass::Sensor => "sensor",
            DeviceClass::Camera => "camera",
            DeviceClass::SecurityZone => "security_zone",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something a device can do or report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    OnOff,
    Brightness,
    Speed,
    OpenClose,
    Measure,
    Record,
    Arm,
    Siren,
}

/// What a sensor measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Smoke,
    Gas,
    Motion,
    Contact,
    Temperature,
    Humidity,
    #[default]
    Generic,
}

/// Telemetry classes that bypass normal reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyClass {
    Smoke,
    Gas,
    Intrusion,
}

impl fmt::Display for SafetyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SafetyClass::Smoke => "smoke",
            SafetyClass::Gas => "gas",
            SafetyClass::Intrusion => "intrusion",
        })
    }
}

/// Current state of a device, shaped by its class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceState {
    Light {
        on: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        brightness: Option<u8>,
    },
    Fan {
        on: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<u8>,
    },
    Door {
        open: bool,
    },
    Sensor {
        #[serde(default)]
        value: Option<f64>,
    },
    Camera {
        recording: bool,
    },
    Zone {
        armed: bool,
        #[serde(default)]
        triggered: bool,
        #[serde(default)]
        siren: bool,
    },
}

impl DeviceState {
    /// Power-on default for a device
    pub fn initial(class: DeviceClass, capabilities: &BTreeSet<Capability>) -> Self {
        match class {
            DeviceClass::Light => DeviceState::Light {
                on: false,
                brightness: capabilities
                    .contains(&Capability::Brightness)
                    .then_some(MAX_BRIGHTNESS),
            },
            DeviceClass::Fan => DeviceState::Fan {
                on: false,
                speed: capabilities.contains(&Capability::Speed).then_some(1),
            },
            DeviceClass::Door => DeviceState::Door { open: false },
            DeviceClass::Sensor => DeviceState::Sensor { value: None },
            DeviceClass::Camera => DeviceState::Camera { recording: false },
            DeviceClass::SecurityZone => DeviceState::Zone {
                armed: false,
                triggered: false,
                siren: false,
            },
        }
    }

    /// Same class and the same optional fields present
    pub fn same_shape(&self, other: &DeviceState) -> bool {
        match (self, other) {
            (
                DeviceState::Light { brightness: a, .. },
                DeviceState::Light { brightness: b, .. },
            ) => a.is_some() == b.is_some(),
            (DeviceState::Fan { speed: a, .. }, DeviceState::Fan { speed: b, .. }) => {
                a.is_some() == b.is_some()
            }
            (a, b) => a.class() == b.class(),
        }
    }

    pub fn class(&self) -> DeviceClass {
        match self {
            DeviceState::Light { .. } => DeviceClass::Light,
            DeviceState::Fan { .. } => DeviceClass::Fan,
            DeviceState::Door { .. } => DeviceClass::Door,
            DeviceState::Sensor { .. } => DeviceClass::Sensor,
            DeviceState::Camera { .. } => DeviceClass::Camera,
            DeviceState::Zone { .. } => DeviceClass::SecurityZone,
        }
    }

    /// State after applying an action; errors name the mismatch
    pub fn apply(&self, action: &Action) -> std::result::Result<DeviceState, String> {
        let next = match (self, *action) {
            (DeviceState::Light { brightness, .. }, Action::Power(on)) => DeviceState::Light {
                on,
                brightness: *brightness,
            },
            (DeviceState::Light { .. }, Action::Brightness(level)) => DeviceState::Light {
                on: level > 0,
                brightness: Some(level),
            },
            (DeviceState::Fan { speed, .. }, Action::Power(on)) => DeviceState::Fan {
                on,
                speed: *speed,
            },
            (DeviceState::Fan { .. }, Action::Speed(step)) => DeviceState::Fan {
                on: step > 0,
                speed: Some(step),
            },
            (DeviceState::Door { .. }, Action::Open(open)) => DeviceState::Door { open },
            (DeviceState::Camera { .. }, Action::Record(recording)) => {
                DeviceState::Camera { recording }
            }
            // Disarming also clears the trip and silences the siren.
            (DeviceState::Zone { .. }, Action::Arm(false)) => DeviceState::Zone {
                armed: false,
                triggered: false,
                siren: false,
            },
            (DeviceState::Zone { triggered, siren, .. }, Action::Arm(true)) => DeviceState::Zone {
                armed: true,
                triggered: *triggered,
                siren: *siren,
            },
            (DeviceState::Zone { armed, triggered, .. }, Action::Siren(siren)) => {
                DeviceState::Zone {
                    armed: *armed,
                    triggered: *triggered,
                    siren,
                }
            }
            (state, action) => {
                return Err(format!(
                    "action '{}' does not apply to a {}",
                    action.wire_name(),
                    state.class()
                ));
            }
        };
        Ok(next)
    }

    /// State after a scalar hardware reading
    pub fn with_measurement(&self, value: f64) -> std::result::Result<DeviceState, String> {
        match self {
            DeviceState::Sensor { .. } => Ok(DeviceState::Sensor { value: Some(value) }),
            DeviceState::Zone { armed, siren, .. } => Ok(DeviceState::Zone {
                armed: *armed,
                triggered: value > 0.0,
                siren: *siren,
            }),
            other => Err(format!("a {} does not report scalar values", other.class())),
        }
    }

    /// Scalar reading used by safety thresholds
    pub fn measurement(&self) -> Option<f64> {
        match self {
            DeviceState::Sensor { value } => *value,
            DeviceState::Zone { triggered, .. } => Some(if *triggered { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

/// A requested state change, keyed by the capability it exercises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum Action {
    Power(bool),
    Brightness(u8),
    Speed(u8),
    Open(bool),
    Record(bool),
    Arm(bool),
    Siren(bool),
}

impl Action {
    pub fn capability(&self) -> Capability {
        match self {
            Action::Power(_) => Capability::OnOff,
            Action::Brightness(_) => Capability::Brightness,
            Action::Speed(_) => Capability::Speed,
            Action::Open(_) => Capability::OpenClose,
            Action::Record(_) => Capability::Record,
            Action::Arm(_) => Capability::Arm,
            Action::Siren(_) => Capability::Siren,
        }
    }

    pub fn check_range(&self) -> std::result::Result<(), String> {
        match *self {
            Action::Brightness(level) if level > MAX_BRIGHTNESS => {
                Err(format!("brightness {level} exceeds {MAX_BRIGHTNESS}"))
            }
            Action::Speed(step) if step > MAX_FAN_SPEED => {
                Err(format!("fan speed {step} exceeds {MAX_FAN_SPEED}"))
            }
            _ => Ok(()),
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            Action::Power(_) => "power",
            Action::Brightness(_) => "brightness",
            Action::Speed(_) => "speed",
            Action::Open(_) => "open",
            Action::Record(_) => "record",
            Action::Arm(_) => "arm",
            Action::Siren(_) => "siren",
        }
    }

    pub fn wire_value(&self) -> serde_json::Value {
        match *self {
            Action::Power(v) | Action::Open(v) | Action::Record(v) | Action::Arm(v) | Action::Siren(v) => {
                serde_json::Value::Bool(v)
            }
            Action::Brightness(v) | Action::Speed(v) => serde_json::Value::from(v),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state for {device}: {reason}")]
    InvalidState { device: DeviceId, reason: String },

    #[error("Conflicting update on {0}")]
    Conflict(DeviceId),

    #[error("No acknowledgment from {0}")]
    Timeout(DeviceId),

    #[error("Field controller unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Device {0} already registered with different capabilities")]
    DuplicateDevice(DeviceId),

    #[error("Out-of-order telemetry for {0}")]
    OutOfOrder(DeviceId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),


    #[error("Database error: {0}")]
    Database(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_light_actions() {
        let caps = [Capability::OnOff, Capability::Brightness].into_iter().collect();
        let light = DeviceState::initial(DeviceClass::Light, &caps);
        assert_eq!(light, DeviceState::Light { on: false, brightness: Some(100) });

        let dimmed = light.apply(&Action::Brightness(40)).unwrap();
        assert_eq!(dimmed, DeviceState::Light { on: true, brightness: Some(40) });

        let off = dimmed.apply(&Action::Power(false)).unwrap();
        assert_eq!(off, DeviceState::Light { on: false, brightness: Some(40) });
    }

    #[test]
    fn test_action_class_mismatch() {
        let door = DeviceState::Door { open: false };
        let err = door.apply(&Action::Power(true)).unwrap_err();
        assert!(err.contains("power"));
        assert!(err.contains("door"));
    }

    #[test]
    fn test_disarm_clears_zone() {
        let zone = DeviceState::Zone { armed: true, triggered: true, siren: true };
        let disarmed = zone.apply(&Action::Arm(false)).unwrap();
        assert_eq!(disarmed, DeviceState::Zone { armed: false, triggered: false, siren: false });
    }

    #[test]
    fn test_action_ranges() {
        assert!(Action::Brightness(100).check_range().is_ok());
        assert!(Action::Brightness(101).check_range().is_err());
        assert!(Action::Speed(MAX_FAN_SPEED + 1).check_range().is_err());
    }

    #[test]
    fn test_action_serde_shape() {
        let json = serde_json::to_value(Action::Brightness(40)).unwrap();
        assert_eq!(json, serde_json::json!({"action": "brightness", "value": 40}));

        let parsed: Action = serde_json::from_value(serde_json::json!({"action": "open", "value": true})).unwrap();
        assert_eq!(parsed, Action::Open(true));
    }

    #[test]
    fn test_state_serde_shape() {
        let state: DeviceState =
            serde_json::from_value(serde_json::json!({"kind": "sensor", "value": 412.5})).unwrap();
        assert_eq!(state.measurement(), Some(412.5));
        assert_eq!(state.class(), DeviceClass::Sensor);
    }

    #[test]
    fn test_class_capabilities() {
        assert!(DeviceClass::Light.allows(Capability::Brightness));
        assert!(!DeviceClass::Door.allows(Capability::OnOff));
        assert!(DeviceClass::Fan.default_capabilities().contains(&Capability::Speed));
        assert!(DeviceClass::Door.is_long_travel());
    }
}
