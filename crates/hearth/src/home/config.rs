//! Home Configuration Types
//!
//! Defines the structure of the home directory on disk:
//!
//! ```text
//! home.toml              settings and home identity
//! rooms/*.room.toml      one file per room, with [[devices]] tables
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::escalation::SafetyConfig;
use crate::registry::Device;
use crate::transport::WireFormat;
use crate::types::{Capability, DeviceClass, SensorKind};

use super::LoadError;

/// Everything `home.toml` (and `HEARTH_*` variables) can set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub home: HomeInfo,
    pub server: ServerSettings,
    pub controller: ControllerSettings,
    pub timing: TimingSettings,
    pub fanout: FanoutSettings,
    pub commands: CommandSettings,
    pub persistence: PersistenceSettings,
    pub safety: SafetyConfig,
}

impl Settings {
    /// Layer compiled defaults, `<home>/home.toml` and the environment
    pub fn load(home_dir: impl AsRef<Path>) -> Result<Self, LoadError> {
        Self::figment(home_dir.as_ref())
            .extract()
            .map_err(|e| LoadError::Settings(Box::new(e)))
    }

    pub fn figment(home_dir: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(home_dir.join("home.toml")))
            .merge(Env::prefixed("HEARTH_").split("__"))
    }
}

/// Home identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeInfo {
    pub id: String,
    pub name: String,
}

impl Default for HomeInfo {
    fn default() -> Self {
        Self {
            id: "home".to_string(),
            name: "Home".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9700,
        }
    }
}

/// Field-controller link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// host:port of the controller; no link is started without one
    pub address: Option<String>,
    pub wire_format: WireFormat,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            address: None,
            wire_format: WireFormat::Json,
            backoff_min_ms: 250,
            backoff_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub ack_timeout_ms: u64,
    pub long_travel_timeout_ms: u64,
    pub coalesce_window_ms: u64,
    pub heartbeat_interval_secs: u64,
    /// Heartbeats missed before a device is unreachable
    pub missed_heartbeats: u32,
    pub sweep_interval_ms: u64,
    pub intent_retention_secs: u64,
    pub janitor_interval_secs: u64,
    /// Largest backwards jump in hardware time still treated as reordering
    pub clock_tolerance_secs: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5_000,
            long_travel_timeout_ms: 30_000,
            coalesce_window_ms: 50,
            heartbeat_interval_secs: 10,
            missed_heartbeats: 3,
            sweep_interval_ms: 1_000,
            intent_retention_secs: 300,
            janitor_interval_secs: 30,
            clock_tolerance_secs: 60,
        }
    }
}

impl TimingSettings {
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * u64::from(self.missed_heartbeats.max(1)))
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn long_travel_timeout(&self) -> Duration {
        Duration::from_millis(self.long_travel_timeout_ms)
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn intent_retention(&self) -> Duration {
        Duration::from_secs(self.intent_retention_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs.max(1))
    }

    pub fn clock_tolerance(&self) -> Duration {
        Duration::from_secs(self.clock_tolerance_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutSettings {
    pub queue_capacity: usize,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    pub buffer: usize,
    pub priority_buffer: usize,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            buffer: 64,
            priority_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub enabled: bool,
    /// Relative paths resolve against the home directory
    pub path: PathBuf,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("data/hearth.redb"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rooms
// ─────────────────────────────────────────────────────────────────────────────

/// Room file (rooms/*.room.toml)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomFile {
    pub room: RoomInfo,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: String,
    pub name: Option<String>,
}

/// A `[[devices]]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub name: Option<String>,
    pub class: DeviceClass,
    /// Defaults to the class capabilities
    pub capabilities: Option<Vec<Capability>>,
    /// Sensor kind
    pub kind: Option<SensorKind>,
    #[serde(default)]
    pub egress: bool,
}

impl DeviceConfig {
    pub fn to_device(&self, room: &str) -> Device {
        let mut device = Device::new(self.id.as_str(), self.class, room).egress(self.egress);
        if let Some(name) = &self.name {
            device = device.with_name(name.clone());
        }
        if let Some(capabilities) = &self.capabilities {
            device = device.with_capabilities(capabilities.iter().copied());
        }
        if let Some(kind) = self.kind {
            device = device.with_sensor_kind(kind);
        }
        device
    }
}

impl RoomFile {
    pub fn to_devices(&self) -> Vec<Device> {
        self.devices
            .iter()
            .map(|d| d.to_device(&self.room.id))
            .collect()
    }
}
