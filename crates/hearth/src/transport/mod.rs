//! Transport Adapters
//!
//! Normalizes the field-controller wire protocol into [`Inbound`] messages
//! and carries [`OutboundCommand`]s back out. Frames are newline-delimited
//! JSON; egress may alternatively use the legacy underscore codes.

mod controller;
pub mod legacy;

pub use controller::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::dispatch::IntentId;
use crate::types::{Action, DeviceId, DeviceState, Error, Result, Version};

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// What a telemetry record reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Reading {
    /// Full device state
    State(DeviceState),
    /// Scalar measurement (sensors, zone trip level)
    Value(f64),
    /// Alive, nothing changed
    Heartbeat,
}

/// Normalized hardware report
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub device_id: DeviceId,
    pub reading: Reading,
    /// Clock of the reporting hardware, unreliable
    pub source_ts: Option<DateTime<Utc>>,
    /// Server clock at receipt
    pub received_at: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(device_id: impl Into<DeviceId>, reading: Reading) -> Self {
        Self {
            device_id: device_id.into(),
            reading,
            source_ts: None,
            received_at: Utc::now(),
        }
    }

    pub fn at_source_millis(mut self, millis: i64) -> Self {
        self.source_ts = DateTime::from_timestamp_millis(millis);
        self
    }
}

/// Controller acknowledgment of an outbound command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub device_id: DeviceId,
    /// Version carried by the acknowledged command
    pub version: Version,
    pub token: Option<String>,
    /// False when the controller refused the command
    pub ok: bool,
}

/// Frames received from the field controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Telemetry {
        device_id: DeviceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<DeviceState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<f64>,
        /// Source timestamp, unix milliseconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<i64>,
    },
    Heartbeat {
        device_id: DeviceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<i64>,
    },
    Ack {
        device_id: DeviceId,
        version: Version,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default = "default_ok")]
        ok: bool,
    },
}

fn default_ok() -> bool {
    true
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Telemetry(TelemetryEvent),
    Ack(Ack),
}

impl InboundFrame {
    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| Error::Protocol(format!("bad frame: {e}")))
    }

    /// Normalize, stamping the receipt time
    pub fn into_inbound(self, received_at: DateTime<Utc>) -> Result<Inbound> {
        let inbound = match self {
            InboundFrame::Telemetry {
                device_id,
                state,
                value,
                ts,
            } => {
                let reading = match (state, value) {
                    (Some(state), _) => Reading::State(state),
                    (None, Some(value)) => Reading::Value(value),
                    (None, None) => {
                        return Err(Error::Protocol(format!(
                            "telemetry for {device_id} carries neither state nor value"
                        )));
                    }
                };
                Inbound::Telemetry(TelemetryEvent {
                    device_id,
                    reading,
                    source_ts: ts.and_then(DateTime::from_timestamp_millis),
                    received_at,
                })
            }
            InboundFrame::Heartbeat { device_id, ts } => Inbound::Telemetry(TelemetryEvent {
                device_id,
                reading: Reading::Heartbeat,
                source_ts: ts.and_then(DateTime::from_timestamp_millis),
                received_at,
            }),
            InboundFrame::Ack {
                device_id,
                version,
                token,
                ok,
            } => Inbound::Ack(Ack {
                device_id,
                version,
                token,
                ok,
            }),
        };
        Ok(inbound)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Command addressed to the field controller
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCommand {
    pub device_id: DeviceId,
    pub action: Action,
    pub token: String,
    /// Store version this command produced
    pub version: Version,
    /// None for safety commands
    pub intent_id: Option<IntentId>,
}

#[derive(Debug, Serialize)]
struct OutboundFrame<'a> {
    device_id: &'a str,
    action: &'static str,
    value: serde_json::Value,
    token: &'a str,
    version: Version,
}

/// Egress encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    #[default]
    Json,
    Legacy,
}

impl OutboundCommand {
    pub fn to_json_line(&self) -> Result<String> {
        let frame = OutboundFrame {
            device_id: self.device_id.as_str(),
            action: self.action.wire_name(),
            value: self.action.wire_value(),
            token: &self.token,
            version: self.version,
        };
        serde_json::to_string(&frame)
            .map(|mut line| {
                line.push('\n');
                line
            })
            .map_err(|e| Error::Protocol(e.to_string()))
    }

    /// Encode for the wire. Actions without a legacy code fall back to JSON.
    pub fn encode(&self, format: WireFormat) -> Result<String> {
        if format == WireFormat::Legacy {
            if let Some(code) = legacy::encode(&self.device_id, &self.action) {
                return Ok(format!("{code}\n"));
            }
            tracing::debug!(
                device_id = %self.device_id,
                action = self.action.wire_name(),
                "No legacy code for action, sending JSON"
            );
        }
        self.to_json_line()
    }
}

/// Producer side of the egress buffers
#[derive(Clone)]
pub struct CommandQueue {
    normal: mpsc::Sender<OutboundCommand>,
    priority: mpsc::Sender<OutboundCommand>,
}

/// Consumer side, owned by the controller link
pub struct CommandReceivers {
    pub normal: mpsc::Receiver<OutboundCommand>,
    pub priority: mpsc::Receiver<OutboundCommand>,
}

/// Bounded normal and priority egress buffers
pub fn command_queue(normal: usize, priority: usize) -> (CommandQueue, CommandReceivers) {
    let (normal_tx, normal_rx) = mpsc::channel(normal.max(1));
    let (priority_tx, priority_rx) = mpsc::channel(priority.max(1));
    (
        CommandQueue {
            normal: normal_tx,
            priority: priority_tx,
        },
        CommandReceivers {
            normal: normal_rx,
            priority: priority_rx,
        },
    )
}

impl CommandQueue {
    /// Claim a slot in the normal buffer without sending yet
    pub fn reserve(&self) -> Result<mpsc::Permit<'_, OutboundCommand>> {
        self.normal.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::TransportUnavailable("command buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                Error::TransportUnavailable("controller link closed".to_string())
            }
        })
    }

    /// Fire-and-forget safety command
    pub fn send_priority(&self, command: OutboundCommand) -> Result<()> {
        self.priority.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::TransportUnavailable("priority buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                Error::TransportUnavailable("controller link closed".to_string())
            }
        })
    }

    /// Free slots in the normal buffer
    pub fn capacity(&self) -> usize {
        self.normal.capacity()
    }
}
