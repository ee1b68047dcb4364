//! Hearth - Home Device State Core
//!
//! Keeps a home's device state consistent between client intents and
//! hardware telemetry:
//! - Device registry and a per-device versioned state store
//! - Intent dispatch with supersession, idempotency and ack reconciliation
//! - Coalesced fan-out of state changes to subscribers
//! - Safety escalation for smoke, gas and intrusion readings
//! - Field-controller link, home reload and a WebSocket client channel

// Re-export the service runtime
pub use hearth_runtime;

pub mod types;

pub mod registry;

pub mod store;

pub mod transport;

pub mod fanout;

pub mod coalesce;

pub mod dispatch;

pub mod escalation;

pub mod hub;

// Home directory (settings, rooms, watcher)
pub mod home;

// Background services
pub mod services;

// WebSocket server
pub mod server;

pub use hub::{Hub, HubConfig};
pub use types::{Error, Result};
