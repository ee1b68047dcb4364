//! Service Lifecycle Management
//!
//! A service is a long-running component driven by the [`ServiceManager`].
//!
//! # Lifecycle
//!
//! - `on_start`: called once before the service loop begins
//! - `on_event`: called for every bus event whose topic matches a subscription
//! - `on_tick`: called periodically when the spec carries a tick interval
//! - `on_stop`: called once when the service is asked to stop

mod event;
mod handle;
mod manager;

pub use event::*;
pub use handle::*;
pub use manager::*;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Service Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by services and the manager
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Service initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Service already running: {0}")]
    AlreadyRunning(String),

    #[error("Service not running: {0}")]
    NotRunning(String),

    #[error("Event handling failed: {0}")]
    EventError(String),

    #[error("Shutdown timeout")]
    ShutdownTimeout,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

// ─────────────────────────────────────────────────────────────────────────────
// Service Specification
// ─────────────────────────────────────────────────────────────────────────────

/// Static description of a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique service identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Interval between `on_tick` calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_interval: Option<Duration>,

    /// Topic patterns this service listens to (e.g. "home/*", "controller/link")
    #[serde(default)]
    pub subscriptions: Vec<String>,

    /// Whether a second service with the same id is refused
    #[serde(default = "default_singleton")]
    pub singleton: bool,

    /// Upper bound on `on_stop`
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_singleton() -> bool {
    true
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            tick_interval: None,
            subscriptions: Vec::new(),
            singleton: true,
            shutdown_timeout: default_shutdown_timeout(),
            description: None,
        }
    }
}

impl ServiceSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    pub fn with_subscriptions(mut self, subscriptions: Vec<String>) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    /// Add a single topic pattern
    pub fn subscribe(mut self, pattern: impl Into<String>) -> Self {
        self.subscriptions.push(pattern.into());
        self
    }

    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Whether any subscription pattern accepts the topic
    pub fn wants(&self, topic: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|pattern| topic_matches(pattern, topic))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Context
// ─────────────────────────────────────────────────────────────────────────────

/// Context handed to every lifecycle hook
pub struct ServiceContext {
    pub service_id: String,

    /// Free-form configuration supplied at spawn time
    pub config: serde_json::Value,

    publisher: EventPublisher,
}

impl ServiceContext {
    pub fn new(service_id: String, config: serde_json::Value, publisher: EventPublisher) -> Self {
        Self {
            service_id,
            config,
            publisher,
        }
    }

    /// Publish an event on the bus
    pub fn publish(&self, event: BusEvent) -> ServiceResult<()> {
        self.publisher.publish(event)
    }

    /// Publish an event sourced from this service
    pub fn emit(&self, topic: impl Into<String>, data: serde_json::Value) -> ServiceResult<()> {
        self.publish(BusEvent::new(topic, &self.service_id, data))
    }

    /// A publisher that outlives the hook call (for spawned tasks)
    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    pub fn get_config<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A component managed by the [`ServiceManager`]
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn spec(&self) -> ServiceSpec;

    /// Acquire resources and spawn background tasks.
    ///
    /// An error here marks the service failed and the loop never starts.
    async fn on_start(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    /// Release resources. Runs even when the stop was not requested cleanly.
    async fn on_stop(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    async fn on_event(&mut self, _ctx: &ServiceContext, _event: BusEvent) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
