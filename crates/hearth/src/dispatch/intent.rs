//! Command intents and their lifecycle status

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::types::{Action, DeviceId, Error, Version};

/// Identifier handed back to the submitting client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentId(Uuid);

impl IntentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IntentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why an intent was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    UnknownDevice,
    InvalidState(String),
    /// Optimistic apply lost the race twice
    Conflict,
    TransportUnavailable(String),
    ControllerRefused,
    DeviceRemoved,
}

impl RejectReason {
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::NotFound(_) => RejectReason::UnknownDevice,
            Error::InvalidState { reason, .. } => RejectReason::InvalidState(reason.clone()),
            Error::Conflict(_) => RejectReason::Conflict,
            Error::TransportUnavailable(reason) => {
                RejectReason::TransportUnavailable(reason.clone())
            }
            other => RejectReason::InvalidState(other.to_string()),
        }
    }

    /// The synchronous error a caller saw for this rejection, if it was one
    pub fn to_error(&self, device_id: &DeviceId) -> Option<Error> {
        match self {
            RejectReason::UnknownDevice => Some(Error::NotFound(format!("device {device_id}"))),
            RejectReason::InvalidState(reason) => Some(Error::InvalidState {
                device: device_id.clone(),
                reason: reason.clone(),
            }),
            RejectReason::TransportUnavailable(reason) => {
                Some(Error::TransportUnavailable(reason.clone()))
            }
            RejectReason::Conflict | RejectReason::ControllerRefused | RejectReason::DeviceRemoved => {
                None
            }
        }
    }
}

/// Lifecycle status of an intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "rejection", rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    InFlight,
    Acknowledged,
    TimedOut,
    Superseded,
    Rejected(RejectReason),
}

impl IntentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, IntentStatus::Pending | IntentStatus::InFlight)
    }
}

impl IntentStatus {
    /// The soft failure a terminal status reports to the submitter
    pub fn failure(&self, device_id: &DeviceId) -> Option<Error> {
        match self {
            IntentStatus::TimedOut => Some(Error::Timeout(device_id.clone())),
            IntentStatus::Rejected(RejectReason::Conflict) => Some(Error::Conflict(device_id.clone())),
            IntentStatus::Rejected(reason) => reason.to_error(device_id),
            _ => None,
        }
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentStatus::Pending => f.write_str("pending"),
            IntentStatus::InFlight => f.write_str("in_flight"),
            IntentStatus::Acknowledged => f.write_str("acknowledged"),
            IntentStatus::TimedOut => f.write_str("timed_out"),
            IntentStatus::Superseded => f.write_str("superseded"),
            IntentStatus::Rejected(reason) => write!(f, "rejected ({reason:?})"),
        }
    }
}

/// A client's request to change a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentRequest {
    pub client_id: String,
    pub device_id: DeviceId,
    pub action: Action,
    /// Client-generated idempotency token
    pub token: String,
}

impl IntentRequest {
    pub fn new(
        client_id: impl Into<String>,
        device_id: impl Into<DeviceId>,
        action: Action,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            device_id: device_id.into(),
            action,
            token: token.into(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Progress {
    /// Version the optimistic apply produced
    pub produced_version: Option<Version>,
    /// An earlier command on the lane carried the same version, so only
    /// the token can tell their acks apart
    pub shared_version: bool,
    pub finished_at: Option<Instant>,
    pub timeout: Option<AbortHandle>,
}

/// Dispatcher-side record of an intent
#[derive(Debug)]
pub(crate) struct IntentCell {
    pub id: IntentId,
    /// Intake order, assigned atomically
    pub seq: u64,
    pub request: IntentRequest,
    pub submitted_at: DateTime<Utc>,
    pub status: watch::Sender<IntentStatus>,
    pub progress: Mutex<Progress>,
}

impl IntentCell {
    pub fn new(seq: u64, request: IntentRequest) -> Self {
        let (status, _) = watch::channel(IntentStatus::Pending);
        Self {
            id: IntentId::new(),
            seq,
            request,
            submitted_at: Utc::now(),
            status,
            progress: Mutex::new(Progress::default()),
        }
    }

    pub fn status(&self) -> IntentStatus {
        self.status.borrow().clone()
    }

    /// Move to a non-terminal status; no-op once terminal
    pub fn advance(&self, next: IntentStatus) {
        self.status.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Enter a terminal status. Returns false if already terminal.
    pub fn finish(&self, outcome: IntentStatus) -> bool {
        let mut applied = false;
        self.status.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = outcome.clone();
            applied = true;
            true
        });

        if applied {
            let mut progress = self.progress.lock();
            progress.finished_at = Some(Instant::now());
            if let Some(timeout) = progress.timeout.take() {
                timeout.abort();
            }
        }
        applied
    }

    pub fn produced_version(&self) -> Option<Version> {
        self.progress.lock().produced_version
    }

    pub fn handle(&self) -> IntentHandle {
        IntentHandle {
            id: self.id,
            device_id: self.request.device_id.clone(),
            token: self.request.token.clone(),
            status: self.status.subscribe(),
        }
    }

    pub fn view(&self) -> IntentView {
        IntentView {
            id: self.id,
            seq: self.seq,
            client_id: self.request.client_id.clone(),
            device_id: self.request.device_id.clone(),
            action: self.request.action,
            token: self.request.token.clone(),
            submitted_at: self.submitted_at,
            status: self.status(),
            produced_version: self.produced_version(),
        }
    }
}

/// Read-only copy of an intent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentView {
    pub id: IntentId,
    pub seq: u64,
    pub client_id: String,
    pub device_id: DeviceId,
    pub action: Action,
    pub token: String,
    pub submitted_at: DateTime<Utc>,
    pub status: IntentStatus,
    pub produced_version: Option<Version>,
}

/// Caller's view of a submitted intent
#[derive(Debug, Clone)]
pub struct IntentHandle {
    pub id: IntentId,
    pub device_id: DeviceId,
    pub token: String,
    status: watch::Receiver<IntentStatus>,
}

impl IntentHandle {
    pub fn status(&self) -> IntentStatus {
        self.status.borrow().clone()
    }

    /// Wait until the intent reaches a terminal status
    pub async fn settled(&mut self) -> IntentStatus {
        let settled = self
            .status
            .wait_for(IntentStatus::is_terminal)
            .await
            .map(|status| status.clone())
            .ok();
        settled.unwrap_or_else(|| self.status())
    }
}
