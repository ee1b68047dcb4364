//! WebSocket Protocol Messages
//!
//! Defines the message types exchanged between client and server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatch::IntentId;
use crate::fanout::Event;
use crate::types::{Action, DeviceId, Error};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Limit the event stream to matching device ids (wildcards allowed).
    /// An empty list means every device.
    Subscribe {
        /// Request ID for correlation
        id: String,
        #[serde(default)]
        devices: Vec<String>,
    },

    /// Submit an intent
    Submit {
        id: String,
        device_id: DeviceId,
        action: Action,
        /// Idempotency token
        token: String,
    },

    /// Submit a legacy `room_class_verb` code
    Legacy {
        id: String,
        code: String,
        token: String,
    },

    /// Full state of every device
    Snapshot {
        id: String,
    },

    /// Current status of a submitted intent
    Intent {
        id: String,
        intent_id: IntentId,
    },

    Arm {
        id: String,
    },

    Disarm {
        id: String,
    },

    /// Manual emergency lockdown
    Lockdown {
        id: String,
    },

    /// Ping for keep-alive
    Ping {
        id: String,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Sent on initial connection
    Connected {
        session_id: String,
        server_version: String,
    },

    /// Response to a client request
    Response {
        id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },

    /// Fan-out event
    Event {
        event: Event,
    },

    /// Error not tied to a request
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        code: ErrorCode,
        message: String,
    },

    /// Pong response to ping
    Pong {
        id: String,
    },
}

/// Error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    NotFound,
    InvalidState,
    Conflict,
    Timeout,
    TransportUnavailable,
    InternalError,
}

impl From<&Error> for ErrorCode {
    fn from(error: &Error) -> Self {
        match error {
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::InvalidState { .. } => ErrorCode::InvalidState,
            Error::Conflict(_) => ErrorCode::Conflict,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::TransportUnavailable(_) => ErrorCode::TransportUnavailable,
            Error::Protocol(_) => ErrorCode::InvalidRequest,
            _ => ErrorCode::InternalError,
        }
    }
}

impl ServerMessage {
    /// Create a success response
    pub fn success(id: impl Into<String>, data: Option<Value>) -> Self {
        Self::Response {
            id: id.into(),
            success: true,
            data,
            error: None,
            code: None,
        }
    }

    /// Create an error response
    pub fn error_response(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Response {
            id: id.into(),
            success: false,
            data: None,
            error: Some(message.into()),
            code: Some(code),
        }
    }

    /// Failed request from a library error
    pub fn failure(id: impl Into<String>, error: &Error) -> Self {
        Self::error_response(id, ErrorCode::from(error), error.to_string())
    }

    pub fn event(event: &Event) -> Self {
        Self::Event {
            event: event.clone(),
        }
    }

    /// Create a connected message
    pub fn connected(session_id: impl Into<String>) -> Self {
        Self::Connected {
            session_id: session_id.into(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Create a pong message
    pub fn pong(id: impl Into<String>) -> Self {
        Self::Pong { id: id.into() }
    }
}
