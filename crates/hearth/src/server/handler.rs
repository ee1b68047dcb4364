//! WebSocket Connection Handler
//!
//! Handles individual WebSocket connections and message processing.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::dispatch::{IntentHandle, IntentRequest};
use crate::types::Result;

use super::protocol::{ClientMessage, ErrorCode, ServerMessage};
use super::state::AppState;

/// Handle a WebSocket connection
pub async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Replies to this client
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(64);

    // The session id doubles as the fan-out client id, so intent outcomes
    // find their way back here
    let session_id = Uuid::new_v4();
    let mut subscription = state.hub().subscribe(session_id.to_string());
    state.register_client(session_id, subscription.id(), tx);

    let connected = ServerMessage::connected(session_id.to_string());
    if let Ok(json) = serde_json::to_string(&connected) {
        let _ = ws_sender.send(Message::Text(json.into())).await;
    }

    // Forward replies and fan-out events to the socket
    let mut send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(message) = rx.recv() => message,
                Some(event) = subscription.recv() => ServerMessage::event(&event),
                else => break,
            };
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("Failed to encode server message: {}", e),
            }
        }
    });

    let state_clone = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_client_message(&state_clone, session_id, &text).await;
                }
                Message::Close(_) => break,
                Message::Ping(_) => {
                    tracing::trace!("Received ping from {}", session_id);
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Dropping the send task's subscription closes the fan-out queue
    state.remove_client(session_id);
}

/// Handle a client message
pub async fn handle_client_message(state: &AppState, session_id: Uuid, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("Failed to parse client message: {}", e);
            let error = ServerMessage::Error {
                id: None,
                code: ErrorCode::InvalidRequest,
                message: format!("Invalid message: {e}"),
            };
            state.send_to(session_id, error).await;
            return;
        }
    };

    let reply = dispatch_message(state, session_id, msg);
    state.send_to(session_id, reply).await;
}

/// Produce the reply for one client message
pub fn dispatch_message(state: &AppState, session_id: Uuid, msg: ClientMessage) -> ServerMessage {
    let hub = state.hub();
    match msg {
        ClientMessage::Subscribe { id, devices } => {
            let Some(subscriber) = state.subscriber_of(session_id) else {
                return ServerMessage::error_response(id, ErrorCode::InternalError, "No subscription");
            };
            hub.set_subscription_filter(subscriber, &devices);

            // Catch-up: current state of everything the filter now admits
            let patterns: Vec<wildmatch::WildMatch> =
                devices.iter().map(|p| wildmatch::WildMatch::new(p)).collect();
            let snapshot: Vec<_> = hub
                .snapshot()
                .into_iter()
                .filter(|s| patterns.is_empty() || patterns.iter().any(|p| p.matches(s.device_id.as_str())))
                .collect();

            ServerMessage::success(
                id,
                Some(serde_json::json!({
                    "subscribed": devices,
                    "snapshot": snapshot,
                })),
            )
        }
        ClientMessage::Submit {
            id,
            device_id,
            action,
            token,
        } => {
            let request = IntentRequest::new(session_id.to_string(), device_id, action, token);
            intent_reply(id, hub.submit_intent(request))
        }
        ClientMessage::Legacy { id, code, token } => {
            intent_reply(id, hub.submit_legacy(session_id.to_string(), &code, token))
        }
        ClientMessage::Snapshot { id } => {
            ServerMessage::success(id, serde_json::to_value(hub.snapshot()).ok())
        }
        ClientMessage::Intent { id, intent_id } => match hub.intent(intent_id) {
            Some(view) => match view.status.failure(&view.device_id) {
                Some(e) => ServerMessage::Response {
                    id,
                    success: false,
                    code: Some(ErrorCode::from(&e)),
                    error: Some(e.to_string()),
                    data: serde_json::to_value(view).ok(),
                },
                None => ServerMessage::success(id, serde_json::to_value(view).ok()),
            },
            None => ServerMessage::error_response(
                id,
                ErrorCode::NotFound,
                format!("Intent not found: {intent_id}"),
            ),
        },
        ClientMessage::Arm { id } => {
            let actions = hub.arm();
            ServerMessage::success(id, Some(serde_json::json!({ "armed": true, "actions": actions })))
        }
        ClientMessage::Disarm { id } => {
            let actions = hub.disarm();
            ServerMessage::success(id, Some(serde_json::json!({ "armed": false, "actions": actions })))
        }
        ClientMessage::Lockdown { id } => {
            let alert = hub.lockdown();
            ServerMessage::success(id, serde_json::to_value(alert).ok())
        }
        ClientMessage::Ping { id } => ServerMessage::pong(id),
    }
}

fn intent_reply(id: String, submitted: Result<IntentHandle>) -> ServerMessage {
    match submitted {
        Ok(handle) => ServerMessage::success(
            id,
            Some(serde_json::json!({
                "intent_id": handle.id,
                "device_id": handle.device_id,
                "token": handle.token,
                "status": handle.status(),
            })),
        ),
        Err(e) => {
            tracing::debug!("Intent refused: {}", e);
            ServerMessage::failure(id, &e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::EventKind;
    use crate::hub::{Hub, HubConfig};
    use crate::registry::Device;
    use crate::transport::LinkState;
    use crate::types::DeviceClass;
    use hearth_runtime::service::ServiceManager;
    use std::sync::Arc;
    use tokio::sync::watch;

    fn setup() -> (AppState, Uuid, crate::fanout::Subscription, crate::transport::CommandReceivers) {
        let (hub, receivers) = Hub::new(
            HubConfig {
                coalesce_window: std::time::Duration::ZERO,
                ..HubConfig::default()
            },
            None,
        );
        hub.install(vec![
            Device::new("kitchen_light", DeviceClass::Light, "kitchen"),
            Device::new("hall_door", DeviceClass::Door, "hall"),
        ]);
        let (_link_tx, link_rx) = watch::channel(LinkState::Disabled);
        let state = AppState::new(hub, Arc::new(ServiceManager::new()), link_rx);

        let session_id = Uuid::new_v4();
        let subscription = state.hub().subscribe(session_id.to_string());
        let (tx, _rx) = mpsc::channel(8);
        state.register_client(session_id, subscription.id(), tx);
        (state, session_id, subscription, receivers)
    }

    fn parse(text: &str) -> ClientMessage {
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn test_submit_and_resolution_event() {
        let (state, session_id, mut subscription, _receivers) = setup();

        let reply = dispatch_message(
            &state,
            session_id,
            parse(r#"{"type":"Legacy","id":"1","code":"kitchen_light_on","token":"k1"}"#),
        );
        let ServerMessage::Response { success, data, .. } = reply else {
            panic!("expected response");
        };
        assert!(success);
        assert_eq!(data.unwrap()["status"]["status"], "in_flight");

        let event = subscription.try_recv().unwrap();
        assert!(matches!(event.kind, EventKind::StateChanged { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_intent_reports_failure() {
        let (state, session_id, _subscription, _receivers) = setup();

        let reply = dispatch_message(
            &state,
            session_id,
            parse(r#"{"type":"Legacy","id":"1","code":"kitchen_light_on","token":"k1"}"#),
        );
        let ServerMessage::Response { data, .. } = reply else {
            panic!("expected response");
        };
        let intent_id = data.unwrap()["intent_id"].clone();

        tokio::time::sleep(std::time::Duration::from_secs(6)).await;

        let query = serde_json::json!({"type": "Intent", "id": "2", "intent_id": intent_id});
        let reply = dispatch_message(&state, session_id, serde_json::from_value(query).unwrap());
        let ServerMessage::Response { success, code, data, .. } = reply else {
            panic!("expected response");
        };
        assert!(!success);
        assert_eq!(code, Some(ErrorCode::Timeout));
        assert_eq!(data.unwrap()["status"]["status"], "timed_out");
    }

    #[tokio::test]
    async fn test_invalid_submit_is_refused() {
        let (state, session_id, _subscription, _receivers) = setup();

        let reply = dispatch_message(
            &state,
            session_id,
            parse(r#"{"type":"Submit","id":"2","device_id":"hall_door","action":{"action":"brightness","value":10},"token":"d1"}"#),
        );
        let ServerMessage::Response { success, code, .. } = reply else {
            panic!("expected response");
        };
        assert!(!success);
        assert_eq!(code, Some(ErrorCode::InvalidState));
    }

    #[tokio::test]
    async fn test_subscribe_filters_and_catches_up() {
        let (state, session_id, mut subscription, _receivers) = setup();

        let reply = dispatch_message(
            &state,
            session_id,
            parse(r#"{"type":"Subscribe","id":"3","devices":["hall_*"]}"#),
        );
        let ServerMessage::Response { data, .. } = reply else {
            panic!("expected response");
        };
        let snapshot = data.unwrap()["snapshot"].as_array().unwrap().clone();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0]["device_id"], "hall_door");

        dispatch_message(
            &state,
            session_id,
            parse(r#"{"type":"Legacy","id":"4","code":"kitchen_light_on","token":"k2"}"#),
        );
        // Kitchen state changes are outside the filter
        assert!(subscription.try_recv().is_none());
    }
}
