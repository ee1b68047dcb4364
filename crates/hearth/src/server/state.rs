//! Server Application State
//!
//! Shared state accessible by all WebSocket handlers.

use std::sync::Arc;

use dashmap::DashMap;
use hearth_runtime::service::ServiceManager;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::hub::Hub;
use crate::transport::LinkState;

use super::protocol::ServerMessage;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    hub: Arc<Hub>,

    service_manager: Arc<ServiceManager>,

    /// Connected clients
    clients: DashMap<Uuid, ClientState>,

    /// Controller connection, for /health
    link_state: watch::Receiver<LinkState>,
}

/// Per-client state
#[derive(Debug, Clone)]
pub struct ClientState {
    pub session_id: Uuid,

    /// Fan-out subscription feeding this client
    pub subscriber: u64,

    /// Channel to send replies to this client
    pub tx: mpsc::Sender<ServerMessage>,
}

impl AppState {
    pub fn new(
        hub: Arc<Hub>,
        service_manager: Arc<ServiceManager>,
        link_state: watch::Receiver<LinkState>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                hub,
                service_manager,
                clients: DashMap::new(),
                link_state,
            }),
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.inner.hub
    }

    pub fn service_manager(&self) -> &Arc<ServiceManager> {
        &self.inner.service_manager
    }

    pub fn link_state(&self) -> LinkState {
        *self.inner.link_state.borrow()
    }

    /// Register a new client connection
    pub fn register_client(&self, session_id: Uuid, subscriber: u64, tx: mpsc::Sender<ServerMessage>) {
        self.inner.clients.insert(
            session_id,
            ClientState {
                session_id,
                subscriber,
                tx,
            },
        );
        tracing::info!("Client connected: {}", session_id);
    }

    pub fn remove_client(&self, session_id: Uuid) {
        self.inner.clients.remove(&session_id);
        tracing::info!("Client disconnected: {}", session_id);
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn subscriber_of(&self, session_id: Uuid) -> Option<u64> {
        self.inner.clients.get(&session_id).map(|c| c.subscriber)
    }

    /// Send a message to a specific client
    pub async fn send_to(&self, session_id: Uuid, message: ServerMessage) {
        let tx = self.inner.clients.get(&session_id).map(|c| c.tx.clone());
        if let Some(tx) = tx {
            if tx.send(message).await.is_err() {
                tracing::debug!("Client {} went away before reply", session_id);
            }
        }
    }
}
