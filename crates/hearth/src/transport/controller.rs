//! Field-controller link
//!
//! One TCP connection to the controller. Inbound lines are decoded and handed
//! to an [`InboundSink`]; outbound commands are drained from the egress
//! buffers with safety commands first. A lost connection is retried with
//! jittered exponential backoff, and the command whose write failed is sent
//! again once the link is back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hearth_runtime::service::{
    EventPublisher, Service, ServiceContext, ServiceError, ServiceResult, ServiceSpec,
};
use rand::Rng;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{CommandReceivers, Inbound, InboundFrame, OutboundCommand, WireFormat};

pub const LINK_TOPIC: &str = "controller/link";

/// Receiver of decoded controller traffic
pub trait InboundSink: Send + Sync + 'static {
    fn deliver(&self, inbound: Inbound);
}

/// Connection state, exposed on /health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No controller configured
    Disabled,
    Connecting,
    Connected,
    Disconnected,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let current = policy.initial;
        Self { policy, current }
    }

    /// Delay before the next attempt; grows until `max`
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.policy.multiplier)
                .min(self.policy.max.as_secs_f64()),
        );

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Link Service
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ControllerLinkConfig {
    /// host:port
    pub address: String,
    pub format: WireFormat,
    pub backoff: BackoffPolicy,
}

pub struct ControllerLink {
    config: ControllerLinkConfig,
    sink: Arc<dyn InboundSink>,
    receivers: Option<CommandReceivers>,
    state: watch::Sender<LinkState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ControllerLink {
    pub fn new(
        config: ControllerLinkConfig,
        sink: Arc<dyn InboundSink>,
        receivers: CommandReceivers,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            config,
            sink,
            receivers: Some(receivers),
            state,
            shutdown: None,
            task: None,
        }
    }

    /// Follow the connection state
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }
}

#[async_trait]
impl Service for ControllerLink {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("controller", "Controller Link")
            .with_shutdown_timeout(Duration::from_secs(5))
            .with_description(format!("Field controller at {}", self.config.address))
    }

    async fn on_start(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        let receivers = self.receivers.take().ok_or_else(|| {
            ServiceError::InitializationFailed("command receivers already taken".to_string())
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let link = LinkTask {
            config: self.config.clone(),
            sink: Arc::clone(&self.sink),
            receivers,
            state: self.state.clone(),
            publisher: ctx.publisher(),
            pending: None,
        };

        self.shutdown = Some(shutdown_tx);
        self.task = Some(tokio::spawn(link.run(shutdown_rx)));
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Controller link task failed: {:?}", e);
            }
        }
        Ok(())
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct LinkTask {
    config: ControllerLinkConfig,
    sink: Arc<dyn InboundSink>,
    receivers: CommandReceivers,
    state: watch::Sender<LinkState>,
    publisher: EventPublisher,
    /// Command whose write failed, resent after reconnect
    pending: Option<OutboundCommand>,
}

impl LinkTask {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut backoff = Backoff::new(self.config.backoff.clone());

        loop {
            self.state.send_replace(LinkState::Connecting);
            let connected = tokio::select! {
                _ = &mut shutdown => break,
                result = TcpStream::connect(self.config.address.as_str()) => result,
            };

            let delay = match connected {
                Ok(stream) => {
                    backoff.reset();
                    self.announce(true);
                    info!(address = %self.config.address, "Controller connected");

                    let end = self.session(stream, &mut shutdown).await;
                    self.announce(false);
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => {
                            warn!(address = %self.config.address, "Controller link lost: {}", reason);
                        }
                    }
                    backoff.next_delay()
                }
                Err(e) => {
                    self.state.send_replace(LinkState::Disconnected);
                    let delay = backoff.next_delay();
                    debug!(
                        address = %self.config.address,
                        retry_in_ms = delay.as_millis() as u64,
                        "Controller connect failed: {}",
                        e
                    );
                    delay
                }
            };

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(LinkState::Disconnected);
        debug!("Controller link stopped");
    }

    fn announce(&self, connected: bool) {
        let state = if connected {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        self.state.send_replace(state);
        let data = serde_json::json!({
            "connected": connected,
            "address": self.config.address,
        });
        let _ = self.publisher.emit(LINK_TOPIC, "controller", data);
    }

    async fn session(
        &mut self,
        stream: TcpStream,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> SessionEnd {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        if let Some(command) = self.pending.take() {
            if let Err(reason) = self.write(&mut write, command).await {
                return SessionEnd::Lost(reason);
            }
        }

        loop {
            let command = tokio::select! {
                biased;
                _ = &mut *shutdown => return SessionEnd::Shutdown,
                Some(command) = self.receivers.priority.recv() => command,
                Some(command) = self.receivers.normal.recv() => command,
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            self.handle_line(&line);
                            continue;
                        }
                        Ok(None) => return SessionEnd::Lost("connection closed by controller".to_string()),
                        Err(e) => return SessionEnd::Lost(e.to_string()),
                    }
                }
            };

            if let Err(reason) = self.write(&mut write, command).await {
                return SessionEnd::Lost(reason);
            }
        }
    }

    /// Write one command. On failure the command is parked for the next session.
    async fn write(&mut self, write: &mut OwnedWriteHalf, command: OutboundCommand) -> Result<(), String> {
        let line = match command.encode(self.config.format) {
            Ok(line) => line,
            Err(e) => {
                error!(device_id = %command.device_id, "Dropping unencodable command: {}", e);
                return Ok(());
            }
        };

        if let Err(e) = write.write_all(line.as_bytes()).await {
            self.pending = Some(command);
            return Err(e.to_string());
        }
        debug!(
            device_id = %command.device_id,
            version = command.version,
            token = %command.token,
            "Command sent"
        );
        Ok(())
    }

    fn handle_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let inbound = InboundFrame::decode(line).and_then(|frame| frame.into_inbound(Utc::now()));
        match inbound {
            Ok(inbound) => self.sink.deliver(inbound),
            Err(e) => warn!("Discarding controller frame: {}", e),
        }
    }
}
