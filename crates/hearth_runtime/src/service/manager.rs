//! Service Manager
//!
//! Spawns services, routes bus events to them and stops them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{
    BusEvent, EventPublisher, Service, ServiceCommand, ServiceContext, ServiceError, ServiceHandle,
    ServiceResult, ServiceSpec, ServiceState,
};

struct RunningService {
    handle: ServiceHandle,
    join_handle: JoinHandle<ServiceResult<()>>,
    spec: ServiceSpec,
}

/// Owner of every running service
///
/// Each service runs its own loop on a tokio task; the manager keeps the
/// handles, fans bus events out to subscribers and coordinates shutdown.
pub struct ServiceManager {
    services: DashMap<String, RunningService>,
    shutdown_tx: broadcast::Sender<()>,
    event_tx: broadcast::Sender<BusEvent>,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (event_tx, _) = broadcast::channel(256);

        Self {
            services: DashMap::new(),
            shutdown_tx,
            event_tx,
        }
    }

    pub fn event_publisher(&self) -> EventPublisher {
        EventPublisher::new(self.event_tx.clone())
    }

    pub async fn spawn<S: Service>(&self, service: S) -> ServiceResult<ServiceHandle> {
        self.spawn_with_config(service, serde_json::Value::Null).await
    }

    pub async fn spawn_with_config<S: Service>(
        &self,
        service: S,
        config: serde_json::Value,
    ) -> ServiceResult<ServiceHandle> {
        let spec = service.spec();
        let service_id = spec.id.clone();

        if spec.singleton && self.services.contains_key(&service_id) {
            return Err(ServiceError::AlreadyRunning(service_id));
        }

        let (command_tx, command_rx) = mpsc::channel(64);
        let state = Arc::new(AtomicU8::new(ServiceState::Starting as u8));
        let handle = ServiceHandle::new(service_id.clone(), command_tx, Arc::clone(&state));

        let ctx = ServiceContext::new(service_id.clone(), config, self.event_publisher());
        let channels = LoopChannels {
            command_rx,
            shutdown_rx: self.shutdown_tx.subscribe(),
            event_rx: self.event_tx.subscribe(),
        };

        let loop_spec = spec.clone();
        let join_handle = tokio::spawn(run_service_loop(service, ctx, channels, state, loop_spec));

        self.services.insert(
            service_id,
            RunningService {
                handle: handle.clone(),
                join_handle,
                spec,
            },
        );

        Ok(handle)
    }

    pub fn get(&self, service_id: &str) -> Option<ServiceHandle> {
        self.services.get(service_id).map(|s| s.handle.clone())
    }

    pub fn is_running(&self, service_id: &str) -> bool {
        self.services
            .get(service_id)
            .map(|s| s.handle.is_running())
            .unwrap_or(false)
    }

    /// Publish a bus event to every subscribed service
    pub fn publish_event(&self, event: BusEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn emit(
        &self,
        topic: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) {
        self.publish_event(BusEvent::new(topic, source, data));
    }

    /// Stop one service and wait for its loop to finish
    pub async fn stop(&self, service_id: &str) -> ServiceResult<()> {
        let (_, running) = self
            .services
            .remove(service_id)
            .ok_or_else(|| ServiceError::NotRunning(service_id.to_string()))?;

        let _ = running.handle.shutdown().await;
        join_with_timeout(service_id, running.join_handle, running.spec.shutdown_timeout).await
    }

    /// Stop every service. Returns the first failure but stops all of them.
    pub async fn shutdown_all(&self) -> ServiceResult<()> {
        tracing::info!(count = self.services.len(), "Shutting down services");
        let _ = self.shutdown_tx.send(());

        let ids: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        let mut first_error = None;

        for service_id in ids {
            let Some((_, running)) = self.services.remove(&service_id) else {
                continue;
            };
            let result =
                join_with_timeout(&service_id, running.join_handle, running.spec.shutdown_timeout)
                    .await;
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn list(&self) -> Vec<(String, ServiceState)> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().handle.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

async fn join_with_timeout(
    service_id: &str,
    join_handle: JoinHandle<ServiceResult<()>>,
    timeout: Duration,
) -> ServiceResult<()> {
    match tokio::time::timeout(timeout, join_handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            tracing::error!(service_id, error = ?e, "Service task panicked");
            Err(ServiceError::Internal(format!("Task panicked: {e:?}")))
        }
        Err(_) => {
            tracing::warn!(service_id, "Service shutdown timed out");
            Err(ServiceError::ShutdownTimeout)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Task Loop
// ─────────────────────────────────────────────────────────────────────────────

struct LoopChannels {
    command_rx: mpsc::Receiver<ServiceCommand>,
    shutdown_rx: broadcast::Receiver<()>,
    event_rx: broadcast::Receiver<BusEvent>,
}

async fn run_service_loop<S: Service>(
    mut service: S,
    ctx: ServiceContext,
    mut channels: LoopChannels,
    state: Arc<AtomicU8>,
    spec: ServiceSpec,
) -> ServiceResult<()> {
    state.store(ServiceState::Starting as u8, Ordering::SeqCst);

    if let Err(e) = service.on_start(&ctx).await {
        tracing::error!(service_id = %ctx.service_id, error = %e, "Service failed to start");
        state.store(ServiceState::Failed as u8, Ordering::SeqCst);
        return Err(e);
    }

    state.store(ServiceState::Running as u8, Ordering::SeqCst);
    tracing::info!(service_id = %ctx.service_id, "Service started");

    // First tick fires one full period after start.
    let mut tick_timer = spec.tick_interval.map(|period| {
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    });

    loop {
        tokio::select! {
            _ = channels.shutdown_rx.recv() => {
                tracing::debug!(service_id = %ctx.service_id, "Received global shutdown signal");
                break;
            }

            Some(cmd) = channels.command_rx.recv() => {
                match cmd {
                    ServiceCommand::Shutdown => break,
                    ServiceCommand::Event(event) => {
                        if let Err(e) = service.on_event(&ctx, event).await {
                            tracing::warn!(service_id = %ctx.service_id, error = %e, "Error handling direct event");
                        }
                    }
                    ServiceCommand::ForceTick => {
                        if let Err(e) = service.on_tick(&ctx).await {
                            tracing::warn!(service_id = %ctx.service_id, error = %e, "Error during forced tick");
                        }
                    }
                    ServiceCommand::GetState(tx) => {
                        let _ = tx.send(ServiceState::from_u8(state.load(Ordering::SeqCst)));
                    }
                }
            }

            received = channels.event_rx.recv() => {
                match received {
                    Ok(event) if spec.wants(&event.topic) => {
                        if let Err(e) = service.on_event(&ctx, event).await {
                            tracing::warn!(service_id = %ctx.service_id, error = %e, "Error handling bus event");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(service_id = %ctx.service_id, skipped, "Service lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = async {
                match tick_timer.as_mut() {
                    Some(timer) => timer.tick().await,
                    None => std::future::pending::<tokio::time::Instant>().await,
                }
            } => {
                if let Err(e) = service.on_tick(&ctx).await {
                    tracing::warn!(service_id = %ctx.service_id, error = %e, "Error during tick");
                }
            }
        }
    }

    state.store(ServiceState::Stopping as u8, Ordering::SeqCst);
    tracing::debug!(service_id = %ctx.service_id, "Service stopping");

    match tokio::time::timeout(spec.shutdown_timeout, service.on_stop(&ctx)).await {
        Ok(Ok(())) => {
            state.store(ServiceState::Stopped as u8, Ordering::SeqCst);
            tracing::info!(service_id = %ctx.service_id, "Service stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            state.store(ServiceState::Failed as u8, Ordering::SeqCst);
            tracing::error!(service_id = %ctx.service_id, error = %e, "Service stop failed");
            Err(e)
        }
        Err(_) => {
            state.store(ServiceState::Failed as u8, Ordering::SeqCst);
            tracing::error!(service_id = %ctx.service_id, "Service stop timed out");
            Err(ServiceError::ShutdownTimeout)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default, Clone)]
    struct Counters {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        events: Arc<AtomicUsize>,
        ticks: Arc<AtomicUsize>,
    }

    struct CountingService {
        id: String,
        tick: Option<Duration>,
        counters: Counters,
    }

    impl CountingService {
        fn new(id: &str, tick: Option<Duration>) -> (Self, Counters) {
            let counters = Counters::default();
            let service = Self {
                id: id.to_string(),
                tick,
                counters: counters.clone(),
            };
            (service, counters)
        }
    }

    #[async_trait::async_trait]
    impl Service for CountingService {
        fn spec(&self) -> ServiceSpec {
            let spec = ServiceSpec::new(&self.id, "Counting Service").subscribe("home/*");
            match self.tick {
                Some(period) => spec.with_tick_interval(period),
                None => spec,
            }
        }

        async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_event(&mut self, _ctx: &ServiceContext, _event: BusEvent) -> ServiceResult<()> {
            self.counters.events.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            self.counters.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_spawn_and_stop_service() {
        let manager = ServiceManager::new();
        let (service, counters) = CountingService::new("sweeper", None);

        let handle = manager.spawn(service).await.unwrap();
        assert_eq!(handle.request_state().await.unwrap(), ServiceState::Running);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);

        manager.stop("sweeper").await.unwrap();
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_event_routing_by_topic() {
        let manager = ServiceManager::new();
        let (service, counters) = CountingService::new("reloader", None);

        let handle = manager.spawn(service).await.unwrap();
        handle.request_state().await.unwrap();

        manager.emit("home/rooms-changed", "test", serde_json::json!({}));
        manager.emit("controller/link", "test", serde_json::json!({}));
        // A state round-trip lets the loop drain what is already queued.
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.request_state().await.unwrap();

        assert_eq!(counters.events.load(Ordering::SeqCst), 1);
        manager.shutdown_all().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_interval_and_force_tick() {
        let manager = ServiceManager::new();
        let (service, counters) = CountingService::new("ticker", Some(Duration::from_secs(10)));

        let handle = manager.spawn(service).await.unwrap();
        handle.request_state().await.unwrap();
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 0);

        handle.force_tick().await.unwrap();
        handle.request_state().await.unwrap();
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(25)).await;
        handle.request_state().await.unwrap();
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 3);

        manager.shutdown_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_singleton_constraint() {
        let manager = ServiceManager::new();
        let (first, _) = CountingService::new("janitor", None);
        let (second, _) = CountingService::new("janitor", None);

        manager.spawn(first).await.unwrap();
        let result = manager.spawn(second).await;
        assert!(matches!(result, Err(ServiceError::AlreadyRunning(_))));

        manager.shutdown_all().await.unwrap();
    }
}
