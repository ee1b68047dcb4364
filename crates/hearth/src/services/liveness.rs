//! Liveness sweeper

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hearth_runtime::service::{Service, ServiceContext, ServiceResult, ServiceSpec};
use tokio::time::Instant;

use crate::hub::Hub;

pub const UNREACHABLE_TOPIC: &str = "devices/unreachable";

/// Marks devices unreachable once they miss enough heartbeats
pub struct LivenessService {
    hub: Arc<Hub>,
    interval: Duration,
}

impl LivenessService {
    pub fn new(hub: Arc<Hub>, interval: Duration) -> Self {
        Self { hub, interval }
    }
}

#[async_trait]
impl Service for LivenessService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("liveness", "Liveness Sweeper")
            .with_tick_interval(self.interval)
            .with_description("Marks silent devices unreachable")
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        tracing::debug!(interval_ms = self.interval.as_millis() as u64, "Liveness sweeps scheduled");
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_tick(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        let lost = self.hub.sweep_liveness(Instant::now());
        if lost > 0 {
            let _ = ctx.emit(UNREACHABLE_TOPIC, serde_json::json!({ "count": lost }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::EventKind;
    use crate::hub::HubConfig;
    use crate::registry::Device;
    use crate::types::DeviceClass;
    use hearth_runtime::service::EventPublisher;
    use tokio::sync::broadcast;

    #[tokio::test(start_paused = true)]
    async fn test_tick_reports_each_transition_once() {
        let (hub, _receivers) = Hub::new(HubConfig::default(), None);
        hub.install(vec![Device::new("porch_light", DeviceClass::Light, "porch")]);
        let mut sub = hub.subscribe("ui");

        let (tx, mut bus) = broadcast::channel(8);
        let ctx = ServiceContext::new("liveness".into(), serde_json::Value::Null, EventPublisher::new(tx));
        let mut service = LivenessService::new(hub.clone(), Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(31)).await;
        service.on_tick(&ctx).await.unwrap();
        service.on_tick(&ctx).await.unwrap();

        let event = sub.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::Liveness { reachable: false });
        assert!(sub.try_recv().is_none());
        assert_eq!(bus.recv().await.unwrap().topic, UNREACHABLE_TOPIC);
        assert!(bus.try_recv().is_err());
    }
}
