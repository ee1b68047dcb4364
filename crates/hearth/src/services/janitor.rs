//! Intent janitor

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hearth_runtime::service::{Service, ServiceContext, ServiceResult, ServiceSpec};
use tokio::time::Instant;

use crate::hub::Hub;

/// Drops settled intents and their idempotency tokens after retention
pub struct JanitorService {
    hub: Arc<Hub>,
    interval: Duration,
}

impl JanitorService {
    pub fn new(hub: Arc<Hub>, interval: Duration) -> Self {
        Self { hub, interval }
    }
}

#[async_trait]
impl Service for JanitorService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("janitor", "Intent Janitor").with_tick_interval(self.interval)
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        let removed = self.hub.collect_garbage(Instant::now());
        if removed > 0 {
            tracing::debug!(removed, retained = self.hub.retained_intents(), "Intent retention sweep");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchConfig, IntentRequest, IntentStatus};
    use crate::hub::HubConfig;
    use crate::registry::Device;
    use crate::transport::Ack;
    use crate::types::{Action, DeviceClass};
    use hearth_runtime::service::EventPublisher;
    use tokio::sync::broadcast;

    #[tokio::test(start_paused = true)]
    async fn test_settled_intents_expire() {
        let config = HubConfig {
            dispatch: DispatchConfig {
                retention: Duration::from_secs(60),
                ..DispatchConfig::default()
            },
            ..HubConfig::default()
        };
        let (hub, _receivers) = Hub::new(config, None);
        hub.install(vec![Device::new("den_fan", DeviceClass::Fan, "den")]);

        let handle = hub
            .submit_intent(IntentRequest::new("ui", "den_fan", Action::Power(true), "fan-1"))
            .unwrap();
        hub.on_ack(&Ack {
            device_id: "den_fan".into(),
            version: 1,
            token: Some("fan-1".into()),
            ok: true,
        });
        assert_eq!(handle.status(), IntentStatus::Acknowledged);

        let (tx, _rx) = broadcast::channel(8);
        let ctx = ServiceContext::new("janitor".into(), serde_json::Value::Null, EventPublisher::new(tx));
        let mut janitor = JanitorService::new(hub.clone(), Duration::from_secs(30));

        janitor.on_tick(&ctx).await.unwrap();
        assert!(hub.intent(handle.id).is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        janitor.on_tick(&ctx).await.unwrap();
        assert!(hub.intent(handle.id).is_none());

        // Token is free again once retention has passed
        let again = hub
            .submit_intent(IntentRequest::new("ui", "den_fan", Action::Power(true), "fan-1"))
            .unwrap();
        assert_ne!(again.id, handle.id);
    }
}
