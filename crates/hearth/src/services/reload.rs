//! Home reload service
//!
//! Re-reads the room files on `home/rooms-changed` and applies the device
//! diff to the hub. Optionally owns the file watcher that produces those
//! events.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use hearth_runtime::service::{
    BusEvent, Service, ServiceContext, ServiceError, ServiceResult, ServiceSpec,
};
use tokio::task::JoinHandle;

use crate::home::{HomeLoader, HomeWatcher, ROOMS_CHANGED, collect_devices};
use crate::hub::Hub;

pub const RELOADED_TOPIC: &str = "home/reloaded";

pub struct ReloadService {
    hub: Arc<Hub>,
    home_path: PathBuf,
    watch: bool,
    watcher: Option<JoinHandle<()>>,
}

impl ReloadService {
    pub fn new(hub: Arc<Hub>, home_path: impl Into<PathBuf>, watch: bool) -> Self {
        Self {
            hub,
            home_path: home_path.into(),
            watch,
            watcher: None,
        }
    }
}

#[async_trait]
impl Service for ReloadService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("home/reload", "Home Reload")
            .subscribe(ROOMS_CHANGED)
            .with_description("Applies room file edits to the device registry")
    }

    async fn on_start(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        if !self.watch {
            return Ok(());
        }
        let watcher = HomeWatcher::new(&self.home_path, ctx.publisher()).map_err(|e| {
            ServiceError::InitializationFailed(format!("Failed to watch home directory: {e}"))
        })?;
        self.watcher = Some(tokio::spawn(watcher.run()));
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        Ok(())
    }

    async fn on_event(&mut self, ctx: &ServiceContext, event: BusEvent) -> ServiceResult<()> {
        if !event.matches(ROOMS_CHANGED) {
            return Ok(());
        }

        let rooms = match HomeLoader::load_rooms(&self.home_path).await {
            Ok(rooms) => rooms,
            Err(e) => {
                // Keep the current registry until the files parse again
                tracing::error!("Home reload failed: {}", e);
                return Err(ServiceError::EventError(e.to_string()));
            }
        };

        let summary = self.hub.apply_devices(collect_devices(&rooms));
        if summary.is_empty() {
            tracing::debug!("Home reload changed nothing");
            return Ok(());
        }

        tracing::info!(
            added = summary.added.len(),
            updated = summary.updated.len(),
            removed = summary.removed.len(),
            rejected = summary.rejected.len(),
            "Home reloaded"
        );
        let data = serde_json::to_value(&summary).unwrap_or_default();
        let _ = ctx.emit(RELOADED_TOPIC, data);
        Ok(())
    }
}
