//! Home File Watcher
//!
//! Watches the home directory and announces room edits on the service bus
//! as `home/rooms-changed`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hearth_runtime::service::EventPublisher;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::loader::is_room_file;

pub const ROOMS_CHANGED: &str = "home/rooms-changed";

/// Editors write a file in several steps; changes closer than this collapse
const DEBOUNCE: Duration = Duration::from_millis(200);

/// File change event
#[derive(Debug, Clone, PartialEq)]
pub enum FileChange {
    /// A room file was created, modified or deleted
    RoomChanged(String),
    /// home.toml was modified
    SettingsChanged,
}

/// Home file watcher
pub struct HomeWatcher {
    home_path: PathBuf,
    publisher: EventPublisher,
    rx: mpsc::Receiver<FileChange>,
    /// Kept alive for the lifetime of the loop
    _watcher: RecommendedWatcher,
}

impl HomeWatcher {
    pub fn new(home_path: impl AsRef<Path>, publisher: EventPublisher) -> Result<Self, notify::Error> {
        let home_path = home_path
            .as_ref()
            .canonicalize()
            .unwrap_or_else(|_| home_path.as_ref().to_path_buf());
        let (tx, rx) = mpsc::channel(100);

        let root = home_path.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if let Some(change) = Self::event_to_change(&root, &event) {
                        let _ = tx.blocking_send(change);
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            }
        })?;

        watcher.watch(&home_path, RecursiveMode::Recursive)?;
        info!("Watching home directory: {}", home_path.display());

        Ok(Self {
            home_path,
            publisher,
            rx,
            _watcher: watcher,
        })
    }

    fn event_to_change(home_path: &Path, event: &Event) -> Option<FileChange> {
        match event.kind {
            EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_) => {}
            _ => return None,
        }

        let path = event.paths.first()?;
        let rel_path = path.strip_prefix(home_path).ok()?;
        classify(rel_path)
    }

    pub async fn run(mut self) {
        debug!("Starting file watcher loop for {}", self.home_path.display());

        while let Some(first) = self.rx.recv().await {
            let mut rooms = Vec::new();
            let mut settings = false;
            let mut note = |change: FileChange| match change {
                FileChange::RoomChanged(room) => {
                    if !rooms.contains(&room) {
                        rooms.push(room);
                    }
                }
                FileChange::SettingsChanged => settings = true,
            };

            note(first);
            tokio::time::sleep(DEBOUNCE).await;
            while let Ok(change) = self.rx.try_recv() {
                note(change);
            }

            if settings {
                warn!("home.toml changed; settings apply on restart");
            }
            if rooms.is_empty() {
                continue;
            }

            info!(rooms = ?rooms, "Room files changed");
            let data = serde_json::json!({ "rooms": rooms });
            if self.publisher.emit(ROOMS_CHANGED, "watcher", data).is_err() {
                debug!("No bus listeners for room changes");
            }
        }

        debug!("File watcher loop ended");
    }
}

fn classify(rel_path: &Path) -> Option<FileChange> {
    if rel_path == Path::new("home.toml") {
        return Some(FileChange::SettingsChanged);
    }
    if rel_path.starts_with("rooms") && is_room_file(rel_path) {
        let name = rel_path.file_name()?.to_str()?;
        let room = name.strip_suffix(".room.toml")?;
        return Some(FileChange::RoomChanged(room.to_string()));
    }
    None
}
