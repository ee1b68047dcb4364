//! Home Loader
//!
//! Reads `home.toml` and every `rooms/*.room.toml` file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};

use crate::registry::Device;

use super::config::*;

/// Error type for home loading
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Home path does not exist: {0}")]
    PathNotFound(PathBuf),

    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse room file {path}: {source}")]
    RoomParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid settings: {0}")]
    Settings(#[from] Box<figment::Error>),
}

/// A loaded home directory
#[derive(Debug, Clone)]
pub struct Home {
    pub path: PathBuf,
    pub settings: Settings,
    pub rooms: Vec<RoomFile>,
}

impl Home {
    /// Devices from every room; a device id seen twice keeps its first definition
    pub fn devices(&self) -> Vec<Device> {
        collect_devices(&self.rooms)
    }
}

/// Flatten rooms into devices, dropping repeated ids
pub fn collect_devices(rooms: &[RoomFile]) -> Vec<Device> {
    let mut seen = HashSet::new();
    let mut devices = Vec::new();
    for room in rooms {
        for device in room.to_devices() {
            if !seen.insert(device.id.clone()) {
                warn!(device_id = %device.id, room = %room.room.id, "Duplicate device id ignored");
                continue;
            }
            devices.push(device);
        }
    }
    devices
}

/// Home loader
pub struct HomeLoader;

impl HomeLoader {
    /// Load settings and rooms from the given path
    pub async fn load(path: impl AsRef<Path>) -> Result<Home, LoadError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(LoadError::PathNotFound(path.to_path_buf()));
        }

        info!("Loading home from: {}", path.display());

        let settings = Settings::load(path)?;
        info!("Loaded home settings: {} ({})", settings.home.name, settings.home.id);

        let rooms = Self::load_rooms(path).await?;
        info!("Loaded {} rooms", rooms.len());

        Ok(Home {
            path: path.to_path_buf(),
            settings,
            rooms,
        })
    }

    /// Load every room file. One unparsable file fails the whole load so a
    /// half-edited room never removes its devices.
    pub async fn load_rooms(home_path: &Path) -> Result<Vec<RoomFile>, LoadError> {
        let rooms_dir = home_path.join("rooms");
        let mut rooms = Vec::new();

        if !rooms_dir.exists() {
            debug!("No rooms directory found");
            return Ok(rooms);
        }

        let mut paths = Vec::new();
        let mut entries = fs::read_dir(&rooms_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_room_file(&path) {
                paths.push(path);
            }
        }
        // Directory order is platform dependent; duplicates resolve by file name
        paths.sort();

        for path in paths {
            let room = Self::load_room(&path).await?;
            debug!("Loaded room: {} ({} devices)", room.room.id, room.devices.len());
            rooms.push(room);
        }

        Ok(rooms)
    }

    async fn load_room(path: &Path) -> Result<RoomFile, LoadError> {
        let content = fs::read_to_string(path).await?;
        toml::from_str(&content).map_err(|source| LoadError::RoomParseError {
            path: path.to_path_buf(),
            source,
        })
    }
}

pub(crate) fn is_room_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name.ends_with(".room.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_room(dir: &Path, file: &str, body: &str) {
        let rooms = dir.join("rooms");
        std::fs::create_dir_all(&rooms).unwrap();
        std::fs::write(rooms.join(file), body).unwrap();
    }

    #[tokio::test]
    async fn test_load_home() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("home.toml"), "[home]\nid = \"cabin\"\nname = \"Cabin\"\n").unwrap();
        write_room(
            dir.path(),
            "hall.room.toml",
            "[room]\nid = \"hall\"\n\n[[devices]]\nid = \"hall_light\"\nclass = \"light\"\n",
        );
        write_room(
            dir.path(),
            "kitchen.room.toml",
            "[room]\nid = \"kitchen\"\n\n[[devices]]\nid = \"kitchen_gas\"\nclass = \"sensor\"\nkind = \"gas\"\n\n[[devices]]\nid = \"hall_light\"\nclass = \"fan\"\n",
        );
        std::fs::write(dir.path().join("rooms/notes.txt"), "ignored").unwrap();

        let home = HomeLoader::load(dir.path()).await.unwrap();
        assert_eq!(home.settings.home.id, "cabin");
        assert_eq!(home.rooms.len(), 2);

        let devices = home.devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].room, "hall");
        assert_eq!(devices[0].class, crate::types::DeviceClass::Light);
    }

    #[tokio::test]
    async fn test_broken_room_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        write_room(dir.path(), "attic.room.toml", "[room\nid = ");

        let err = HomeLoader::load_rooms(dir.path()).await.unwrap_err();
        assert!(matches!(err, LoadError::RoomParseError { .. }));
    }

    #[tokio::test]
    async fn test_missing_home() {
        let err = HomeLoader::load("/definitely/not/a/home").await.unwrap_err();
        assert!(matches!(err, LoadError::PathNotFound(_)));
    }
}
