//! Device Registry
//!
//! Catalog of known devices, their capabilities and room membership.
//! Populated from the home directory at startup and read-mostly afterwards.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::types::{
    Action, Capability, DeviceClass, DeviceId, Error, Result, SafetyClass, SensorKind,
};

/// Static description of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub class: DeviceClass,
    pub room: String,
    pub capabilities: BTreeSet<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_kind: Option<SensorKind>,
    /// Door on an escape route, opened by emergency plans
    #[serde(default)]
    pub egress: bool,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>, class: DeviceClass, room: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            class,
            room: room.into(),
            capabilities: class.default_capabilities(),
            sensor_kind: None,
            egress: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn with_sensor_kind(mut self, kind: SensorKind) -> Self {
        self.sensor_kind = Some(kind);
        self
    }

    pub fn egress(mut self, egress: bool) -> Self {
        self.egress = egress;
        self
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Safety class of the telemetry this device produces, if any
    pub fn safety_class(&self) -> Option<SafetyClass> {
        match (self.class, self.sensor_kind.unwrap_or_default()) {
            (DeviceClass::Sensor, SensorKind::Smoke) => Some(SafetyClass::Smoke),
            (DeviceClass::Sensor, SensorKind::Gas) => Some(SafetyClass::Gas),
            (DeviceClass::Sensor, SensorKind::Motion | SensorKind::Contact) => {
                Some(SafetyClass::Intrusion)
            }
            (DeviceClass::SecurityZone, _) => Some(SafetyClass::Intrusion),
            _ => None,
        }
    }

    fn check_capabilities(&self) -> Result<()> {
        match self.capabilities.iter().find(|cap| !self.class.allows(**cap)) {
            Some(cap) => Err(Error::InvalidState {
                device: self.id.clone(),
                reason: format!("capability {cap:?} is not valid for a {}", self.class),
            }),
            None => Ok(()),
        }
    }
}

/// Result of a registration call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    /// Same id and capabilities were already present
    Unchanged,
}

/// Catalog of devices keyed by id
#[derive(Debug, Default)]
pub struct Registry {
    devices: DashMap<DeviceId, Arc<Device>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device. Re-registering identical capabilities is a no-op.
    pub fn register(&self, device: Device) -> Result<Registration> {
        device.check_capabilities()?;

        match self.devices.entry(device.id.clone()) {
            Entry::Occupied(existing) => {
                if existing.get().capabilities == device.capabilities {
                    Ok(Registration::Unchanged)
                } else {
                    Err(Error::DuplicateDevice(device.id))
                }
            }
            Entry::Vacant(slot) => {
                tracing::debug!(device_id = %device.id, class = %device.class, room = %device.room, "Registered device");
                slot.insert(Arc::new(device));
                Ok(Registration::Added)
            }
        }
    }

    /// Swap in a new descriptor for a device (home reload)
    pub fn replace(&self, device: Device) -> Result<Option<Arc<Device>>> {
        device.check_capabilities()?;
        Ok(self.devices.insert(device.id.clone(), Arc::new(device)))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.remove(id).map(|(_, device)| device)
    }

    pub fn lookup(&self, id: &str) -> Result<Arc<Device>> {
        self.devices
            .get(id)
            .map(|d| d.value().clone())
            .ok_or_else(|| Error::NotFound(format!("device {id}")))
    }

    pub fn capabilities_of(&self, id: &str) -> Result<BTreeSet<Capability>> {
        self.lookup(id).map(|d| d.capabilities.clone())
    }

    /// Check that an action is legal for a device
    pub fn validate(&self, id: &str, action: &Action) -> Result<Arc<Device>> {
        let device = self.lookup(id)?;

        if !device.has(action.capability()) {
            return Err(Error::InvalidState {
                device: device.id.clone(),
                reason: format!(
                    "{} has no {:?} capability",
                    device.id,
                    action.capability()
                ),
            });
        }

        action.check_range().map_err(|reason| Error::InvalidState {
            device: device.id.clone(),
            reason,
        })?;

        Ok(device)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// All devices ordered by id
    pub fn devices(&self) -> Vec<Arc<Device>> {
        let mut all: Vec<_> = self.devices.iter().map(|d| d.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn of_class(&self, class: DeviceClass) -> Vec<Arc<Device>> {
        self.devices()
            .into_iter()
            .filter(|d| d.class == class)
            .collect()
    }

    pub fn in_room(&self, room: &str) -> Vec<Arc<Device>> {
        self.devices()
            .into_iter()
            .filter(|d| d.room == room)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dimmer(id: &str) -> Device {
        Device::new(id, DeviceClass::Light, "living_room")
            .with_capabilities([Capability::OnOff, Capability::Brightness])
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = Registry::new();

        assert_eq!(registry.register(dimmer("lamp")).unwrap(), Registration::Added);
        assert_eq!(registry.register(dimmer("lamp")).unwrap(), Registration::Unchanged);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_conflicting_capabilities() {
        let registry = Registry::new();
        registry.register(dimmer("lamp")).unwrap();

        let binary = Device::new("lamp", DeviceClass::Light, "living_room");
        let err = registry.register(binary).unwrap_err();
        assert!(matches!(err, Error::DuplicateDevice(id) if id.as_str() == "lamp"));
    }

    #[test]
    fn test_register_rejects_foreign_capability() {
        let registry = Registry::new();
        let door = Device::new("front_door", DeviceClass::Door, "hall")
            .with_capabilities([Capability::Brightness]);

        assert!(matches!(registry.register(door), Err(Error::InvalidState { .. })));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_unknown() {
        let registry = Registry::new();
        assert!(matches!(registry.lookup("ghost"), Err(Error::NotFound(_))));
        assert!(matches!(registry.capabilities_of("ghost"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_validate_action() {
        let registry = Registry::new();
        registry.register(Device::new("hall_light", DeviceClass::Light, "hall")).unwrap();
        registry.register(dimmer("lamp")).unwrap();

        assert!(registry.validate("hall_light", &Action::Power(true)).is_ok());
        assert!(matches!(
            registry.validate("hall_light", &Action::Brightness(50)),
            Err(Error::InvalidState { .. })
        ));
        assert!(registry.validate("lamp", &Action::Brightness(50)).is_ok());
        assert!(matches!(
            registry.validate("lamp", &Action::Brightness(150)),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn test_safety_class() {
        let smoke = Device::new("kitchen_smoke", DeviceClass::Sensor, "kitchen")
            .with_sensor_kind(SensorKind::Smoke);
        let temp = Device::new("kitchen_temp", DeviceClass::Sensor, "kitchen")
            .with_sensor_kind(SensorKind::Temperature);
        let zone = Device::new("perimeter", DeviceClass::SecurityZone, "hall");

        assert_eq!(smoke.safety_class(), Some(SafetyClass::Smoke));
        assert_eq!(temp.safety_class(), None);
        assert_eq!(zone.safety_class(), Some(SafetyClass::Intrusion));
    }

    #[test]
    fn test_filters() {
        let registry = Registry::new();
        registry.register(dimmer("lamp")).unwrap();
        registry.register(Device::new("hall_door", DeviceClass::Door, "hall")).unwrap();
        registry.register(Device::new("hall_fan", DeviceClass::Fan, "hall")).unwrap();

        let hall: Vec<_> = registry.in_room("hall").iter().map(|d| d.id.to_string()).collect();
        assert_eq!(hall, vec!["hall_door", "hall_fan"]);
        assert_eq!(registry.of_class(DeviceClass::Light).len(), 1);

        assert!(registry.remove("lamp").is_some());
        assert!(!registry.contains("lamp"));
    }
}
