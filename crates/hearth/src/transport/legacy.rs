//! Legacy command codes
//!
//! The first controller firmware only understood flat `room_class_verb`
//! strings such as `kitchen_light_on` or `living_room_door_close`. The
//! device id is everything before the verb, so codes decode into a device id
//! and a typed [`Action`] once, at the boundary.

use crate::types::{Action, DeviceId, Error, Result};

const VERBS: &[(&str, Action)] = &[
    ("on", Action::Power(true)),
    ("off", Action::Power(false)),
    ("open", Action::Open(true)),
    ("close", Action::Open(false)),
    ("arm", Action::Arm(true)),
    ("disarm", Action::Arm(false)),
    ("record", Action::Record(true)),
    ("stop", Action::Record(false)),
];

/// Split a legacy code into target device and action
pub fn decode(code: &str) -> Result<(DeviceId, Action)> {
    let code = code.trim().to_ascii_lowercase();
    let (device, verb) = code
        .rsplit_once('_')
        .ok_or_else(|| Error::Protocol(format!("'{code}' is not a room_class_verb code")))?;

    let action = VERBS
        .iter()
        .find(|(name, _)| *name == verb)
        .map(|(_, action)| *action)
        .ok_or_else(|| Error::Protocol(format!("unknown verb '{verb}' in '{code}'")))?;

    if device.is_empty() {
        return Err(Error::Protocol(format!("'{code}' names no device")));
    }

    Ok((DeviceId::new(device), action))
}

/// Legacy code for a command, if the action has one
pub fn encode(device_id: &DeviceId, action: &Action) -> Option<String> {
    VERBS
        .iter()
        .find(|(_, candidate)| candidate == action)
        .map(|(verb, _)| format!("{device_id}_{verb}"))
}
