//! Numeric data-point (DP) alias table shared by the codec and the device
//! session's high-level on/off/brightness/colour-temperature API.
//!
//! Real devices expose controllable attributes as numeric-keyed JSON fields
//! inside a `dps` object (`"1": true`, `"22": 500`, ...). Which numeric key
//! backs a given attribute — and the scale its value is expressed in —
//! varies by device generation, so callers look the key up rather than
//! hard-coding it.

use serde_json::{Map, Value};

/// Switch keys, newest revision first: DP 20 (newer firmware) falls back to
/// DP 1 (older firmware) when both could apply.
const SWITCH_KEYS: &[&str] = &["20", "1"];
const MODE_KEY: &str = "21";
const COLOUR_KEY: &str = "24";

/// A DP key paired with the value scale devices report it in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaledKey {
    pub key: &'static str,
    pub scale: u32,
}

const BRIGHTNESS_KEYS: &[ScaledKey] = &[
    ScaledKey { key: "22", scale: 1000 },
    ScaledKey { key: "2", scale: 255 },
];

const COLOURTEMP_KEYS: &[ScaledKey] = &[
    ScaledKey { key: "23", scale: 1000 },
    ScaledKey { key: "3", scale: 255 },
];

/// Enrich a decrypted `STATUS` message's `data["dps"]` object in place with
/// semantic aliases (`is_on`, `brightness`, `colourtemp`, `mode`, `colour`)
/// alongside the numeric keys a device actually sent.
pub fn enrich_status(data: &mut Value) {
    if let Some(dps) = data.get_mut("dps").and_then(Value::as_object_mut) {
        enrich_dps(dps);
    }
}

pub fn enrich_dps(dps: &mut Map<String, Value>) {
    if let Some(v) = first_present(dps, SWITCH_KEYS) {
        dps.insert("is_on".to_string(), v);
    }
    if let Some(v) = first_present_scaled(dps, BRIGHTNESS_KEYS) {
        dps.insert("brightness".to_string(), v);
    }
    if let Some(v) = first_present_scaled(dps, COLOURTEMP_KEYS) {
        dps.insert("colourtemp".to_string(), v);
    }
    if let Some(v) = dps.get(MODE_KEY).cloned() {
        dps.insert("mode".to_string(), v);
    }
    if let Some(v) = dps.get(COLOUR_KEY).cloned() {
        dps.insert("colour".to_string(), v);
    }
}

fn first_present(dps: &Map<String, Value>, keys: &[&str]) -> Option<Value> {
    keys.iter().find_map(|k| dps.get(*k).cloned())
}

fn first_present_scaled(dps: &Map<String, Value>, keys: &[ScaledKey]) -> Option<Value> {
    keys.iter().find_map(|sk| dps.get(sk.key).cloned())
}

/// Which DP key currently backs the switch, if the device has reported one.
pub fn switch_key(dps: &Map<String, Value>) -> Option<&'static str> {
    SWITCH_KEYS.iter().copied().find(|k| dps.contains_key(*k))
}

/// Which DP key (and scale) currently backs brightness.
pub fn brightness_key(dps: &Map<String, Value>) -> Option<ScaledKey> {
    BRIGHTNESS_KEYS.iter().copied().find(|sk| dps.contains_key(sk.key))
}

/// Which DP key (and scale) currently backs colour temperature.
pub fn colourtemp_key(dps: &Map<String, Value>) -> Option<ScaledKey> {
    COLOURTEMP_KEYS.iter().copied().find(|sk| dps.contains_key(sk.key))
}

/// Brightness values sent on the legacy 255-scale DP (`"2"`) are clamped up
/// to a minimum of 25 — devices on that generation ignore lower values.
pub fn clamp_brightness(key: &str, value: u32) -> u32 {
    if key == "2" {
        value.max(25)
    } else {
        value
    }
}
