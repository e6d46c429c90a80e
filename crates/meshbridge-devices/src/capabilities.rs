//! Capability store.
//!
//! A device exposes its features to the host as named capabilities
//! (`onoff`, `measure_temperature`, ...). Grants are lazy, monotonic and
//! idempotent: a capability appears the first time a value for it is known
//! and never disappears during a session.

use std::collections::BTreeMap;

use meshbridge_core::AttributeValue;
use thiserror::Error;

/// Capability names.
pub mod names {
    pub const ONOFF: &str = "onoff";
    pub const DIM: &str = "dim";
    pub const MEASURE_BATTERY: &str = "measure_battery";
    pub const ALARM_BATTERY: &str = "alarm_battery";
    pub const MEASURE_TEMPERATURE: &str = "measure_temperature";
    pub const TARGET_TEMPERATURE: &str = "target_temperature";
    pub const MEASURE_HUMIDITY: &str = "measure_humidity";
    pub const MEASURE_PRESSURE: &str = "measure_pressure";
    pub const MEASURE_LUMINANCE: &str = "measure_luminance";
    pub const METER_POWER: &str = "meter_power";
    pub const MEASURE_POWER: &str = "measure_power";
    pub const MEASURE_CURRENT: &str = "measure_current";
    pub const MEASURE_VOLTAGE: &str = "measure_voltage";
    pub const ALARM_MOTION: &str = "alarm_motion";
    pub const ALARM_CONTACT: &str = "alarm_contact";
    pub const ALARM_SMOKE: &str = "alarm_smoke";
    pub const ALARM_WATER: &str = "alarm_water";
    pub const ALARM_CO: &str = "alarm_co";
    pub const ALARM_VIBRATION: &str = "alarm_vibration";
    pub const ALARM_GENERIC: &str = "alarm_generic";
    pub const ALARM_TAMPER: &str = "alarm_tamper";
    pub const WINDOWCOVERINGS_SET: &str = "windowcoverings_set";
    pub const LOCKED: &str = "locked";
    pub const LIGHT_HUE: &str = "light_hue";
    pub const LIGHT_SATURATION: &str = "light_saturation";
}

/// Whether a capability reports battery state.
pub fn is_battery_capability(name: &str) -> bool {
    name == names::MEASURE_BATTERY || name == names::ALARM_BATTERY
}

/// A pending capability write.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityUpdate {
    pub capability: String,
    pub value: AttributeValue,
}

impl CapabilityUpdate {
    pub fn new(capability: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            capability: capability.into(),
            value: value.into(),
        }
    }
}

/// Errors raised by a capability store when a write is refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CapabilityWriteError {
    #[error("Capability not granted: {0}")]
    NotGranted(String),

    #[error("Capability {capability} rejected value: {reason}")]
    Rejected { capability: String, reason: String },

    #[error("Capability store unavailable")]
    Unavailable,
}

impl From<CapabilityWriteError> for meshbridge_core::Error {
    fn from(err: CapabilityWriteError) -> Self {
        meshbridge_core::Error::Capability(err.to_string())
    }
}

/// Host-side capability collection of one device.
pub trait CapabilityStore: Send {
    /// Add a capability. Returns `true` if it was not present.
    fn grant_capability(&mut self, name: &str) -> bool;

    fn has_capability(&self, name: &str) -> bool;

    /// Store a value. Returns `Ok(true)` if the stored value changed.
    fn set_capability_value(
        &mut self,
        name: &str,
        value: AttributeValue,
    ) -> Result<bool, CapabilityWriteError>;

    fn capability_value(&self, name: &str) -> Option<AttributeValue>;

    /// Granted capability names, sorted.
    fn capabilities(&self) -> Vec<String>;
}

/// In-memory capability store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilitySet {
    values: BTreeMap<String, Option<AttributeValue>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Granted capabilities with their current values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&AttributeValue>)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// JSON object of capability name to value (`null` when unset).
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .values
            .iter()
            .map(|(k, v)| {
                let value = v
                    .as_ref()
                    .map(AttributeValue::to_json)
                    .unwrap_or(serde_json::Value::Null);
                (k.clone(), value)
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

impl CapabilityStore for CapabilitySet {
    fn grant_capability(&mut self, name: &str) -> bool {
        if self.values.contains_key(name) {
            return false;
        }
        self.values.insert(name.to_string(), None);
        true
    }

    fn has_capability(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    fn set_capability_value(
        &mut self,
        name: &str,
        value: AttributeValue,
    ) -> Result<bool, CapabilityWriteError> {
        let slot = self
            .values
            .get_mut(name)
            .ok_or_else(|| CapabilityWriteError::NotGranted(name.to_string()))?;
        if slot.as_ref() == Some(&value) {
            return Ok(false);
        }
        *slot = Some(value);
        Ok(true)
    }

    fn capability_value(&self, name: &str) -> Option<AttributeValue> {
        self.values.get(name).cloned().flatten()
    }

    fn capabilities(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }
}
