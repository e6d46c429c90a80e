//! Power model.
//!
//! Decides whether a device may expose battery capabilities and which
//! battery chemistries fit it. Battery capabilities only ever appear after
//! the device itself signalled a battery (a battery value or a battery-low
//! zone bit); a declared battery power source alone is not enough.

use std::collections::BTreeMap;

use meshbridge_core::catalog::id as cluster;
use meshbridge_core::config::{defaults, PowerConfig};
use meshbridge_core::{AttributeValue, TopologySnapshot};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capabilities::{is_battery_capability, CapabilityUpdate};
use crate::zone::zone_type;

/// Basic cluster power source attribute.
pub const POWER_SOURCE_ATTR: u16 = 0x0007;

/// Flag for a secondary battery on top of the primary source.
pub const BACKUP_BATTERY_BIT: u8 = 0x80;

/// Primary power source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerSource {
    #[default]
    Unknown,
    Mains,
    Battery,
    Dc,
}

impl PowerSource {
    /// Decode the power source attribute into source and backup flag.
    pub fn from_attribute(raw: u8) -> (Self, bool) {
        let backup = raw & BACKUP_BATTERY_BIT != 0;
        let source = match raw & !BACKUP_BATTERY_BIT {
            1 | 2 | 5 | 6 => Self::Mains,
            3 => Self::Battery,
            4 => Self::Dc,
            _ => Self::Unknown,
        };
        (source, backup)
    }
}

/// Coarse device kind used to pick battery defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Contact,
    Motion,
    Climate,
    Remote,
    Lock,
    Switch,
    Plug,
    Light,
    #[default]
    Other,
}

impl DeviceKind {
    /// Key used in the `power.chemistry` configuration table.
    pub fn key(self) -> &'static str {
        match self {
            Self::Contact => "contact",
            Self::Motion => "motion",
            Self::Climate => "climate",
            Self::Remote => "remote",
            Self::Lock => "lock",
            Self::Switch => "switch",
            Self::Plug => "plug",
            Self::Light => "light",
            Self::Other => "other",
        }
    }

    /// Best guess from the zone type, then from the clusters exposed.
    pub fn infer(topology: Option<&TopologySnapshot>, zone: Option<u16>) -> Self {
        match zone {
            Some(zone_type::MOTION) => return Self::Motion,
            Some(zone_type::CONTACT) | Some(zone_type::VIBRATION) => return Self::Contact,
            _ => {}
        }

        let Some(topology) = topology else {
            return Self::Other;
        };
        let has_input = |c: u16| topology.endpoints.iter().any(|e| e.has_input(c));
        let has_output = |c: u16| topology.endpoints.iter().any(|e| e.output_clusters.contains(&c));

        if has_input(cluster::DOOR_LOCK) {
            Self::Lock
        } else if has_input(cluster::OCCUPANCY_SENSING) {
            Self::Motion
        } else if has_input(cluster::IAS_ZONE) {
            Self::Contact
        } else if has_input(cluster::TEMPERATURE_MEASUREMENT) || has_input(cluster::HUMIDITY_MEASUREMENT) {
            Self::Climate
        } else if has_input(cluster::COLOR_CONTROL) || has_input(cluster::LEVEL_CONTROL) {
            Self::Light
        } else if has_input(cluster::METERING) || has_input(cluster::ELECTRICAL_MEASUREMENT) {
            Self::Plug
        } else if has_input(cluster::ON_OFF) {
            Self::Switch
        } else if has_output(cluster::ON_OFF) || has_output(cluster::LEVEL_CONTROL) {
            Self::Remote
        } else {
            Self::Other
        }
    }
}

/// Serializable view of the power model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSummary {
    pub source: PowerSource,
    pub backup_battery: bool,
    pub battery_signaled: bool,
    pub chemistry: Vec<String>,
}

/// Per-device power classification.
#[derive(Debug, Clone)]
pub struct PowerModel {
    kind: DeviceKind,
    source: PowerSource,
    backup_battery: bool,
    battery_signaled: bool,
    chemistry: BTreeMap<String, Vec<String>>,
    fallback: Vec<String>,
}

impl Default for PowerModel {
    fn default() -> Self {
        Self::new(DeviceKind::Other, &PowerConfig::default())
    }
}

impl PowerModel {
    pub fn new(kind: DeviceKind, config: &PowerConfig) -> Self {
        Self {
            kind,
            source: PowerSource::Unknown,
            backup_battery: false,
            battery_signaled: false,
            chemistry: config.chemistry.clone(),
            fallback: config.fallback.clone(),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: DeviceKind) {
        self.kind = kind;
    }

    pub fn source(&self) -> PowerSource {
        self.source
    }

    pub fn backup_battery(&self) -> bool {
        self.backup_battery
    }

    pub fn battery_signaled(&self) -> bool {
        self.battery_signaled
    }

    /// Record a power source attribute value.
    pub fn observe_power_source(&mut self, value: &AttributeValue) -> Option<PowerSource> {
        let raw = value.as_i64().and_then(|v| u8::try_from(v).ok())?;
        let (source, backup) = PowerSource::from_attribute(raw);
        self.source = source;
        self.backup_battery = backup;
        debug!(category = "power", source = ?source, backup, "Power source classified");
        Some(source)
    }

    /// Whether battery signals from this device are believed.
    ///
    /// A mains or DC device without a backup battery reusing a battery
    /// datapoint id for something else is common, so those are dropped.
    pub fn accepts_battery(&self) -> bool {
        !matches!(self.source, PowerSource::Mains | PowerSource::Dc) || self.backup_battery
    }

    /// Record a battery signal. Returns whether it was accepted.
    pub fn signal_battery(&mut self) -> bool {
        if self.accepts_battery() {
            self.battery_signaled = true;
            true
        } else {
            false
        }
    }

    pub fn is_battery_powered(&self) -> bool {
        self.source == PowerSource::Battery || self.backup_battery || self.battery_signaled
    }

    /// Drop battery updates the device is not allowed to produce; the
    /// accepted ones count as battery signaling.
    pub fn gate(&mut self, updates: Vec<CapabilityUpdate>) -> Vec<CapabilityUpdate> {
        updates
            .into_iter()
            .filter(|u| {
                if !is_battery_capability(&u.capability) {
                    return true;
                }
                let accepted = self.signal_battery();
                if !accepted {
                    debug!(
                        category = "power",
                        capability = %u.capability,
                        source = ?self.source,
                        "Battery update dropped for mains-powered device"
                    );
                }
                accepted
            })
            .collect()
    }

    /// Compatible battery chemistries; empty until a battery was signalled.
    pub fn chemistry(&self) -> Vec<String> {
        if !self.battery_signaled {
            return Vec::new();
        }
        let by_kind = self
            .chemistry
            .get(self.kind.key())
            .filter(|list| !list.is_empty());
        match by_kind {
            Some(list) => list.clone(),
            None if !self.fallback.is_empty() => self.fallback.clone(),
            None => defaults::GENERIC_CHEMISTRY
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn summary(&self) -> PowerSummary {
        PowerSummary {
            source: self.source,
            backup_battery: self.backup_battery,
            battery_signaled: self.battery_signaled,
            chemistry: self.chemistry(),
        }
    }
}
