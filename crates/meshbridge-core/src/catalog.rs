//! Cluster catalog.
//!
//! Static registry of the standard clusters used by the supported device
//! classes plus a fixed table of known vendor private clusters. Lookups in
//! both directions are O(1); unknown ids and names resolve to `None`.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Well-known cluster ids.
pub mod id {
    // General
    pub const BASIC: u16 = 0x0000;
    pub const POWER_CONFIG: u16 = 0x0001;
    pub const IDENTIFY: u16 = 0x0003;
    pub const GROUPS: u16 = 0x0004;
    pub const SCENES: u16 = 0x0005;
    pub const ON_OFF: u16 = 0x0006;
    pub const LEVEL_CONTROL: u16 = 0x0008;
    pub const ALARMS: u16 = 0x0009;
    pub const TIME: u16 = 0x000A;

    // Closures
    pub const DOOR_LOCK: u16 = 0x0101;
    pub const WINDOW_COVERING: u16 = 0x0102;

    // HVAC
    pub const THERMOSTAT: u16 = 0x0201;
    pub const FAN_CONTROL: u16 = 0x0202;

    // Lighting
    pub const COLOR_CONTROL: u16 = 0x0300;

    // Measurement
    pub const ILLUMINANCE_MEASUREMENT: u16 = 0x0400;
    pub const TEMPERATURE_MEASUREMENT: u16 = 0x0402;
    pub const PRESSURE_MEASUREMENT: u16 = 0x0403;
    pub const HUMIDITY_MEASUREMENT: u16 = 0x0405;
    pub const OCCUPANCY_SENSING: u16 = 0x0406;

    // Security
    pub const IAS_ZONE: u16 = 0x0500;
    pub const IAS_ACE: u16 = 0x0501;
    pub const IAS_WD: u16 = 0x0502;

    // Smart energy
    pub const METERING: u16 = 0x0702;
    pub const ELECTRICAL_MEASUREMENT: u16 = 0x0B04;

    // Vendor private
    pub const TUYA_SPECIFIC_0: u16 = 0xE000;
    pub const TUYA_EXTERNAL_SWITCH: u16 = 0xE001;
    pub const PROPRIETARY_DATAPOINT: u16 = 0xEF00;
    pub const PHILIPS_PRIVATE: u16 = 0xFC00;
    pub const LEGRAND_PRIVATE: u16 = 0xFC01;
    pub const SONOFF_PRIVATE: u16 = 0xFC11;
    pub const IKEA_PRIVATE: u16 = 0xFC7C;
    pub const XIAOMI_PRIVATE: u16 = 0xFCC0;
    pub const XIAOMI_LEGACY: u16 = 0xFF01;
}

/// Lower bound of the manufacturer-specific cluster band.
pub const MANUFACTURER_BAND_START: u16 = 0xFC00;

/// Whether a cluster id falls in the manufacturer-specific band.
pub fn is_manufacturer_specific(cluster_id: u16) -> bool {
    cluster_id >= MANUFACTURER_BAND_START
}

/// Whether a cluster is vendor-private: the manufacturer band, the datapoint
/// tunnel or any catalogued vendor cluster.
pub fn is_private_cluster(cluster_id: u16) -> bool {
    cluster_id == id::PROPRIETARY_DATAPOINT
        || is_manufacturer_specific(cluster_id)
        || ClusterCatalog::vendor_of(cluster_id).is_some()
}

/// Which side of a cluster an endpoint implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Server side, listed as an input cluster.
    Input,
    /// Client side, listed as an output cluster.
    Output,
}

/// Catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterInfo {
    pub id: u16,
    pub name: &'static str,
    /// Vendor tag for private clusters.
    pub vendor: Option<&'static str>,
}

/// Reference to a cluster on an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterRef {
    pub id: u16,
    pub name: String,
    pub direction: Direction,
}

impl ClusterRef {
    /// Build a reference, naming it from the catalog or by its hex id.
    pub fn new(id: u16, direction: Direction) -> Self {
        let name = ClusterCatalog::name_of(id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("cluster_{:04x}", id));
        Self {
            id,
            name,
            direction,
        }
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:04X})", self.name, self.id)
    }
}

const CLUSTERS: &[ClusterInfo] = &[
    ClusterInfo { id: id::BASIC, name: "basic", vendor: None },
    ClusterInfo { id: id::POWER_CONFIG, name: "powerConfiguration", vendor: None },
    ClusterInfo { id: id::IDENTIFY, name: "identify", vendor: None },
    ClusterInfo { id: id::GROUPS, name: "groups", vendor: None },
    ClusterInfo { id: id::SCENES, name: "scenes", vendor: None },
    ClusterInfo { id: id::ON_OFF, name: "onOff", vendor: None },
    ClusterInfo { id: id::LEVEL_CONTROL, name: "levelControl", vendor: None },
    ClusterInfo { id: id::ALARMS, name: "alarms", vendor: None },
    ClusterInfo { id: id::TIME, name: "time", vendor: None },
    ClusterInfo { id: id::DOOR_LOCK, name: "doorLock", vendor: None },
    ClusterInfo { id: id::WINDOW_COVERING, name: "windowCovering", vendor: None },
    ClusterInfo { id: id::THERMOSTAT, name: "thermostat", vendor: None },
    ClusterInfo { id: id::FAN_CONTROL, name: "fanControl", vendor: None },
    ClusterInfo { id: id::COLOR_CONTROL, name: "colorControl", vendor: None },
    ClusterInfo { id: id::ILLUMINANCE_MEASUREMENT, name: "illuminanceMeasurement", vendor: None },
    ClusterInfo { id: id::TEMPERATURE_MEASUREMENT, name: "temperatureMeasurement", vendor: None },
    ClusterInfo { id: id::PRESSURE_MEASUREMENT, name: "pressureMeasurement", vendor: None },
    ClusterInfo { id: id::HUMIDITY_MEASUREMENT, name: "relativeHumidity", vendor: None },
    ClusterInfo { id: id::OCCUPANCY_SENSING, name: "occupancySensing", vendor: None },
    ClusterInfo { id: id::IAS_ZONE, name: "iasZone", vendor: None },
    ClusterInfo { id: id::IAS_ACE, name: "iasACE", vendor: None },
    ClusterInfo { id: id::IAS_WD, name: "iasWD", vendor: None },
    ClusterInfo { id: id::METERING, name: "metering", vendor: None },
    ClusterInfo { id: id::ELECTRICAL_MEASUREMENT, name: "electricalMeasurement", vendor: None },
    ClusterInfo { id: id::TUYA_SPECIFIC_0, name: "tuyaManufacturerSpecific0", vendor: Some("TUYA") },
    ClusterInfo { id: id::TUYA_EXTERNAL_SWITCH, name: "tuyaExternalSwitchType", vendor: Some("TUYA") },
    ClusterInfo { id: id::PROPRIETARY_DATAPOINT, name: "tuyaDatapoint", vendor: Some("TUYA") },
    ClusterInfo { id: id::PHILIPS_PRIVATE, name: "philipsPrivate", vendor: Some("PHILIPS") },
    ClusterInfo { id: id::LEGRAND_PRIVATE, name: "legrandPrivate", vendor: Some("LEGRAND") },
    ClusterInfo { id: id::SONOFF_PRIVATE, name: "sonoffPrivate", vendor: Some("SONOFF") },
    ClusterInfo { id: id::IKEA_PRIVATE, name: "ikeaPrivate", vendor: Some("IKEA") },
    ClusterInfo { id: id::XIAOMI_PRIVATE, name: "lumiPrivate", vendor: Some("XIAOMI") },
    ClusterInfo { id: id::XIAOMI_LEGACY, name: "lumiLegacy", vendor: Some("XIAOMI") },
];

static BY_ID: Lazy<HashMap<u16, &'static ClusterInfo>> =
    Lazy::new(|| CLUSTERS.iter().map(|c| (c.id, c)).collect());

static BY_NAME: Lazy<HashMap<&'static str, &'static ClusterInfo>> =
    Lazy::new(|| CLUSTERS.iter().map(|c| (c.name, c)).collect());

/// Bidirectional cluster registry.
pub struct ClusterCatalog;

impl ClusterCatalog {
    /// Look up a cluster by id.
    pub fn get(cluster_id: u16) -> Option<&'static ClusterInfo> {
        BY_ID.get(&cluster_id).copied()
    }

    /// Look up a cluster by its semantic name.
    pub fn by_name(name: &str) -> Option<&'static ClusterInfo> {
        BY_NAME.get(name).copied()
    }

    pub fn name_of(cluster_id: u16) -> Option<&'static str> {
        Self::get(cluster_id).map(|c| c.name)
    }

    pub fn id_of(name: &str) -> Option<u16> {
        Self::by_name(name).map(|c| c.id)
    }

    /// Vendor tag of a known private cluster.
    pub fn vendor_of(cluster_id: u16) -> Option<&'static str> {
        Self::get(cluster_id).and_then(|c| c.vendor)
    }

    /// Number of catalogued clusters.
    pub fn len() -> usize {
        CLUSTERS.len()
    }

    /// Iterate over every catalog entry.
    pub fn iter() -> impl Iterator<Item = &'static ClusterInfo> {
        CLUSTERS.iter()
    }
}
