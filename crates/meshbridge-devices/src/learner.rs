//! Profile learner.
//!
//! Passively records the traffic a device produces and, on request, turns
//! it into a best-guess profile: a device class, the capabilities it
//! probably has and a hint per datapoint. Nothing here affects the live
//! capability set; the learned profile is a suggestion for bootstrapping
//! support of unknown devices.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use meshbridge_core::catalog::id as cluster;
use meshbridge_core::config::defaults;
use meshbridge_core::{AttributeValue, Decoded, DatapointType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::capabilities::names;
use crate::mapper::HeuristicTable;

/// Datapoint ids of the power-metering band.
pub const METERING_BAND: std::ops::RangeInclusive<u8> = 17..=20;

/// Recent values and statistics of one datapoint id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatapointHistoryEntry {
    pub id: u8,
    /// Type tag of the latest observation
    pub tag: u8,
    recent: VecDeque<AttributeValue>,
    limit: usize,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl DatapointHistoryEntry {
    fn new(id: u8, tag: u8, limit: usize, at: DateTime<Utc>) -> Self {
        Self {
            id,
            tag,
            recent: VecDeque::with_capacity(limit),
            limit: limit.max(1),
            count: 0,
            first_seen: at,
            last_seen: at,
            min: None,
            max: None,
        }
    }

    fn record(&mut self, value: AttributeValue, tag: u8, at: DateTime<Utc>) {
        if let Some(v) = value.as_f64() {
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
        while self.recent.len() >= self.limit {
            self.recent.pop_front();
        }
        self.recent.push_back(value);
        self.tag = tag;
        self.count += 1;
        if at < self.first_seen {
            self.first_seen = at;
        }
        if at > self.last_seen {
            self.last_seen = at;
        }
    }

    /// Retained values, oldest first.
    pub fn recent_values(&self) -> impl Iterator<Item = &AttributeValue> {
        self.recent.iter()
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    /// What the observed values look like.
    pub fn value_kind(&self) -> ValueKind {
        match DatapointType::from_tag(self.tag) {
            Some(DatapointType::Bool) => return ValueKind::Boolean,
            Some(DatapointType::String) => return ValueKind::Text,
            Some(DatapointType::Raw) | None => return ValueKind::Opaque,
            _ => {}
        }

        let binary = self
            .recent
            .iter()
            .all(|v| matches!(v.as_i64(), Some(0) | Some(1)));
        let (Some(min), Some(max)) = (self.min, self.max) else {
            return ValueKind::Opaque;
        };

        if binary {
            ValueKind::Boolean
        } else if METERING_BAND.contains(&self.id) {
            ValueKind::Power
        } else if min >= 0.0 && max <= 100.0 {
            ValueKind::Percentage
        } else if min >= -400.0 && max <= 800.0 {
            // Raw tenths of a degree
            ValueKind::Temperature
        } else if min >= 0.0 && max <= 100_000.0 {
            ValueKind::Luminance
        } else {
            ValueKind::Numeric
        }
    }
}

/// Inferred shape of a datapoint's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Boolean,
    Percentage,
    Temperature,
    Luminance,
    Power,
    Numeric,
    Text,
    Opaque,
}

/// Coarse device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    EnvironmentalSensor,
    LightDimmer,
    SmartPlug,
    Other,
}

impl DeviceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EnvironmentalSensor => "environmental_sensor",
            Self::LightDimmer => "light_dimmer",
            Self::SmartPlug => "smart_plug",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`ProfileLearner::classify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub class: DeviceClass,
    /// Why the device could not be classified more precisely
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Mapping hint for one observed datapoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatapointHint {
    pub id: u8,
    pub tag: u8,
    pub kind: ValueKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    pub samples: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// Best-guess profile of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedProfile {
    pub identifier: String,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub device_class: DeviceClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub capabilities: Vec<String>,
    pub clusters: Vec<u16>,
    pub datapoints: Vec<DatapointHint>,
    pub learned_at: DateTime<Utc>,
}

/// Signal families seen so far.
#[derive(Debug, Default, Clone, Copy)]
struct Signals {
    temperature: bool,
    humidity: bool,
    onoff: bool,
    level: bool,
    metering: bool,
}

/// Lower-case, with every non-alphanumeric replaced by `_`.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// `<vendor>_<model>_<8 hex>`; the hash keeps ids distinct when two
/// identities sanitize to the same text.
pub fn profile_identifier(vendor: Option<&str>, model: Option<&str>) -> String {
    let vendor = vendor.unwrap_or("unknown");
    let model = model.unwrap_or("unknown");
    let mut hasher = Sha256::new();
    hasher.update(vendor.as_bytes());
    hasher.update([0u8]);
    hasher.update(model.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}_{}_{}", sanitize(vendor), sanitize(model), &digest[..8])
}

/// Capability implied by standard-cluster traffic.
fn cluster_capability(cluster_id: u16, attribute: u16) -> Option<&'static str> {
    let cap = match (cluster_id, attribute) {
        (cluster::ON_OFF, _) => names::ONOFF,
        (cluster::LEVEL_CONTROL, _) => names::DIM,
        (cluster::TEMPERATURE_MEASUREMENT, _) => names::MEASURE_TEMPERATURE,
        (cluster::HUMIDITY_MEASUREMENT, _) => names::MEASURE_HUMIDITY,
        (cluster::PRESSURE_MEASUREMENT, _) => names::MEASURE_PRESSURE,
        (cluster::ILLUMINANCE_MEASUREMENT, _) => names::MEASURE_LUMINANCE,
        (cluster::OCCUPANCY_SENSING, _) => names::ALARM_MOTION,
        (cluster::METERING, _) => names::METER_POWER,
        (cluster::ELECTRICAL_MEASUREMENT, _) => names::MEASURE_POWER,
        (cluster::WINDOW_COVERING, _) => names::WINDOWCOVERINGS_SET,
        (cluster::DOOR_LOCK, _) => names::LOCKED,
        (cluster::COLOR_CONTROL, _) => names::LIGHT_HUE,
        (cluster::THERMOSTAT, 0x0012) => names::TARGET_TEMPERATURE,
        (cluster::THERMOSTAT, _) => names::MEASURE_TEMPERATURE,
        // Only the percentage attribute says a battery is there
        (cluster::POWER_CONFIG, 0x0021) => names::MEASURE_BATTERY,
        _ => return None,
    };
    Some(cap)
}

/// Accumulates observed traffic of one device.
#[derive(Debug, Clone)]
pub struct ProfileLearner {
    vendor: Option<String>,
    model: Option<String>,
    history_limit: usize,
    table: HeuristicTable,
    datapoints: BTreeMap<u8, DatapointHistoryEntry>,
    clusters: BTreeMap<u16, BTreeSet<u16>>,
}

impl Default for ProfileLearner {
    fn default() -> Self {
        Self::new(defaults::HISTORY_LIMIT)
    }
}

impl ProfileLearner {
    pub fn new(history_limit: usize) -> Self {
        Self {
            vendor: None,
            model: None,
            history_limit: history_limit.max(1),
            table: HeuristicTable::defaults(),
            datapoints: BTreeMap::new(),
            clusters: BTreeMap::new(),
        }
    }

    /// Use a custom datapoint table for capability hints.
    pub fn with_table(mut self, table: HeuristicTable) -> Self {
        self.table = table;
        self
    }

    pub fn set_identity(&mut self, vendor: Option<String>, model: Option<String>) {
        if vendor.is_some() {
            self.vendor = vendor;
        }
        if model.is_some() {
            self.model = model;
        }
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Record one datapoint value.
    pub fn observe(&mut self, id: u8, value: AttributeValue, tag: u8, at: DateTime<Utc>) {
        let limit = self.history_limit;
        let entry = self
            .datapoints
            .entry(id)
            .or_insert_with(|| DatapointHistoryEntry::new(id, tag, limit, at));
        entry.record(value, tag, at);
        trace!(
            category = "learner",
            dp = id,
            tag,
            samples = entry.count,
            "Datapoint observed"
        );
    }

    /// Record a decoded datapoint, recognized or not.
    pub fn observe_decoded(&mut self, decoded: &Decoded, at: DateTime<Utc>) {
        match decoded {
            Decoded::Recognized(dp) => {
                self.observe(dp.id, dp.value.to_attribute_value(), dp.data_type().tag(), at)
            }
            Decoded::Unrecognized(raw) => {
                self.observe(raw.id, AttributeValue::Binary(raw.raw.clone()), raw.tag, at)
            }
        }
    }

    /// Record standard-cluster traffic.
    pub fn observe_cluster(&mut self, cluster_id: u16, attribute: u16) {
        self.clusters.entry(cluster_id).or_default().insert(attribute);
    }

    /// Record that a cluster carried a command. The cluster is listed in the
    /// profile but adds no signal family on its own.
    pub fn observe_cluster_command(&mut self, cluster_id: u16) {
        self.clusters.entry(cluster_id).or_default();
    }

    pub fn history(&self, id: u8) -> Option<&DatapointHistoryEntry> {
        self.datapoints.get(&id)
    }

    pub fn datapoint_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.datapoints.keys().copied()
    }

    pub fn observed_clusters(&self) -> impl Iterator<Item = u16> + '_ {
        self.clusters.keys().copied()
    }

    /// Capability a datapoint probably drives.
    fn datapoint_capability(&self, entry: &DatapointHistoryEntry) -> Option<String> {
        if let Some(cap) = self.table.capability_of(entry.id) {
            return Some(cap.to_string());
        }
        match entry.value_kind() {
            ValueKind::Temperature => Some(names::MEASURE_TEMPERATURE.to_string()),
            ValueKind::Luminance if entry.max.unwrap_or(0.0) > 100.0 => {
                Some(names::MEASURE_LUMINANCE.to_string())
            }
            _ => None,
        }
    }

    fn signals(&self) -> Signals {
        let mut signals = Signals::default();
        let mut note = |cap: &str| match cap {
            names::MEASURE_TEMPERATURE => signals.temperature = true,
            names::MEASURE_HUMIDITY => signals.humidity = true,
            names::ONOFF => signals.onoff = true,
            names::DIM => signals.level = true,
            names::METER_POWER | names::MEASURE_POWER | names::MEASURE_CURRENT
            | names::MEASURE_VOLTAGE => signals.metering = true,
            _ => {}
        };

        for entry in self.datapoints.values() {
            if let Some(cap) = self.datapoint_capability(entry) {
                note(&cap);
            }
        }
        for (cluster_id, attributes) in &self.clusters {
            for attribute in attributes {
                if let Some(cap) = cluster_capability(*cluster_id, *attribute) {
                    note(cap);
                }
            }
        }
        signals
    }

    /// Classify from the signal families seen so far.
    ///
    /// Never fails: ambiguous traffic yields [`DeviceClass::Other`] with a
    /// reason.
    pub fn classify(&self) -> Classification {
        let s = self.signals();

        let class = if s.temperature && s.humidity && !s.onoff {
            DeviceClass::EnvironmentalSensor
        } else if s.onoff && s.level {
            DeviceClass::LightDimmer
        } else if s.onoff && s.metering {
            DeviceClass::SmartPlug
        } else {
            let reason = if self.datapoints.is_empty() && self.clusters.is_empty() {
                "no traffic observed"
            } else if s.onoff {
                "on/off without level or metering signals"
            } else if s.temperature != s.humidity {
                "only one of temperature and humidity observed"
            } else if s.level || s.metering {
                "level or metering signals without on/off"
            } else {
                "no known signal family observed"
            };
            return Classification {
                class: DeviceClass::Other,
                reason: Some(reason.to_string()),
            };
        };

        Classification {
            class,
            reason: None,
        }
    }

    /// Build the learned profile from everything observed so far.
    pub fn synthesize_profile(&self) -> LearnedProfile {
        let classification = self.classify();

        let mut capabilities = BTreeSet::new();
        let datapoints: Vec<DatapointHint> = self
            .datapoints
            .values()
            .map(|entry| {
                let capability = self.datapoint_capability(entry);
                if let Some(cap) = &capability {
                    capabilities.insert(cap.clone());
                }
                DatapointHint {
                    id: entry.id,
                    tag: entry.tag,
                    kind: entry.value_kind(),
                    capability,
                    samples: entry.count,
                    min: entry.min,
                    max: entry.max,
                }
            })
            .collect();

        for (cluster_id, attributes) in &self.clusters {
            for attribute in attributes {
                if let Some(cap) = cluster_capability(*cluster_id, *attribute) {
                    capabilities.insert(cap.to_string());
                }
            }
        }

        let profile = LearnedProfile {
            identifier: profile_identifier(self.vendor.as_deref(), self.model.as_deref()),
            vendor: self.vendor.clone(),
            model: self.model.clone(),
            device_class: classification.class,
            reason: classification.reason,
            capabilities: capabilities.into_iter().collect(),
            clusters: self.clusters.keys().copied().collect(),
            datapoints,
            learned_at: Utc::now(),
        };
        debug!(
            category = "learner",
            identifier = %profile.identifier,
            class = %profile.device_class,
            capabilities = profile.capabilities.len(),
            "Profile synthesized"
        );
        profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn int(v: i64) -> AttributeValue {
        AttributeValue::Integer(v)
    }

    #[test]
    fn test_history_is_bounded_fifo() {
        let mut learner = ProfileLearner::new(10);
        let start = Utc::now();
        for i in 0..15 {
            learner.observe(101, int(i), DatapointType::Value.tag(), start + Duration::seconds(i));
        }
        let entry = learner.history(101).unwrap();
        let kept: Vec<i64> = entry.recent_values().filter_map(|v| v.as_i64()).collect();
        assert_eq!(kept, (5..15).collect::<Vec<_>>());
        assert_eq!(entry.count, 15);
        assert_eq!(entry.min, Some(0.0));
        assert_eq!(entry.max, Some(14.0));
        assert_eq!(entry.first_seen, start);
        assert_eq!(entry.last_seen, start + Duration::seconds(14));
    }

    #[test]
    fn test_environmental_sensor() {
        let mut learner = ProfileLearner::default();
        let now = Utc::now();
        learner.observe(102, int(215), 2, now);
        learner.observe(103, int(48), 2, now);
        assert_eq!(learner.classify().class, DeviceClass::EnvironmentalSensor);
    }

    #[test]
    fn test_standard_clusters_count() {
        let mut learner = ProfileLearner::default();
        learner.observe_cluster(cluster::ON_OFF, 0);
        learner.observe_cluster(cluster::LEVEL_CONTROL, 0);
        assert_eq!(learner.classify().class, DeviceClass::LightDimmer);

        let mut learner = ProfileLearner::default();
        learner.observe(1, AttributeValue::Boolean(true), 1, Utc::now());
        learner.observe_cluster(cluster::METERING, 0);
        assert_eq!(learner.classify().class, DeviceClass::SmartPlug);
    }

    #[test]
    fn test_ambiguous_is_other_with_reason() {
        let learner = ProfileLearner::default();
        let c = learner.classify();
        assert_eq!(c.class, DeviceClass::Other);
        assert_eq!(c.reason.as_deref(), Some("no traffic observed"));

        let mut learner = ProfileLearner::default();
        learner.observe(1, AttributeValue::Boolean(true), 1, Utc::now());
        let c = learner.classify();
        assert_eq!(c.class, DeviceClass::Other);
        assert!(c.reason.unwrap().contains("on/off"));
    }

    #[test]
    fn test_value_kinds() {
        let mut learner = ProfileLearner::default();
        let now = Utc::now();
        for v in [0, 1, 1, 0] {
            learner.observe(50, int(v), 2, now);
        }
        for v in [12, 88] {
            learner.observe(51, int(v), 2, now);
        }
        for v in [-55, 310] {
            learner.observe(52, int(v), 2, now);
        }
        for v in [900, 45000] {
            learner.observe(53, int(v), 2, now);
        }
        learner.observe(19, int(605), 2, now);
        learner.observe(54, AttributeValue::String("v1.2".into()), 3, now);
        learner.observe(55, AttributeValue::Binary(vec![1, 2]), 9, now);

        let kind = |id| learner.history(id).unwrap().value_kind();
        assert_eq!(kind(50), ValueKind::Boolean);
        assert_eq!(kind(51), ValueKind::Percentage);
        assert_eq!(kind(52), ValueKind::Temperature);
        assert_eq!(kind(53), ValueKind::Luminance);
        assert_eq!(kind(19), ValueKind::Power);
        assert_eq!(kind(54), ValueKind::Text);
        assert_eq!(kind(55), ValueKind::Opaque);
    }

    #[test]
    fn test_synthesized_profile() {
        let mut learner = ProfileLearner::default();
        learner.set_identity(Some("_TZE200 bjawzodf".into()), Some("TS0601".into()));
        let now = Utc::now();
        learner.observe(102, int(215), 2, now);
        learner.observe(103, int(48), 2, now);
        learner.observe_cluster(cluster::BASIC, 0x0005);

        let profile = learner.synthesize_profile();
        assert!(profile.identifier.starts_with("_tze200_bjawzodf_ts0601_"));
        assert_eq!(profile.identifier.len(), "_tze200_bjawzodf_ts0601_".len() + 8);
        assert_eq!(profile.device_class, DeviceClass::EnvironmentalSensor);
        assert_eq!(
            profile.capabilities,
            vec!["measure_humidity".to_string(), "measure_temperature".to_string()]
        );
        assert_eq!(profile.clusters, vec![cluster::BASIC]);
        assert_eq!(profile.datapoints.len(), 2);
        assert_eq!(profile.datapoints[0].kind, ValueKind::Temperature);
    }

    #[test]
    fn test_identifier_disambiguates() {
        let a = profile_identifier(Some("a-b"), Some("x"));
        let b = profile_identifier(Some("a_b"), Some("x"));
        assert_ne!(a, b);
        assert!(a.starts_with("a_b_x_"));
        assert_eq!(profile_identifier(None, None).len(), "unknown_unknown_".len() + 8);
    }
}
