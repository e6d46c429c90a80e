//! Capability mapping.
//!
//! Decoded datapoints and standard-cluster attribute reports are turned
//! into [`CapabilityUpdate`]s here, and [`CapabilityMapper::apply`] is the
//! only place a session writes to its capability store.

use std::collections::BTreeMap;

use meshbridge_core::catalog::id as cluster;
use meshbridge_core::config::{DatapointRule, DatapointTransform, MapperConfig, TemperatureScaling};
use meshbridge_core::{
    Datapoint, DatapointType, DatapointValue, EncodingError, EventSink, MeshEvent,
};
use meshbridge_core::AttributeValue;
use tracing::{debug, warn};

use crate::capabilities::{names, CapabilityStore, CapabilityUpdate, CapabilityWriteError};

/// Datapoint id to capability rules plus the temperature strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicTable {
    rules: BTreeMap<u8, DatapointRule>,
    temperature: TemperatureScaling,
}

impl Default for HeuristicTable {
    fn default() -> Self {
        Self::defaults()
    }
}

impl HeuristicTable {
    /// Built-in table.
    pub fn defaults() -> Self {
        use DatapointTransform::*;

        let mut rules = BTreeMap::new();
        let mut add = |id: u8, capability: &str, transform: DatapointTransform| {
            rules.insert(id, DatapointRule::new(id, capability, transform));
        };

        add(1, names::ONOFF, Boolean);
        add(2, names::DIM, Fraction255);
        add(4, names::MEASURE_BATTERY, Percent);
        add(15, names::MEASURE_BATTERY, Percent);
        for id in [5, 24, 102] {
            add(id, names::MEASURE_TEMPERATURE, Temperature);
        }
        for id in [6, 103, 109] {
            add(id, names::MEASURE_HUMIDITY, Direct);
        }
        // Power-metering band
        add(17, names::METER_POWER, Divide { divisor: 100.0 });
        add(18, names::MEASURE_CURRENT, Divide { divisor: 1000.0 });
        add(19, names::MEASURE_POWER, Divide { divisor: 10.0 });
        add(20, names::MEASURE_VOLTAGE, Divide { divisor: 10.0 });

        Self {
            rules,
            temperature: TemperatureScaling::default(),
        }
    }

    /// Built-in table with configured overrides applied.
    pub fn from_config(config: &MapperConfig) -> Self {
        let mut table = Self::defaults();
        table.temperature = config.temperature;
        for rule in &config.datapoints {
            table.rules.insert(rule.id, rule.clone());
        }
        table
    }

    pub fn rule(&self, id: u8) -> Option<&DatapointRule> {
        self.rules.get(&id)
    }

    pub fn rules(&self) -> impl Iterator<Item = &DatapointRule> {
        self.rules.values()
    }

    pub fn temperature(&self) -> TemperatureScaling {
        self.temperature
    }

    /// Capability a datapoint id maps to, if any.
    pub fn capability_of(&self, id: u8) -> Option<&str> {
        self.rule(id).map(|r| r.capability.as_str())
    }

    /// Map a decoded datapoint; `None` if no rule covers it or the value
    /// does not fit the rule.
    pub fn map_datapoint(&self, dp: &Datapoint) -> Option<CapabilityUpdate> {
        let rule = self.rule(dp.id)?;
        let value = self.transform(&rule.transform, &dp.value)?;
        Some(CapabilityUpdate::new(rule.capability.clone(), value))
    }

    fn transform(&self, transform: &DatapointTransform, value: &DatapointValue) -> Option<AttributeValue> {
        let raw = value.as_i64()?;
        let mapped = match transform {
            DatapointTransform::Boolean => AttributeValue::Boolean(raw != 0),
            DatapointTransform::Direct => AttributeValue::Float(raw as f64),
            DatapointTransform::Divide { divisor } => AttributeValue::Float(raw as f64 / divisor),
            DatapointTransform::Fraction255 => {
                AttributeValue::Float(raw.clamp(0, 255) as f64 / 255.0)
            }
            DatapointTransform::Percent => AttributeValue::Float(raw.clamp(0, 100) as f64),
            DatapointTransform::Temperature => AttributeValue::Float(self.temperature.scale(raw)),
        };
        Some(mapped)
    }

    /// Build the datapoint that sets `capability` to `value`.
    ///
    /// Returns `None` when no rule targets the capability.
    pub fn encode_capability(
        &self,
        capability: &str,
        value: &AttributeValue,
    ) -> Option<Result<Datapoint, EncodingError>> {
        let rule = self.rules().find(|r| r.capability == capability)?;
        let (data_type, raw) = match &rule.transform {
            DatapointTransform::Boolean => match value.as_bool() {
                Some(on) => (DatapointType::Bool, serde_json::Value::Bool(on)),
                None => return Some(Err(mismatch(DatapointType::Bool, value))),
            },
            transform => {
                let v = match value.as_f64() {
                    Some(v) if v.is_finite() => v,
                    Some(_) => {
                        return Some(Err(EncodingError::TypeMismatch {
                            data_type: DatapointType::Value,
                            found: "non-finite float",
                        }))
                    }
                    None => return Some(Err(mismatch(DatapointType::Value, value))),
                };
                let raw = match transform {
                    DatapointTransform::Divide { divisor } => v * divisor,
                    DatapointTransform::Fraction255 => v.clamp(0.0, 1.0) * 255.0,
                    DatapointTransform::Temperature => match self.temperature {
                        TemperatureScaling::Hundredths => v * 100.0,
                        TemperatureScaling::Direct => v,
                        TemperatureScaling::Auto | TemperatureScaling::Tenths => v * 10.0,
                    },
                    _ => v,
                };
                (DatapointType::Value, serde_json::Value::from(raw.round() as i64))
            }
        };
        Some(Datapoint::from_json(rule.id, data_type, &raw))
    }
}

fn mismatch(data_type: DatapointType, value: &AttributeValue) -> EncodingError {
    EncodingError::TypeMismatch {
        data_type,
        found: value.type_name(),
    }
}

/// Result of mapping a standard-cluster attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeMapping {
    Mapped(CapabilityUpdate),
    /// No rule covers this attribute.
    Unmapped,
    /// Consumed by another component, or an invalid-measurement sentinel.
    Ignored,
}

fn scaled(value: &AttributeValue, divisor: f64) -> Option<AttributeValue> {
    value.as_f64().map(|v| AttributeValue::Float(v / divisor))
}

/// Illuminance in lux from the logarithmic measured value.
pub fn illuminance_lux(measured: f64) -> f64 {
    if measured <= 0.0 {
        0.0
    } else {
        10f64.powf((measured - 1.0) / 10000.0)
    }
}

/// Map a standard-cluster attribute report.
pub fn map_attribute(cluster_id: u16, attribute: u16, value: &AttributeValue) -> AttributeMapping {
    let mapped = match (cluster_id, attribute) {
        // Handled by the power model, the zone state machine and the time responder
        (cluster::BASIC, _) | (cluster::IAS_ZONE, _) | (cluster::TIME, _) => {
            return AttributeMapping::Ignored
        }

        (cluster::ON_OFF, 0x0000) => value
            .as_bool()
            .map(|on| (names::ONOFF, AttributeValue::Boolean(on))),
        (cluster::LEVEL_CONTROL, 0x0000) => value
            .as_f64()
            .map(|v| (names::DIM, AttributeValue::Float((v / 254.0).clamp(0.0, 1.0)))),

        (cluster::TEMPERATURE_MEASUREMENT, 0x0000) | (cluster::THERMOSTAT, 0x0000) => {
            if value.as_i64() == Some(-0x8000) {
                return AttributeMapping::Ignored;
            }
            scaled(value, 100.0).map(|v| (names::MEASURE_TEMPERATURE, v))
        }
        (cluster::THERMOSTAT, 0x0012) => {
            scaled(value, 100.0).map(|v| (names::TARGET_TEMPERATURE, v))
        }
        (cluster::HUMIDITY_MEASUREMENT, 0x0000) => {
            if value.as_i64() == Some(0xFFFF) {
                return AttributeMapping::Ignored;
            }
            scaled(value, 100.0).map(|v| (names::MEASURE_HUMIDITY, v))
        }
        (cluster::PRESSURE_MEASUREMENT, 0x0000) => {
            scaled(value, 1.0).map(|v| (names::MEASURE_PRESSURE, v))
        }
        (cluster::ILLUMINANCE_MEASUREMENT, 0x0000) => value
            .as_f64()
            .map(|v| (names::MEASURE_LUMINANCE, AttributeValue::Float(illuminance_lux(v)))),
        (cluster::OCCUPANCY_SENSING, 0x0000) => value
            .as_i64()
            .map(|v| (names::ALARM_MOTION, AttributeValue::Boolean(v & 0x01 != 0))),

        (cluster::POWER_CONFIG, 0x0021) => {
            if value.as_i64() == Some(0xFF) {
                return AttributeMapping::Ignored;
            }
            value.as_f64().map(|v| {
                (
                    names::MEASURE_BATTERY,
                    AttributeValue::Float((v / 2.0).clamp(0.0, 100.0)),
                )
            })
        }
        (cluster::POWER_CONFIG, 0x0020) => {
            scaled(value, 10.0).map(|v| (names::MEASURE_VOLTAGE, v))
        }

        (cluster::METERING, 0x0000) => scaled(value, 1000.0).map(|v| (names::METER_POWER, v)),
        (cluster::ELECTRICAL_MEASUREMENT, 0x050B) => {
            scaled(value, 1.0).map(|v| (names::MEASURE_POWER, v))
        }
        (cluster::ELECTRICAL_MEASUREMENT, 0x0505) => {
            scaled(value, 1.0).map(|v| (names::MEASURE_VOLTAGE, v))
        }
        (cluster::ELECTRICAL_MEASUREMENT, 0x0508) => {
            scaled(value, 1000.0).map(|v| (names::MEASURE_CURRENT, v))
        }

        (cluster::WINDOW_COVERING, 0x0008) => {
            scaled(value, 100.0).map(|v| (names::WINDOWCOVERINGS_SET, v))
        }
        (cluster::DOOR_LOCK, 0x0000) => value
            .as_i64()
            .map(|v| (names::LOCKED, AttributeValue::Boolean(v == 1))),
        (cluster::COLOR_CONTROL, 0x0000) => scaled(value, 254.0).map(|v| (names::LIGHT_HUE, v)),
        (cluster::COLOR_CONTROL, 0x0001) => {
            scaled(value, 254.0).map(|v| (names::LIGHT_SATURATION, v))
        }

        _ => None,
    };

    match mapped {
        Some((capability, value)) => AttributeMapping::Mapped(CapabilityUpdate::new(capability, value)),
        None => AttributeMapping::Unmapped,
    }
}

/// Outcome of one [`CapabilityMapper::apply`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub granted: Vec<String>,
    pub changed: Vec<String>,
    pub failed: Vec<(String, CapabilityWriteError)>,
}

impl ApplyReport {
    pub fn is_noop(&self) -> bool {
        self.granted.is_empty() && self.changed.is_empty() && self.failed.is_empty()
    }
}

/// Applies capability updates to a store.
#[derive(Debug, Clone, Default)]
pub struct CapabilityMapper {
    table: HeuristicTable,
}

impl CapabilityMapper {
    pub fn new(table: HeuristicTable) -> Self {
        Self { table }
    }

    pub fn from_config(config: &MapperConfig) -> Self {
        Self::new(HeuristicTable::from_config(config))
    }

    pub fn table(&self) -> &HeuristicTable {
        &self.table
    }

    /// Grant and write each update in order.
    ///
    /// A refused write is logged and recorded; the remaining updates still
    /// apply.
    pub fn apply<S>(
        &self,
        device_id: &str,
        store: &mut S,
        updates: Vec<CapabilityUpdate>,
        sink: &dyn EventSink,
    ) -> ApplyReport
    where
        S: CapabilityStore + ?Sized,
    {
        let mut report = ApplyReport::default();
        let now = chrono::Utc::now().timestamp();

        for update in updates {
            if store.grant_capability(&update.capability) {
                debug!(
                    category = "capability",
                    device_id = %device_id,
                    capability = %update.capability,
                    "Capability granted"
                );
                sink.emit(MeshEvent::CapabilityGranted {
                    device_id: device_id.to_string(),
                    capability: update.capability.clone(),
                    timestamp: now,
                });
                report.granted.push(update.capability.clone());
            }

            match store.set_capability_value(&update.capability, update.value.clone()) {
                Ok(true) => {
                    sink.emit(MeshEvent::CapabilityChanged {
                        device_id: device_id.to_string(),
                        capability: update.capability.clone(),
                        value: update.value,
                        timestamp: now,
                    });
                    report.changed.push(update.capability);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        category = "capability",
                        device_id = %device_id,
                        capability = %update.capability,
                        error = %e,
                        "Capability write failed"
                    );
                    report.failed.push((update.capability, e));
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilitySet;
    use meshbridge_core::MemorySink;

    fn float(update: Option<CapabilityUpdate>) -> (String, f64) {
        let update = update.unwrap();
        (update.capability, update.value.as_f64().unwrap())
    }

    #[test]
    fn test_default_datapoint_rules() {
        let table = HeuristicTable::defaults();
        let dp = |id, value| Datapoint::new(id, value);

        let onoff = table.map_datapoint(&dp(1, DatapointValue::Bool(true))).unwrap();
        assert_eq!(onoff, CapabilityUpdate::new(names::ONOFF, true));

        assert_eq!(
            float(table.map_datapoint(&dp(2, DatapointValue::Value(255)))),
            (names::DIM.to_string(), 1.0)
        );
        assert_eq!(
            float(table.map_datapoint(&dp(15, DatapointValue::Value(130)))),
            (names::MEASURE_BATTERY.to_string(), 100.0)
        );
        assert_eq!(
            float(table.map_datapoint(&dp(102, DatapointValue::Value(2500)))),
            (names::MEASURE_TEMPERATURE.to_string(), 25.0)
        );
        assert_eq!(
            float(table.map_datapoint(&dp(24, DatapointValue::Value(250)))),
            (names::MEASURE_TEMPERATURE.to_string(), 25.0)
        );
        assert_eq!(
            float(table.map_datapoint(&dp(109, DatapointValue::Value(56)))),
            (names::MEASURE_HUMIDITY.to_string(), 56.0)
        );
        assert_eq!(
            float(table.map_datapoint(&dp(17, DatapointValue::Value(12345)))),
            (names::METER_POWER.to_string(), 123.45)
        );
        assert_eq!(
            float(table.map_datapoint(&dp(18, DatapointValue::Value(1500)))),
            (names::MEASURE_CURRENT.to_string(), 1.5)
        );
        assert_eq!(
            float(table.map_datapoint(&dp(19, DatapointValue::Value(605)))),
            (names::MEASURE_POWER.to_string(), 60.5)
        );
        assert_eq!(
            float(table.map_datapoint(&dp(20, DatapointValue::Value(2301)))),
            (names::MEASURE_VOLTAGE.to_string(), 230.1)
        );
    }

    #[test]
    fn test_unmapped_datapoints() {
        let table = HeuristicTable::defaults();
        assert!(table
            .map_datapoint(&Datapoint::new(101, DatapointValue::Value(3)))
            .is_none());
        // String payload on a numeric rule
        assert!(table
            .map_datapoint(&Datapoint::new(102, DatapointValue::String("x".into())))
            .is_none());
    }

    #[test]
    fn test_config_overrides() {
        let config = MapperConfig {
            temperature: TemperatureScaling::Hundredths,
            datapoints: vec![DatapointRule::new(
                4,
                names::TARGET_TEMPERATURE,
                DatapointTransform::Divide { divisor: 10.0 },
            )],
        };
        let table = HeuristicTable::from_config(&config);
        assert_eq!(table.capability_of(4), Some(names::TARGET_TEMPERATURE));
        assert_eq!(table.capability_of(15), Some(names::MEASURE_BATTERY));
        assert_eq!(
            float(table.map_datapoint(&Datapoint::new(5, DatapointValue::Value(250)))),
            (names::MEASURE_TEMPERATURE.to_string(), 2.5)
        );
    }

    #[test]
    fn test_encode_capability() {
        let table = HeuristicTable::defaults();
        let dp = table
            .encode_capability(names::ONOFF, &AttributeValue::Boolean(true))
            .unwrap()
            .unwrap();
        assert_eq!(dp, Datapoint::new(1, DatapointValue::Bool(true)));

        let dp = table
            .encode_capability(names::DIM, &AttributeValue::Float(0.5))
            .unwrap()
            .unwrap();
        assert_eq!(dp, Datapoint::new(2, DatapointValue::Value(128)));

        assert!(table
            .encode_capability(names::LOCKED, &AttributeValue::Boolean(true))
            .is_none());
    }

    #[test]
    fn test_encode_capability_rejects_wrong_types() {
        let table = HeuristicTable::defaults();

        let err = table
            .encode_capability(names::ONOFF, &AttributeValue::String("garbage".into()))
            .unwrap()
            .unwrap_err();
        assert_eq!(
            err,
            EncodingError::TypeMismatch {
                data_type: DatapointType::Bool,
                found: "string",
            }
        );

        let err = table
            .encode_capability(names::DIM, &AttributeValue::String("half".into()))
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, EncodingError::TypeMismatch { found: "string", .. }));

        for bad in [f64::NAN, f64::INFINITY] {
            assert!(table
                .encode_capability(names::MEASURE_TEMPERATURE, &AttributeValue::Float(bad))
                .unwrap()
                .is_err());
        }
    }

    #[test]
    fn test_standard_attributes() {
        let lux = map_attribute(cluster::ILLUMINANCE_MEASUREMENT, 0, &AttributeValue::Integer(10001));
        assert_eq!(
            lux,
            AttributeMapping::Mapped(CapabilityUpdate::new(names::MEASURE_LUMINANCE, 10.0))
        );
        assert_eq!(illuminance_lux(0.0), 0.0);

        assert_eq!(
            map_attribute(cluster::TEMPERATURE_MEASUREMENT, 0, &AttributeValue::Integer(2150)),
            AttributeMapping::Mapped(CapabilityUpdate::new(names::MEASURE_TEMPERATURE, 21.5))
        );
        assert_eq!(
            map_attribute(cluster::LEVEL_CONTROL, 0, &AttributeValue::Integer(254)),
            AttributeMapping::Mapped(CapabilityUpdate::new(names::DIM, 1.0))
        );
        assert_eq!(
            map_attribute(cluster::POWER_CONFIG, 0x0021, &AttributeValue::Integer(200)),
            AttributeMapping::Mapped(CapabilityUpdate::new(names::MEASURE_BATTERY, 100.0))
        );
        assert_eq!(
            map_attribute(cluster::OCCUPANCY_SENSING, 0, &AttributeValue::Integer(0b11)),
            AttributeMapping::Mapped(CapabilityUpdate::new(names::ALARM_MOTION, true))
        );
        assert_eq!(
            map_attribute(cluster::DOOR_LOCK, 0, &AttributeValue::Integer(2)),
            AttributeMapping::Mapped(CapabilityUpdate::new(names::LOCKED, false))
        );
        assert_eq!(
            map_attribute(cluster::THERMOSTAT, 0x0012, &AttributeValue::Integer(2100)),
            AttributeMapping::Mapped(CapabilityUpdate::new(names::TARGET_TEMPERATURE, 21.0))
        );
    }

    #[test]
    fn test_unmapped_and_ignored_attributes() {
        assert_eq!(
            map_attribute(cluster::ON_OFF, 0x4003, &AttributeValue::Integer(1)),
            AttributeMapping::Unmapped
        );
        assert_eq!(
            map_attribute(cluster::BASIC, 0x0007, &AttributeValue::Integer(1)),
            AttributeMapping::Ignored
        );
        assert_eq!(
            map_attribute(cluster::TEMPERATURE_MEASUREMENT, 0, &AttributeValue::Integer(-0x8000)),
            AttributeMapping::Ignored
        );
    }

    #[test]
    fn test_apply_grants_before_write_and_dedups() {
        let mapper = CapabilityMapper::default();
        let mut store = CapabilitySet::new();
        let sink = MemorySink::new();

        let updates = vec![
            CapabilityUpdate::new(names::ONOFF, true),
            CapabilityUpdate::new(names::ONOFF, true),
        ];
        let report = mapper.apply("dev1", &mut store, updates, &sink);
        assert_eq!(report.granted, vec![names::ONOFF.to_string()]);
        assert_eq!(report.changed, vec![names::ONOFF.to_string()]);

        let emitted: Vec<_> = sink.events().iter().map(|e| e.name()).collect();
        assert_eq!(emitted, vec!["capability_granted", "capability_changed"]);

        let report = mapper.apply(
            "dev1",
            &mut store,
            vec![CapabilityUpdate::new(names::ONOFF, true)],
            &sink,
        );
        assert!(report.is_noop());
    }

    struct RejectingStore {
        inner: CapabilitySet,
    }

    impl CapabilityStore for RejectingStore {
        fn grant_capability(&mut self, name: &str) -> bool {
            self.inner.grant_capability(name)
        }
        fn has_capability(&self, name: &str) -> bool {
            self.inner.has_capability(name)
        }
        fn set_capability_value(
            &mut self,
            name: &str,
            value: AttributeValue,
        ) -> Result<bool, CapabilityWriteError> {
            if name == names::DIM {
                return Err(CapabilityWriteError::Rejected {
                    capability: name.to_string(),
                    reason: "read only".to_string(),
                });
            }
            self.inner.set_capability_value(name, value)
        }
        fn capability_value(&self, name: &str) -> Option<AttributeValue> {
            self.inner.capability_value(name)
        }
        fn capabilities(&self) -> Vec<String> {
            self.inner.capabilities()
        }
    }

    #[test]
    fn test_failed_write_does_not_stop_the_rest() {
        let mapper = CapabilityMapper::default();
        let mut store = RejectingStore {
            inner: CapabilitySet::new(),
        };
        let sink = MemorySink::new();
        let report = mapper.apply(
            "dev1",
            &mut store,
            vec![
                CapabilityUpdate::new(names::DIM, 0.5),
                CapabilityUpdate::new(names::ONOFF, true),
            ],
            &sink,
        );
        assert_eq!(report.failed.len(), 1);
        assert_eq!(store.capability_value(names::ONOFF), Some(AttributeValue::Boolean(true)));
    }
}
