//! Per-device session.
//!
//! A [`DeviceSession`] exclusively owns everything known about one device:
//! its profile, capability store, zone states, power model and learner.
//! It performs no I/O. Each inbound message is processed to completion and
//! returns the [`OutboundRequest`]s it needs; transport results come back
//! later through [`DeviceSession::handle_completion`] keyed by
//! [`RequestId`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use meshbridge_core::catalog::{id as cluster, is_private_cluster, ClusterCatalog, Direction};
use meshbridge_core::config::EngineConfig;
use meshbridge_core::time::{self, LocalZone, OffsetProvider, SyncEpoch, TimeResponder};
use meshbridge_core::{
    capability_err, detect, AttributeValue, DatapointFrame, Decoded, DialectSet,
    EndpointDescriptor, EventSink, MeshEvent, Result, SignalSource, TopologySnapshot,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capabilities::{names, CapabilitySet, CapabilityStore, CapabilityUpdate};
use crate::learner::{LearnedProfile, ProfileLearner};
use crate::mapper::{map_attribute, ApplyReport, AttributeMapping, CapabilityMapper};
use crate::power::{DeviceKind, PowerModel, PowerSource, POWER_SOURCE_ATTR};
use crate::transport::{Operation, OperationOutput, TransportResult};
use crate::zone::{self, ZoneOutcome, ZoneRegistry};

/// Basic cluster identity attributes.
pub mod basic_attr {
    pub const MANUFACTURER_NAME: u16 = 0x0004;
    pub const MODEL_ID: u16 = 0x0005;
}

/// Commands of the proprietary datapoint tunnel.
pub mod tunnel_command {
    /// Coordinator sets datapoints.
    pub const DATA_REQUEST: u8 = 0x00;
    /// Device answers a data request.
    pub const DATA_RESPONSE: u8 = 0x01;
    /// Device reports datapoints on its own.
    pub const DATA_REPORT: u8 = 0x02;
}

/// Global read-attributes command, as sent by devices querying the Time cluster.
pub const READ_ATTRIBUTES_COMMAND: u8 = 0x00;

// Payloads in recorded traces are hex strings
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        hex::decode(compact).map_err(serde::de::Error::custom)
    }
}

/// Identifier of an outbound request, unique within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// An operation the host must run against the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub id: RequestId,
    pub operation: Operation,
}

/// Inbound traffic for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Endpoint/cluster snapshot; the first one is first contact.
    Topology { topology: TopologySnapshot },

    /// Attribute report.
    Attribute {
        endpoint: u8,
        cluster: u16,
        attribute: u16,
        value: AttributeValue,
    },

    /// Cluster-specific command, including datapoint tunnel frames.
    Command {
        endpoint: u8,
        cluster: u16,
        command: u8,
        #[serde(with = "hex_bytes")]
        payload: Vec<u8>,
    },

    /// Result of an earlier [`OutboundRequest`].
    #[serde(skip)]
    Completion {
        id: RequestId,
        result: TransportResult<OperationOutput>,
    },
}

/// What the session knows about a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub dialects: DialectSet,
    pub topology: Option<TopologySnapshot>,
    /// Standard and private cluster references per endpoint.
    #[serde(default)]
    pub endpoints: Vec<EndpointDescriptor>,
    pub power: PowerSource,
    pub learned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    ProactiveEnroll { endpoint: u8, attempt: u8 },
    EnrollResponse,
    Read,
    CapabilityWrite,
    TimeSync,
}

#[derive(Debug, Clone)]
struct Pending {
    purpose: Purpose,
    operation: Operation,
}

/// Normalization state of one device.
pub struct DeviceSession<S: CapabilityStore = CapabilitySet> {
    device_id: String,
    profile: DeviceProfile,
    store: S,
    mapper: CapabilityMapper,
    zones: ZoneRegistry,
    power: PowerModel,
    learner: ProfileLearner,
    time: TimeResponder<Arc<dyn OffsetProvider>>,
    sync_epoch: SyncEpoch,
    proactive_retries: u8,
    sink: Arc<dyn EventSink>,
    pending: HashMap<RequestId, Pending>,
    next_request: u64,
    next_seq: u16,
}

impl DeviceSession<CapabilitySet> {
    /// Session with an in-memory capability store.
    pub fn new(device_id: impl Into<String>, config: &EngineConfig, sink: Arc<dyn EventSink>) -> Self {
        Self::with_store(device_id, CapabilitySet::new(), config, sink)
    }
}

impl<S: CapabilityStore> DeviceSession<S> {
    pub fn with_store(
        device_id: impl Into<String>,
        store: S,
        config: &EngineConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let mapper = CapabilityMapper::from_config(&config.mapper);
        let learner =
            ProfileLearner::new(config.learner.history_limit).with_table(mapper.table().clone());
        Self {
            device_id: device_id.into(),
            profile: DeviceProfile::default(),
            store,
            mapper,
            zones: ZoneRegistry::new(config.zone.zone_id_base),
            power: PowerModel::new(DeviceKind::Other, &config.power),
            learner,
            time: TimeResponder::with_zone(Arc::new(LocalZone) as Arc<dyn OffsetProvider>),
            sync_epoch: SyncEpoch::default(),
            proactive_retries: config.zone.proactive_retries,
            sink,
            pending: HashMap::new(),
            next_request: 1,
            next_seq: 0,
        }
    }

    pub fn with_identity(mut self, vendor: Option<String>, model: Option<String>) -> Self {
        self.set_identity(vendor, model);
        self
    }

    pub fn with_time_zone(mut self, zone: impl OffsetProvider + 'static) -> Self {
        self.time = TimeResponder::with_zone(Arc::new(zone) as Arc<dyn OffsetProvider>);
        self
    }

    pub fn with_sync_epoch(mut self, epoch: SyncEpoch) -> Self {
        self.sync_epoch = epoch;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Read-only view of the capability store; writes go through the mapper.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.store.capabilities()
    }

    pub fn zones(&self) -> &ZoneRegistry {
        &self.zones
    }

    pub fn power(&self) -> &PowerModel {
        &self.power
    }

    pub fn learner(&self) -> &ProfileLearner {
        &self.learner
    }

    /// Outbound requests still waiting for a completion.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Process one inbound message.
    pub fn handle(&mut self, event: InboundEvent) -> Vec<OutboundRequest> {
        match event {
            InboundEvent::Topology { topology } => self.handle_topology(topology),
            InboundEvent::Attribute {
                endpoint,
                cluster,
                attribute,
                value,
            } => self.handle_attribute(endpoint, cluster, attribute, value),
            InboundEvent::Command {
                endpoint,
                cluster,
                command,
                payload,
            } => self.handle_command(endpoint, cluster, command, &payload),
            InboundEvent::Completion { id, result } => self.handle_completion(id, result),
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Topology snapshot. The first one counts as first contact: power source
    /// and zone attributes are read and zones get a proactive enroll response.
    pub fn handle_topology(&mut self, topology: TopologySnapshot) -> Vec<OutboundRequest> {
        let mut out = Vec::new();

        if let Some(detected) = detect(Some(&topology)).dialects() {
            if self.profile.dialects.merge(detected) {
                self.emit_dialects();
            }
        }

        let first_contact = self.profile.topology.is_none();
        let zone_endpoints: Vec<u8> = topology.endpoints_with_input(cluster::IAS_ZONE).collect();

        if first_contact {
            self.power.set_kind(DeviceKind::infer(Some(&topology), None));
            let basic_ep = topology
                .endpoints_with_input(cluster::BASIC)
                .next()
                .or_else(|| topology.endpoints.first().map(|e| e.endpoint))
                .unwrap_or(1);
            self.profile.endpoints = topology.descriptors();
            self.profile.topology = Some(topology);

            out.push(self.issue(
                Operation::ReadAttribute {
                    endpoint: basic_ep,
                    cluster: cluster::BASIC,
                    attribute: POWER_SOURCE_ATTR,
                },
                Purpose::Read,
            ));
            info!(
                category = "session",
                device_id = %self.device_id,
                dialects = %self.profile.dialects,
                "First contact"
            );
        }

        for endpoint in zone_endpoints {
            if self.zones.contains(endpoint) {
                continue;
            }
            self.zones.ensure(endpoint);
            if let Some(request) = self.proactive_enroll(endpoint, 0) {
                out.push(request);
            }
            for attribute in [zone::attr::ZONE_TYPE, zone::attr::ZONE_STATE] {
                out.push(self.issue(
                    Operation::ReadAttribute {
                        endpoint,
                        cluster: cluster::IAS_ZONE,
                        attribute,
                    },
                    Purpose::Read,
                ));
            }
        }

        out
    }

    /// Attribute report or read result.
    pub fn handle_attribute(
        &mut self,
        endpoint: u8,
        cluster_id: u16,
        attribute: u16,
        value: AttributeValue,
    ) -> Vec<OutboundRequest> {
        let mut out = Vec::new();
        self.observe_dialect(endpoint, cluster_id);
        self.learner.observe_cluster(cluster_id, attribute);

        match cluster_id {
            cluster::BASIC => self.handle_basic(attribute, &value),
            cluster::IAS_ZONE => {
                let outcome = self.zones.ensure(endpoint).on_attribute(attribute, &value);
                self.apply_zone_outcome(endpoint, outcome, &mut out);
            }
            _ => match map_attribute(cluster_id, attribute, &value) {
                AttributeMapping::Mapped(update) => {
                    self.apply_updates(vec![update]);
                }
                AttributeMapping::Unmapped => {
                    if ClusterCatalog::get(cluster_id).is_some() {
                        self.emit_unknown(
                            SignalSource::Attribute {
                                endpoint,
                                cluster: cluster_id,
                                attribute,
                            },
                            value,
                        );
                    } else {
                        debug!(
                            category = "session",
                            device_id = %self.device_id,
                            cluster = cluster_id,
                            attribute,
                            "Attribute of unknown cluster dropped"
                        );
                    }
                }
                AttributeMapping::Ignored => {}
            },
        }

        out
    }

    /// Cluster command from the device.
    pub fn handle_command(
        &mut self,
        endpoint: u8,
        cluster_id: u16,
        command: u8,
        payload: &[u8],
    ) -> Vec<OutboundRequest> {
        let mut out = Vec::new();
        self.observe_dialect(endpoint, cluster_id);
        self.learner.observe_cluster_command(cluster_id);

        match (cluster_id, command) {
            (cluster::IAS_ZONE, zone::command::ENROLL_REQUEST) => {
                let outcome = self.zones.ensure(endpoint).on_enroll_request(payload);
                self.apply_zone_outcome(endpoint, outcome, &mut out);
            }
            (cluster::IAS_ZONE, zone::command::STATUS_CHANGE_NOTIFICATION) => {
                match self.zones.ensure(endpoint).on_status_notification(payload) {
                    Ok(outcome) => self.apply_zone_outcome(endpoint, outcome, &mut out),
                    Err(e) => self.decode_failed(e.to_string()),
                }
            }
            (cluster::PROPRIETARY_DATAPOINT, time::TIME_SYNC_COMMAND) => {
                let seq = payload
                    .get(0..2)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]))
                    .unwrap_or(0);
                let snapshot = self.time.current_time();
                debug!(
                    category = "time",
                    device_id = %self.device_id,
                    utc = snapshot.utc,
                    dst = snapshot.dst,
                    "Answering time sync"
                );
                out.push(self.issue(
                    Operation::SendCommand {
                        endpoint,
                        cluster: cluster::PROPRIETARY_DATAPOINT,
                        command: time::TIME_SYNC_COMMAND,
                        payload: snapshot.sync_response(seq, self.sync_epoch),
                    },
                    Purpose::TimeSync,
                ));
            }
            (cluster::PROPRIETARY_DATAPOINT, _) => self.handle_frame(payload),
            (cluster::TIME, READ_ATTRIBUTES_COMMAND) => {
                out.push(self.time_reply(endpoint, payload));
            }
            _ => {
                if ClusterCatalog::get(cluster_id).is_some() {
                    self.emit_unknown(
                        SignalSource::Command {
                            endpoint,
                            cluster: cluster_id,
                            command,
                        },
                        AttributeValue::Binary(payload.to_vec()),
                    );
                }
            }
        }

        out
    }

    /// Completion of an earlier request. Completions for unknown ids
    /// (already handled, or issued before a restart) are ignored.
    pub fn handle_completion(
        &mut self,
        id: RequestId,
        result: TransportResult<OperationOutput>,
    ) -> Vec<OutboundRequest> {
        let Some(pending) = self.pending.remove(&id) else {
            debug!(
                category = "session",
                device_id = %self.device_id,
                request = %id,
                "Late completion ignored"
            );
            return Vec::new();
        };

        match result {
            Ok(OperationOutput::Value(value)) => {
                if let Operation::ReadAttribute {
                    endpoint,
                    cluster,
                    attribute,
                } = pending.operation
                {
                    return self.handle_attribute(endpoint, cluster, attribute, value);
                }
                Vec::new()
            }
            Ok(OperationOutput::Done) => Vec::new(),
            Err(error) => {
                let retry = match pending.purpose {
                    Purpose::ProactiveEnroll { endpoint, attempt }
                        if attempt < self.proactive_retries
                            && !self.zones.get(endpoint).map_or(true, |z| z.is_enrolled()) =>
                    {
                        Some((endpoint, attempt + 1))
                    }
                    _ => None,
                };

                warn!(
                    category = "session",
                    device_id = %self.device_id,
                    request = %pending.operation,
                    error = %error,
                    will_retry = retry.is_some(),
                    "Outbound request failed"
                );
                self.sink.emit(MeshEvent::OutboundFailed {
                    device_id: self.device_id.clone(),
                    request: pending.operation.to_string(),
                    error: error.to_string(),
                    will_retry: retry.is_some(),
                    timestamp: Utc::now().timestamp(),
                });

                retry
                    .and_then(|(endpoint, attempt)| self.proactive_enroll(endpoint, attempt))
                    .into_iter()
                    .collect()
            }
        }
    }

    // ========================================================================
    // Host-initiated
    // ========================================================================

    /// Build the request that sets a capability on the device.
    ///
    /// Devices speaking the datapoint tunnel get a datapoint frame; others a
    /// standard cluster command or attribute write.
    pub fn set_capability(&mut self, capability: &str, value: AttributeValue) -> Result<OutboundRequest> {
        if self.profile.dialects.proprietary_datapoint {
            if let Some(encoded) = self.mapper.table().encode_capability(capability, &value) {
                let dp = encoded?;
                let seq = self.next_seq;
                self.next_seq = self.next_seq.wrapping_add(1);
                let payload = DatapointFrame::new(seq).with_datapoint(dp).encode()?;
                let endpoint = self.endpoint_for(cluster::PROPRIETARY_DATAPOINT);
                return Ok(self.issue(
                    Operation::SendCommand {
                        endpoint,
                        cluster: cluster::PROPRIETARY_DATAPOINT,
                        command: tunnel_command::DATA_REQUEST,
                        payload,
                    },
                    Purpose::CapabilityWrite,
                ));
            }
        }

        let operation = self.standard_write(capability, &value)?;
        Ok(self.issue(operation, Purpose::CapabilityWrite))
    }

    /// Push the current time to the device's Time cluster.
    pub fn sync_time(&mut self, endpoint: u8) -> OutboundRequest {
        self.time_reply(endpoint, &[])
    }

    /// Synthesize the learned profile and announce it.
    pub fn learn(&mut self) -> LearnedProfile {
        let learned = self.learner.synthesize_profile();
        self.profile.learned_at = Some(learned.learned_at);
        info!(
            category = "learner",
            device_id = %self.device_id,
            identifier = %learned.identifier,
            class = %learned.device_class,
            "Profile learned"
        );
        self.sink.emit(MeshEvent::ProfileLearned {
            device_id: self.device_id.clone(),
            identifier: learned.identifier.clone(),
            device_class: learned.device_class.to_string(),
            timestamp: Utc::now().timestamp(),
        });
        learned
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn issue(&mut self, operation: Operation, purpose: Purpose) -> OutboundRequest {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        self.pending.insert(
            id,
            Pending {
                purpose,
                operation: operation.clone(),
            },
        );
        OutboundRequest { id, operation }
    }

    fn proactive_enroll(&mut self, endpoint: u8, attempt: u8) -> Option<OutboundRequest> {
        let zone = self.zones.get_mut(endpoint)?;
        zone.proactive_attempts = zone.proactive_attempts.saturating_add(1);
        let payload = zone::enroll_response_payload(zone.zone_id);
        debug!(
            category = "zone",
            device_id = %self.device_id,
            endpoint,
            attempt,
            "Proactive enroll response"
        );
        Some(self.issue(
            Operation::SendCommand {
                endpoint,
                cluster: cluster::IAS_ZONE,
                command: zone::command::ENROLL_RESPONSE,
                payload,
            },
            Purpose::ProactiveEnroll { endpoint, attempt },
        ))
    }

    fn set_identity(&mut self, vendor: Option<String>, model: Option<String>) {
        if vendor.is_some() {
            self.profile.vendor = vendor.clone();
        }
        if model.is_some() {
            self.profile.model = model.clone();
        }
        self.learner.set_identity(vendor, model);
    }

    fn handle_basic(&mut self, attribute: u16, value: &AttributeValue) {
        match attribute {
            POWER_SOURCE_ATTR => {
                if let Some(source) = self.power.observe_power_source(value) {
                    self.profile.power = source;
                }
            }
            basic_attr::MANUFACTURER_NAME => {
                self.set_identity(value.as_str().map(str::to_string), None);
            }
            basic_attr::MODEL_ID => {
                self.set_identity(None, value.as_str().map(str::to_string));
            }
            _ => {}
        }
    }

    fn handle_frame(&mut self, payload: &[u8]) {
        let frame = match DatapointFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                self.decode_failed(e.to_string());
                return;
            }
        };

        let now = Utc::now();
        let mut updates = Vec::new();
        for decoded in &frame.datapoints {
            self.learner.observe_decoded(decoded, now);
            match decoded {
                Decoded::Recognized(dp) => match self.mapper.table().map_datapoint(dp) {
                    Some(update) => updates.push(update),
                    None => self.emit_unknown(
                        SignalSource::Datapoint {
                            id: dp.id,
                            tag: dp.data_type().tag(),
                        },
                        dp.value.to_attribute_value(),
                    ),
                },
                Decoded::Unrecognized(raw) => self.emit_unknown(
                    SignalSource::Datapoint {
                        id: raw.id,
                        tag: raw.tag,
                    },
                    AttributeValue::Binary(raw.raw.clone()),
                ),
            }
        }
        self.apply_updates(updates);
    }

    fn apply_zone_outcome(&mut self, endpoint: u8, outcome: ZoneOutcome, out: &mut Vec<OutboundRequest>) {
        let Some(zone) = self.zones.get(endpoint) else {
            return;
        };
        let zone_id = zone.zone_id;
        let zone_type = zone.zone_type;

        if let Some((from, to)) = outcome.transition {
            info!(
                category = "zone",
                device_id = %self.device_id,
                endpoint,
                zone_id,
                from = %from,
                to = %to,
                "Zone enrollment advanced"
            );
            self.sink.emit(MeshEvent::ZoneEnrollment {
                device_id: self.device_id.clone(),
                endpoint,
                zone_id,
                from,
                to,
                timestamp: Utc::now().timestamp(),
            });
        }

        if outcome.respond {
            out.push(self.issue(
                Operation::SendCommand {
                    endpoint,
                    cluster: cluster::IAS_ZONE,
                    command: zone::command::ENROLL_RESPONSE,
                    payload: zone::enroll_response_payload(zone_id),
                },
                Purpose::EnrollResponse,
            ));
        }

        if zone_type.is_some() && self.power.kind() == DeviceKind::Other {
            self.power.set_kind(DeviceKind::infer(None, zone_type));
        }

        self.apply_updates(outcome.updates);
    }

    fn apply_updates(&mut self, updates: Vec<CapabilityUpdate>) -> ApplyReport {
        let updates = self.power.gate(updates);
        if updates.is_empty() {
            return ApplyReport::default();
        }
        self.mapper
            .apply(&self.device_id, &mut self.store, updates, self.sink.as_ref())
    }

    fn standard_write(&self, capability: &str, value: &AttributeValue) -> Result<Operation> {
        let rejected = || {
            capability_err!(
                "capability {} cannot take a {} value",
                capability,
                value.type_name()
            )
        };
        let number = || value.as_f64().filter(|v| v.is_finite()).ok_or_else(rejected);
        let fraction = || number().map(|v| v.clamp(0.0, 1.0));

        let operation = match capability {
            names::ONOFF => Operation::SendCommand {
                endpoint: self.endpoint_for(cluster::ON_OFF),
                cluster: cluster::ON_OFF,
                command: u8::from(value.as_bool().ok_or_else(rejected)?),
                payload: Vec::new(),
            },
            names::DIM => {
                // Move to level with on/off, immediate
                let level = (fraction()? * 254.0).round() as u8;
                Operation::SendCommand {
                    endpoint: self.endpoint_for(cluster::LEVEL_CONTROL),
                    cluster: cluster::LEVEL_CONTROL,
                    command: 0x04,
                    payload: vec![level, 0, 0],
                }
            }
            names::WINDOWCOVERINGS_SET => {
                // Go to lift percentage
                let percent = (fraction()? * 100.0).round() as u8;
                Operation::SendCommand {
                    endpoint: self.endpoint_for(cluster::WINDOW_COVERING),
                    cluster: cluster::WINDOW_COVERING,
                    command: 0x05,
                    payload: vec![percent],
                }
            }
            names::TARGET_TEMPERATURE => {
                let centi = (number()? * 100.0).round() as i64;
                Operation::WriteAttributes {
                    endpoint: self.endpoint_for(cluster::THERMOSTAT),
                    cluster: cluster::THERMOSTAT,
                    values: BTreeMap::from([(0x0012, AttributeValue::Integer(centi))]),
                }
            }
            _ => return Err(capability_err!("no write path for capability {}", capability)),
        };
        Ok(operation)
    }

    fn time_reply(&mut self, endpoint: u8, payload: &[u8]) -> OutboundRequest {
        let requested: Vec<u16> = payload
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let values: BTreeMap<u16, AttributeValue> = self
            .time
            .current_time()
            .cluster_attributes()
            .into_iter()
            .filter(|(id, _)| requested.is_empty() || requested.contains(id))
            .collect();
        self.issue(
            Operation::WriteAttributes {
                endpoint,
                cluster: cluster::TIME,
                values,
            },
            Purpose::TimeSync,
        )
    }

    /// Endpoint serving a cluster, falling back to the first endpoint.
    fn endpoint_for(&self, cluster_id: u16) -> u8 {
        let Some(topology) = &self.profile.topology else {
            return 1;
        };
        topology
            .endpoints_with_input(cluster_id)
            .next()
            .or_else(|| topology.endpoints.first().map(|e| e.endpoint))
            .unwrap_or(1)
    }

    fn observe_dialect(&mut self, endpoint: u8, cluster_id: u16) {
        if is_private_cluster(cluster_id) {
            let endpoints = &mut self.profile.endpoints;
            let index = match endpoints.iter().position(|e| e.endpoint == endpoint) {
                Some(index) => index,
                None => {
                    endpoints.push(EndpointDescriptor::new(endpoint));
                    endpoints.len() - 1
                }
            };
            if endpoints[index].observe_private(cluster_id, Direction::Input) {
                debug!(
                    category = "dialect",
                    device_id = %self.device_id,
                    endpoint,
                    cluster = cluster_id,
                    "Private cluster surfaced"
                );
            }
        }
        if self.profile.dialects.observe_cluster(cluster_id) {
            self.emit_dialects();
        }
    }

    fn emit_dialects(&self) {
        info!(
            category = "dialect",
            device_id = %self.device_id,
            dialects = %self.profile.dialects,
            "Dialects updated"
        );
        self.sink.emit(MeshEvent::DialectDetected {
            device_id: self.device_id.clone(),
            dialects: self.profile.dialects.clone(),
            timestamp: Utc::now().timestamp(),
        });
    }

    fn emit_unknown(&self, source: SignalSource, value: AttributeValue) {
        debug!(
            category = "session",
            device_id = %self.device_id,
            source = %source,
            "Unmapped signal"
        );
        self.sink.emit(MeshEvent::UnknownSignal {
            device_id: self.device_id.clone(),
            source,
            value,
            timestamp: Utc::now().timestamp(),
        });
    }

    fn decode_failed(&self, error: String) {
        warn!(
            category = "session",
            device_id = %self.device_id,
            error = %error,
            "Inbound payload could not be decoded"
        );
        self.sink.emit(MeshEvent::DecodeFailed {
            device_id: self.device_id.clone(),
            error,
            timestamp: Utc::now().timestamp(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use meshbridge_core::time::FixedZone;
    use meshbridge_core::{Datapoint, DatapointValue, EndpointTopology, EnrollmentStatus, MemorySink};

    fn session() -> (DeviceSession, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let session = DeviceSession::new("dev-1", &EngineConfig::default(), sink.clone());
        (session, sink)
    }

    fn zone_topology() -> TopologySnapshot {
        TopologySnapshot::new(vec![EndpointTopology::new(1)
            .with_profile(0x0104)
            .with_inputs([cluster::BASIC, cluster::POWER_CONFIG, cluster::IAS_ZONE])])
    }

    fn enroll_request(out: &[OutboundRequest]) -> Option<&OutboundRequest> {
        out.iter().find(|r| {
            matches!(
                r.operation,
                Operation::SendCommand {
                    cluster: cluster::IAS_ZONE,
                    command: zone::command::ENROLL_RESPONSE,
                    ..
                }
            )
        })
    }

    #[test]
    fn test_first_contact_reads_and_enrolls() {
        let (mut session, _sink) = session();
        let out = session.handle_topology(zone_topology());

        // power source + proactive enroll + zone type + zone state
        assert_eq!(out.len(), 4);
        assert!(matches!(
            out[0].operation,
            Operation::ReadAttribute {
                cluster: cluster::BASIC,
                attribute: POWER_SOURCE_ATTR,
                ..
            }
        ));
        let enroll = enroll_request(&out).unwrap();
        assert!(matches!(
            &enroll.operation,
            Operation::SendCommand { payload, .. } if payload == &vec![0x00, 0x01]
        ));
        assert_eq!(session.pending_count(), 4);

        // A second snapshot is not first contact
        assert!(session.handle_topology(zone_topology()).is_empty());
    }

    #[test]
    fn test_proactive_enroll_retried_once() {
        let (mut session, sink) = session();
        let out = session.handle_topology(zone_topology());
        let first = enroll_request(&out).unwrap().id;

        let retry = session.handle_completion(first, Err(TransportError::Timeout(500)));
        assert_eq!(retry.len(), 1);
        let second = retry[0].id;
        assert_ne!(first, second);

        let none = session.handle_completion(second, Err(TransportError::Timeout(500)));
        assert!(none.is_empty());

        let failures = sink.named("outbound_failed");
        assert_eq!(failures.len(), 2);
        assert!(matches!(failures[0], MeshEvent::OutboundFailed { will_retry: true, .. }));
        assert!(matches!(failures[1], MeshEvent::OutboundFailed { will_retry: false, .. }));
        assert_eq!(session.zones().get(1).unwrap().proactive_attempts, 2);
    }

    #[test]
    fn test_other_failures_not_retried() {
        let (mut session, sink) = session();
        let out = session.handle_topology(zone_topology());
        let read = out[0].id;
        assert!(session
            .handle_completion(read, Err(TransportError::Unreachable("dev-1".into())))
            .is_empty());
        assert_eq!(sink.named("outbound_failed").len(), 1);
    }

    #[test]
    fn test_late_completion_ignored() {
        let (mut session, sink) = session();
        let out = session.handle_completion(RequestId(42), Ok(OperationOutput::Done));
        assert!(out.is_empty());
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_read_completion_feeds_attribute_path() {
        let (mut session, _sink) = session();
        let out = session.handle_topology(zone_topology());
        let zone_type_read = out
            .iter()
            .find(|r| {
                matches!(
                    r.operation,
                    Operation::ReadAttribute {
                        attribute: zone::attr::ZONE_TYPE,
                        ..
                    }
                )
            })
            .unwrap()
            .id;
        session.handle_completion(
            zone_type_read,
            Ok(OperationOutput::Value(AttributeValue::Integer(
                i64::from(zone::zone_type::CONTACT),
            ))),
        );
        assert_eq!(
            session.zones().get(1).unwrap().alarm_capability(),
            names::ALARM_CONTACT
        );
        assert_eq!(session.power().kind(), DeviceKind::Contact);
    }

    #[test]
    fn test_status_notification_enrolls_and_maps() {
        let (mut session, sink) = session();
        session.handle_topology(zone_topology());
        session.handle_command(1, cluster::IAS_ZONE, zone::command::ENROLL_REQUEST, &[0x15, 0x00, 0, 0]);
        session.handle_command(
            1,
            cluster::IAS_ZONE,
            zone::command::STATUS_CHANGE_NOTIFICATION,
            &[0x01, 0x00, 0x00, 0x01, 0x00, 0x00],
        );

        let zone = session.zones().get(1).unwrap();
        assert_eq!(zone.status(), EnrollmentStatus::Enrolled);
        assert_eq!(
            session.store().capability_value(names::ALARM_CONTACT),
            Some(AttributeValue::Boolean(true))
        );
        assert_eq!(sink.named("zone_enrollment").len(), 2);
    }

    #[test]
    fn test_short_notification_is_decode_failure() {
        let (mut session, sink) = session();
        session.handle_command(1, cluster::IAS_ZONE, zone::command::STATUS_CHANGE_NOTIFICATION, &[0x01]);
        assert_eq!(sink.named("decode_failed").len(), 1);
        assert_eq!(
            session.zones().get(1).unwrap().status(),
            EnrollmentStatus::Unenrolled
        );
    }

    #[test]
    fn test_time_sync_answer() {
        let sink = Arc::new(MemorySink::new());
        let mut session = DeviceSession::new("dev-1", &EngineConfig::default(), sink)
            .with_time_zone(FixedZone(3600));
        let out = session.handle_command(1, cluster::PROPRIETARY_DATAPOINT, time::TIME_SYNC_COMMAND, &[0x00, 0x07]);
        assert_eq!(out.len(), 1);
        let Operation::SendCommand { payload, command, .. } = &out[0].operation else {
            panic!("expected a command");
        };
        assert_eq!(*command, time::TIME_SYNC_COMMAND);
        assert_eq!(payload.len(), 10);
        assert_eq!(&payload[..2], &[0x00, 0x07]);
        let utc = u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]);
        let local = u32::from_be_bytes([payload[6], payload[7], payload[8], payload[9]]);
        assert_eq!(local - utc, 3600);
    }

    #[test]
    fn test_time_cluster_read_answered_with_requested_attributes() {
        let (mut session, _sink) = session();
        let out = session.handle_command(1, cluster::TIME, READ_ATTRIBUTES_COMMAND, &[0x00, 0x00, 0x07, 0x00]);
        let Operation::WriteAttributes { values, cluster: c, .. } = &out[0].operation else {
            panic!("expected an attribute write");
        };
        assert_eq!(*c, cluster::TIME);
        assert_eq!(values.keys().copied().collect::<Vec<_>>(), vec![0x0000, 0x0007]);
    }

    #[test]
    fn test_capability_write_through_tunnel() {
        let (mut session, _sink) = session();
        session.handle_topology(TopologySnapshot::new(vec![
            EndpointTopology::new(1).with_inputs([cluster::PROPRIETARY_DATAPOINT]),
        ]));
        let request = session.set_capability(names::ONOFF, true.into()).unwrap();
        let Operation::SendCommand { cluster: c, command, payload, .. } = &request.operation else {
            panic!("expected a command");
        };
        assert_eq!(*c, cluster::PROPRIETARY_DATAPOINT);
        assert_eq!(*command, tunnel_command::DATA_REQUEST);
        let frame = DatapointFrame::decode(payload).unwrap();
        assert_eq!(
            frame.datapoints[0].recognized(),
            Some(&Datapoint::new(1, DatapointValue::Bool(true)))
        );
    }

    #[test]
    fn test_capability_write_standard() {
        let (mut session, _sink) = session();
        session.handle_topology(TopologySnapshot::new(vec![EndpointTopology::new(11)
            .with_profile(0x0104)
            .with_inputs([cluster::ON_OFF, cluster::LEVEL_CONTROL])]));
        let request = session.set_capability(names::DIM, 0.5.into()).unwrap();
        assert_eq!(
            request.operation,
            Operation::SendCommand {
                endpoint: 11,
                cluster: cluster::LEVEL_CONTROL,
                command: 0x04,
                payload: vec![127, 0, 0],
            }
        );
        assert!(session.set_capability("light_temperature", 0.5.into()).is_err());
    }

    #[test]
    fn test_capability_write_rejects_wrong_value_type() {
        let (mut session, _sink) = session();
        session.handle_topology(TopologySnapshot::new(vec![
            EndpointTopology::new(1).with_inputs([cluster::PROPRIETARY_DATAPOINT]),
        ]));
        let pending = session.pending_count();

        let err = session
            .set_capability(names::ONOFF, AttributeValue::String("garbage".into()))
            .unwrap_err();
        assert!(matches!(
            err,
            meshbridge_core::Error::Encoding(meshbridge_core::EncodingError::TypeMismatch { .. })
        ));
        assert!(session
            .set_capability(names::DIM, AttributeValue::String("half".into()))
            .is_err());
        // Nothing was queued for the device
        assert_eq!(session.pending_count(), pending);

        let (mut standard, _sink) = self::session();
        standard.handle_topology(TopologySnapshot::new(vec![EndpointTopology::new(1)
            .with_profile(0x0104)
            .with_inputs([cluster::ON_OFF, cluster::LEVEL_CONTROL])]));
        let pending = standard.pending_count();
        assert!(standard
            .set_capability(names::ONOFF, AttributeValue::String("on".into()))
            .is_err());
        assert!(standard
            .set_capability(names::DIM, AttributeValue::Float(f64::NAN))
            .is_err());
        assert_eq!(standard.pending_count(), pending);
    }

    #[test]
    fn test_endpoint_descriptors_track_private_clusters() {
        let (mut session, _sink) = session();
        session.handle_topology(TopologySnapshot::new(vec![EndpointTopology::new(1)
            .with_profile(0x0104)
            .with_inputs([cluster::BASIC, cluster::ON_OFF])]));
        let standard_before = session.profile().endpoints[0].standard().clone();
        assert!(session.profile().endpoints[0].private().is_empty());

        session.handle_attribute(1, cluster::XIAOMI_PRIVATE, 0x00F7, AttributeValue::Binary(vec![1]));
        session.handle_command(2, 0xFC57, 0x01, &[]);

        let endpoints = &session.profile().endpoints;
        assert_eq!(endpoints[0].standard(), &standard_before);
        assert!(endpoints[0].has_cluster(cluster::XIAOMI_PRIVATE));
        let second = endpoints.iter().find(|e| e.endpoint == 2).unwrap();
        assert!(second.standard().is_empty());
        assert!(second.has_cluster(0xFC57));
        assert!(session.profile().dialects.private_vendors.contains("PRIVATE_FC57"));
    }

    #[test]
    fn test_command_clusters_reach_learner() {
        let (mut session, _sink) = session();
        session.handle_command(1, cluster::SCENES, 0x05, &[0x01, 0x00]);
        assert!(session.learner().observed_clusters().any(|c| c == cluster::SCENES));
    }

    #[test]
    fn test_inbound_event_from_json() {
        let event: InboundEvent = serde_json::from_value(serde_json::json!({
            "event": "command",
            "endpoint": 1,
            "cluster": 0xEF00,
            "command": 2,
            "payload": "0001 0101 0001 01"
        }))
        .unwrap();
        assert_eq!(
            event,
            InboundEvent::Command {
                endpoint: 1,
                cluster: 0xEF00,
                command: 2,
                payload: vec![0x00, 0x01, 0x01, 0x01, 0x00, 0x01, 0x01],
            }
        );
    }
}
