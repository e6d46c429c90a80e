//! Events emitted by the normalization engine.
//!
//! Every observable side effect of a device session (a capability grant, a
//! changed value, an enrollment step, an unmapped signal) is reported as a
//! [`MeshEvent`]. Hosts subscribe through the [`EventBus`](crate::eventbus::EventBus)
//! or plug their own [`EventSink`](crate::eventbus::EventSink).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dialect::DialectSet;
use crate::value::AttributeValue;

/// Zone enrollment status.
///
/// Ordered: a zone only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    #[default]
    Unenrolled,
    EnrollRequested,
    Enrolled,
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unenrolled => write!(f, "unenrolled"),
            Self::EnrollRequested => write!(f, "enroll_requested"),
            Self::Enrolled => write!(f, "enrolled"),
        }
    }
}

/// Where a signal came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalSource {
    Datapoint { id: u8, tag: u8 },
    Attribute { endpoint: u8, cluster: u16, attribute: u16 },
    Command { endpoint: u8, cluster: u16, command: u8 },
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datapoint { id, tag } => write!(f, "dp{}/tag{}", id, tag),
            Self::Attribute {
                endpoint,
                cluster,
                attribute,
            } => write!(f, "ep{}/0x{:04X}/attr 0x{:04X}", endpoint, cluster, attribute),
            Self::Command {
                endpoint,
                cluster,
                command,
            } => write!(f, "ep{}/0x{:04X}/cmd 0x{:02X}", endpoint, cluster, command),
        }
    }
}

/// Engine event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    /// Dialect classification of a device was established or grew.
    DialectDetected {
        device_id: String,
        dialects: DialectSet,
        timestamp: i64,
    },

    /// A capability was added to a device.
    CapabilityGranted {
        device_id: String,
        capability: String,
        timestamp: i64,
    },

    /// A capability value changed.
    CapabilityChanged {
        device_id: String,
        capability: String,
        value: AttributeValue,
        timestamp: i64,
    },

    /// A signal no rule maps.
    UnknownSignal {
        device_id: String,
        source: SignalSource,
        value: AttributeValue,
        timestamp: i64,
    },

    /// A zone endpoint moved through the enrollment handshake.
    ZoneEnrollment {
        device_id: String,
        endpoint: u8,
        zone_id: u8,
        from: EnrollmentStatus,
        to: EnrollmentStatus,
        timestamp: i64,
    },

    /// A learned profile was synthesized.
    ProfileLearned {
        device_id: String,
        identifier: String,
        device_class: String,
        timestamp: i64,
    },

    /// An outbound request failed.
    OutboundFailed {
        device_id: String,
        request: String,
        error: String,
        will_retry: bool,
        timestamp: i64,
    },

    /// A datapoint frame could not be decoded.
    DecodeFailed {
        device_id: String,
        error: String,
        timestamp: i64,
    },
}

impl MeshEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DialectDetected { .. } => "dialect_detected",
            Self::CapabilityGranted { .. } => "capability_granted",
            Self::CapabilityChanged { .. } => "capability_changed",
            Self::UnknownSignal { .. } => "unknown_signal",
            Self::ZoneEnrollment { .. } => "zone_enrollment",
            Self::ProfileLearned { .. } => "profile_learned",
            Self::OutboundFailed { .. } => "outbound_failed",
            Self::DecodeFailed { .. } => "decode_failed",
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            Self::DialectDetected { device_id, .. }
            | Self::CapabilityGranted { device_id, .. }
            | Self::CapabilityChanged { device_id, .. }
            | Self::UnknownSignal { device_id, .. }
            | Self::ZoneEnrollment { device_id, .. }
            | Self::ProfileLearned { device_id, .. }
            | Self::OutboundFailed { device_id, .. }
            | Self::DecodeFailed { device_id, .. } => device_id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Self::DialectDetected { timestamp, .. }
            | Self::CapabilityGranted { timestamp, .. }
            | Self::CapabilityChanged { timestamp, .. }
            | Self::UnknownSignal { timestamp, .. }
            | Self::ZoneEnrollment { timestamp, .. }
            | Self::ProfileLearned { timestamp, .. }
            | Self::OutboundFailed { timestamp, .. }
            | Self::DecodeFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Payload as JSON, without the type tag.
    pub fn payload(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(map) = value.as_object_mut() {
            map.remove("type");
        }
        value
    }
}

impl fmt::Display for MeshEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.device_id())
    }
}

/// Metadata attached to each published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event ID
    pub event_id: String,
    /// Groups events produced while handling one inbound message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Component that published
    pub source: String,
    pub timestamp: i64,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}
