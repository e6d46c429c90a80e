//! Zone enrollment.
//!
//! Alarm-style endpoints (motion, contact, smoke, water, panic buttons)
//! only report reliably once enrolled with the coordinator. Each
//! zone-capable endpoint gets a [`ZoneEnrollmentState`] that walks
//! `Unenrolled -> EnrollRequested -> Enrolled` and never moves backwards.
//! Status reports are tracked whatever the enrollment state is.

use std::collections::{BTreeMap, BTreeSet};

use meshbridge_core::{AttributeValue, EnrollmentStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::capabilities::{names, CapabilityUpdate};

/// Zone type codes.
pub mod zone_type {
    pub const MOTION: u16 = 0x000D;
    pub const CONTACT: u16 = 0x0015;
    pub const FIRE: u16 = 0x0028;
    pub const WATER: u16 = 0x002A;
    pub const CO: u16 = 0x002B;
    pub const EMERGENCY: u16 = 0x002C;
    pub const VIBRATION: u16 = 0x002D;
}

/// Zone cluster attributes.
pub mod attr {
    pub const ZONE_STATE: u16 = 0x0000;
    pub const ZONE_TYPE: u16 = 0x0001;
    pub const ZONE_STATUS: u16 = 0x0002;
    pub const CIE_ADDRESS: u16 = 0x0010;
    pub const ZONE_ID: u16 = 0x0011;
}

/// Zone cluster commands.
pub mod command {
    /// Device to coordinator.
    pub const STATUS_CHANGE_NOTIFICATION: u8 = 0x00;
    /// Device to coordinator.
    pub const ENROLL_REQUEST: u8 = 0x01;
    /// Coordinator to device.
    pub const ENROLL_RESPONSE: u8 = 0x00;
}

/// Zone status bits.
pub mod status_bit {
    pub const ALARM1: u16 = 1 << 0;
    pub const TAMPER: u16 = 1 << 2;
    pub const BATTERY_LOW: u16 = 1 << 3;
}

/// Enroll response code for success.
pub const ENROLL_SUCCESS: u8 = 0x00;

/// Capability carrying the primary alarm of a zone type.
pub fn alarm_capability(zone_type: Option<u16>) -> &'static str {
    match zone_type {
        Some(zone_type::MOTION) => names::ALARM_MOTION,
        Some(zone_type::CONTACT) => names::ALARM_CONTACT,
        Some(zone_type::FIRE) => names::ALARM_SMOKE,
        Some(zone_type::WATER) => names::ALARM_WATER,
        Some(zone_type::CO) => names::ALARM_CO,
        Some(zone_type::VIBRATION) => names::ALARM_VIBRATION,
        // Emergency buttons and anything unknown
        _ => names::ALARM_GENERIC,
    }
}

/// Enroll response payload: `[code][zone id]`.
pub fn enroll_response_payload(zone_id: u8) -> Vec<u8> {
    vec![ENROLL_SUCCESS, zone_id]
}

/// Malformed zone payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZonePayloadError {
    #[error("zone status notification too short: {len} bytes")]
    TooShort { len: usize },
}

/// Parsed enroll request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollRequest {
    pub zone_type: Option<u16>,
    pub manufacturer_code: Option<u16>,
}

impl EnrollRequest {
    /// Parse `[zoneType u16 LE][manufacturerCode u16 LE]`; missing fields stay `None`.
    pub fn parse(payload: &[u8]) -> Self {
        let field = |at: usize| {
            payload
                .get(at..at + 2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
        };
        Self {
            zone_type: field(0),
            manufacturer_code: field(2),
        }
    }
}

/// Parsed status change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusNotification {
    pub zone_status: u16,
    pub extended_status: u8,
    pub zone_id: u8,
    pub delay: u16,
}

impl StatusNotification {
    /// Parse `[zoneStatus u16 LE][extended u8][zoneId u8][delay u16 LE]`.
    ///
    /// Only the status is mandatory.
    pub fn parse(payload: &[u8]) -> Result<Self, ZonePayloadError> {
        if payload.len() < 2 {
            return Err(ZonePayloadError::TooShort { len: payload.len() });
        }
        Ok(Self {
            zone_status: u16::from_le_bytes([payload[0], payload[1]]),
            extended_status: payload.get(2).copied().unwrap_or(0),
            zone_id: payload.get(3).copied().unwrap_or(0),
            delay: payload
                .get(4..6)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .unwrap_or(0),
        })
    }
}

/// Result of feeding one zone message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneOutcome {
    pub transition: Option<(EnrollmentStatus, EnrollmentStatus)>,
    pub updates: Vec<CapabilityUpdate>,
    /// An enroll response must be sent.
    pub respond: bool,
}

/// Enrollment state of one zone endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneEnrollmentState {
    pub endpoint: u8,
    pub zone_id: u8,
    status: EnrollmentStatus,
    pub zone_type: Option<u16>,
    pub manufacturer_code: Option<u16>,
    pub last_alarm_bitmap: Option<u16>,
    /// Proactive enroll responses sent so far.
    pub proactive_attempts: u8,
}

impl ZoneEnrollmentState {
    pub fn new(endpoint: u8, zone_id: u8) -> Self {
        Self {
            endpoint,
            zone_id,
            status: EnrollmentStatus::Unenrolled,
            zone_type: None,
            manufacturer_code: None,
            last_alarm_bitmap: None,
            proactive_attempts: 0,
        }
    }

    pub fn status(&self) -> EnrollmentStatus {
        self.status
    }

    pub fn is_enrolled(&self) -> bool {
        self.status == EnrollmentStatus::Enrolled
    }

    pub fn alarm_capability(&self) -> &'static str {
        alarm_capability(self.zone_type)
    }

    pub fn battery_low(&self) -> bool {
        self.last_alarm_bitmap
            .map_or(false, |b| b & status_bit::BATTERY_LOW != 0)
    }

    fn advance(&mut self, to: EnrollmentStatus) -> Option<(EnrollmentStatus, EnrollmentStatus)> {
        if to > self.status {
            let from = self.status;
            self.status = to;
            Some((from, to))
        } else {
            None
        }
    }

    /// Inbound enroll request. Always answered with this zone's id.
    pub fn on_enroll_request(&mut self, payload: &[u8]) -> ZoneOutcome {
        let request = EnrollRequest::parse(payload);
        if request.zone_type.is_some() {
            self.zone_type = request.zone_type;
        }
        if request.manufacturer_code.is_some() {
            self.manufacturer_code = request.manufacturer_code;
        }
        ZoneOutcome {
            transition: self.advance(EnrollmentStatus::EnrollRequested),
            updates: Vec::new(),
            respond: true,
        }
    }

    /// Inbound status change notification.
    pub fn on_status_notification(&mut self, payload: &[u8]) -> Result<ZoneOutcome, ZonePayloadError> {
        let notification = StatusNotification::parse(payload)?;
        Ok(ZoneOutcome {
            transition: self.advance(EnrollmentStatus::Enrolled),
            updates: self.apply_bitmap(notification.zone_status),
            respond: false,
        })
    }

    /// Zone cluster attribute report or read result.
    pub fn on_attribute(&mut self, attribute: u16, value: &AttributeValue) -> ZoneOutcome {
        let mut outcome = ZoneOutcome::default();
        match attribute {
            attr::ZONE_STATE => {
                if value.as_i64() == Some(1) {
                    outcome.transition = self.advance(EnrollmentStatus::Enrolled);
                }
            }
            attr::ZONE_TYPE => {
                if let Some(t) = value.as_i64().and_then(|v| u16::try_from(v).ok()) {
                    self.zone_type = Some(t);
                }
            }
            attr::ZONE_STATUS => {
                if let Some(bitmap) = value.as_i64().and_then(|v| u16::try_from(v).ok()) {
                    outcome.updates = self.apply_bitmap(bitmap);
                }
            }
            _ => {}
        }
        outcome
    }

    /// Record a status bitmap and derive capability updates.
    ///
    /// Tamper and battery-low only surface once they have been set at least
    /// once, so devices that never report them do not gain the capability.
    fn apply_bitmap(&mut self, bitmap: u16) -> Vec<CapabilityUpdate> {
        let previous = self.last_alarm_bitmap.replace(bitmap).unwrap_or(0);
        let mut updates = vec![CapabilityUpdate::new(
            self.alarm_capability(),
            bitmap & status_bit::ALARM1 != 0,
        )];
        for (bit, capability) in [
            (status_bit::TAMPER, names::ALARM_TAMPER),
            (status_bit::BATTERY_LOW, names::ALARM_BATTERY),
        ] {
            if (bitmap | previous) & bit != 0 {
                updates.push(CapabilityUpdate::new(capability, bitmap & bit != 0));
            }
        }
        updates
    }
}

/// Zone id a device reports before one is assigned.
pub const UNASSIGNED_ZONE_ID: u8 = 0xFF;

/// Zone states of one device, with sequential zone id allocation.
#[derive(Debug, Clone, Default)]
pub struct ZoneRegistry {
    base: u8,
    zones: BTreeMap<u8, ZoneEnrollmentState>,
}

impl ZoneRegistry {
    pub fn new(base: u8) -> Self {
        Self {
            base,
            zones: BTreeMap::new(),
        }
    }

    pub fn get(&self, endpoint: u8) -> Option<&ZoneEnrollmentState> {
        self.zones.get(&endpoint)
    }

    pub fn get_mut(&mut self, endpoint: u8) -> Option<&mut ZoneEnrollmentState> {
        self.zones.get_mut(&endpoint)
    }

    /// State for `endpoint`, created with the next free zone id if new.
    pub fn ensure(&mut self, endpoint: u8) -> &mut ZoneEnrollmentState {
        let next_id = self.next_zone_id();
        self.zones.entry(endpoint).or_insert_with(|| {
            if next_id == UNASSIGNED_ZONE_ID {
                warn!(
                    category = "zone",
                    endpoint = endpoint,
                    "No free zone id, endpoint left unassigned"
                );
            }
            ZoneEnrollmentState::new(endpoint, next_id)
        })
    }

    /// Lowest unused id from `base` upward, then from zero.
    fn next_zone_id(&self) -> u8 {
        let taken: BTreeSet<u8> = self.zones.values().map(|zone| zone.zone_id).collect();
        (self.base..UNASSIGNED_ZONE_ID)
            .chain(0..self.base)
            .find(|id| !taken.contains(id))
            .unwrap_or(UNASSIGNED_ZONE_ID)
    }

    pub fn contains(&self, endpoint: u8) -> bool {
        self.zones.contains_key(&endpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ZoneEnrollmentState> {
        self.zones.values()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}
