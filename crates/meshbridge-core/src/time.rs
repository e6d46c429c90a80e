//! Time responder.
//!
//! Devices with a clock (thermostats, climate displays, some remotes) ask
//! the coordinator for the time, either through the proprietary tunnel or
//! by reading the standard Time cluster. Both answers are built here from a
//! single [`TimeSnapshot`].

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::value::AttributeValue;

/// Seconds between 1970-01-01 and 2000-01-01.
pub const Y2000_EPOCH_OFFSET: i64 = 946_684_800;

/// Proprietary tunnel command carrying a time-sync request and its answer.
pub const TIME_SYNC_COMMAND: u8 = 0x24;

/// Time cluster attribute ids.
pub mod attr {
    pub const TIME: u16 = 0x0000;
    pub const TIME_STATUS: u16 = 0x0001;
    pub const TIME_ZONE: u16 = 0x0002;
    pub const LOCAL_TIME: u16 = 0x0007;
}

/// Time status reported to devices: synchronized.
pub const TIME_STATUS_SYNCHRONIZED: u8 = 0x02;

/// UTC offset lookup.
pub trait OffsetProvider: Send + Sync {
    /// Offset from UTC, in seconds, in effect at `at`.
    fn offset_at(&self, at: DateTime<Utc>) -> i32;
}

impl<T: OffsetProvider + ?Sized> OffsetProvider for std::sync::Arc<T> {
    fn offset_at(&self, at: DateTime<Utc>) -> i32 {
        (**self).offset_at(at)
    }
}

/// The host's local time zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalZone;

impl OffsetProvider for LocalZone {
    fn offset_at(&self, at: DateTime<Utc>) -> i32 {
        chrono::Local
            .from_utc_datetime(&at.naive_utc())
            .offset()
            .local_minus_utc()
    }
}

/// A zone with a constant offset.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedZone(pub i32);

impl OffsetProvider for FixedZone {
    fn offset_at(&self, _at: DateTime<Utc>) -> i32 {
        self.0
    }
}

/// Epoch of the proprietary sync payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEpoch {
    /// Seconds since 1970-01-01.
    #[default]
    Unix,
    /// Seconds since 2000-01-01, used by older firmwares.
    Y2000,
}

/// Point-in-time answer to a device time query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSnapshot {
    /// UTC seconds since the Unix epoch.
    pub utc: i64,
    /// Local wall-clock seconds since the Unix epoch.
    pub local: i64,
    pub offset_seconds: i32,
    pub standard_offset_seconds: i32,
    pub dst: bool,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    /// 1 = Monday ... 7 = Sunday.
    pub weekday: u32,
}

impl TimeSnapshot {
    /// Proprietary sync payload: `[utc u32 BE][local u32 BE]`.
    pub fn sync_payload(&self, epoch: SyncEpoch) -> [u8; 8] {
        let shift = match epoch {
            SyncEpoch::Unix => 0,
            SyncEpoch::Y2000 => Y2000_EPOCH_OFFSET,
        };
        let utc = (self.utc - shift) as u32;
        let local = (self.local - shift) as u32;
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&utc.to_be_bytes());
        payload[4..].copy_from_slice(&local.to_be_bytes());
        payload
    }

    /// Sync response frame for the tunnel: `[seq u16 BE][payload]`.
    pub fn sync_response(&self, seq: u16, epoch: SyncEpoch) -> Vec<u8> {
        let mut frame = seq.to_be_bytes().to_vec();
        frame.extend_from_slice(&self.sync_payload(epoch));
        frame
    }

    /// Time cluster attributes, in attribute id order.
    pub fn cluster_attributes(&self) -> Vec<(u16, AttributeValue)> {
        vec![
            (
                attr::TIME,
                AttributeValue::Integer(self.utc - Y2000_EPOCH_OFFSET),
            ),
            (
                attr::TIME_STATUS,
                AttributeValue::Integer(i64::from(TIME_STATUS_SYNCHRONIZED)),
            ),
            (
                attr::TIME_ZONE,
                AttributeValue::Integer(i64::from(self.standard_offset_seconds)),
            ),
            (
                attr::LOCAL_TIME,
                AttributeValue::Integer(self.local - Y2000_EPOCH_OFFSET),
            ),
        ]
    }

    /// Value of a single Time cluster attribute, if supported.
    pub fn cluster_attribute(&self, attribute: u16) -> Option<AttributeValue> {
        self.cluster_attributes()
            .into_iter()
            .find(|(id, _)| *id == attribute)
            .map(|(_, value)| value)
    }
}

/// Builds [`TimeSnapshot`]s from a clock and a zone.
pub struct TimeResponder<Z = LocalZone> {
    zone: Z,
}

impl TimeResponder<LocalZone> {
    pub fn new() -> Self {
        Self { zone: LocalZone }
    }
}

impl Default for TimeResponder<LocalZone> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Z: OffsetProvider> TimeResponder<Z> {
    pub fn with_zone(zone: Z) -> Self {
        Self { zone }
    }

    /// Snapshot of the current time.
    pub fn current_time(&self) -> TimeSnapshot {
        self.time_at(Utc::now())
    }

    /// Snapshot at a given instant.
    pub fn time_at(&self, now: DateTime<Utc>) -> TimeSnapshot {
        let offset = self.zone.offset_at(now);
        let january = self.offset_on(now.year(), 1);
        let july = self.offset_on(now.year(), 7);
        let standard = january.min(july);
        let dst = january != july && offset != standard;

        let local_dt = now + chrono::Duration::seconds(i64::from(offset));

        TimeSnapshot {
            utc: now.timestamp(),
            local: now.timestamp() + i64::from(offset),
            offset_seconds: offset,
            standard_offset_seconds: standard,
            dst,
            year: local_dt.year(),
            month: local_dt.month(),
            day: local_dt.day(),
            hour: local_dt.hour(),
            minute: local_dt.minute(),
            second: local_dt.second(),
            weekday: local_dt.weekday().number_from_monday(),
        }
    }

    fn offset_on(&self, year: i32, month: u32) -> i32 {
        match Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single() {
            Some(at) => self.zone.offset_at(at),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Central-European-like zone: +1h, +2h from April to October.
    struct SummerZone;

    impl OffsetProvider for SummerZone {
        fn offset_at(&self, at: DateTime<Utc>) -> i32 {
            if (4..=10).contains(&at.month()) {
                7200
            } else {
                3600
            }
        }
    }

    fn instant(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_dst_in_summer() {
        let snap = TimeResponder::with_zone(SummerZone).time_at(instant(2024, 7, 15, 10));
        assert!(snap.dst);
        assert_eq!(snap.offset_seconds, 7200);
        assert_eq!(snap.standard_offset_seconds, 3600);
        assert_eq!(snap.local - snap.utc, 7200);
        assert_eq!(snap.hour, 12);
    }

    #[test]
    fn test_no_dst_in_winter() {
        let snap = TimeResponder::with_zone(SummerZone).time_at(instant(2024, 1, 15, 10));
        assert!(!snap.dst);
        assert_eq!(snap.offset_seconds, 3600);
    }

    #[test]
    fn test_fixed_zone_never_dst() {
        let snap = TimeResponder::with_zone(FixedZone(-5 * 3600)).time_at(instant(2024, 7, 15, 3));
        assert!(!snap.dst);
        assert_eq!(snap.day, 14);
        assert_eq!(snap.hour, 22);
        // 2024-07-14 is a Sunday
        assert_eq!(snap.weekday, 7);
    }

    #[test]
    fn test_sync_payload() {
        let snap = TimeResponder::with_zone(FixedZone(3600)).time_at(instant(2024, 1, 1, 0));
        let payload = snap.sync_payload(SyncEpoch::Unix);
        let utc = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let local = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        assert_eq!(utc, 1_704_067_200);
        assert_eq!(local, 1_704_067_200 + 3600);

        let payload = snap.sync_payload(SyncEpoch::Y2000);
        let utc = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert_eq!(i64::from(utc), 1_704_067_200 - Y2000_EPOCH_OFFSET);

        let frame = snap.sync_response(0x0102, SyncEpoch::Unix);
        assert_eq!(&frame[..2], &[0x01, 0x02]);
        assert_eq!(frame.len(), 10);
    }

    #[test]
    fn test_cluster_attributes() {
        let snap = TimeResponder::with_zone(FixedZone(3600)).time_at(instant(2000, 1, 2, 0));
        assert_eq!(
            snap.cluster_attribute(attr::TIME),
            Some(AttributeValue::Integer(86_400))
        );
        assert_eq!(
            snap.cluster_attribute(attr::LOCAL_TIME),
            Some(AttributeValue::Integer(86_400 + 3600))
        );
        assert_eq!(
            snap.cluster_attribute(attr::TIME_ZONE),
            Some(AttributeValue::Integer(3600))
        );
        assert!(snap.cluster_attribute(0x0003).is_none());
    }

    #[test]
    fn test_current_time_is_consistent() {
        let snap = TimeResponder::new().current_time();
        assert_eq!(snap.local - snap.utc, i64::from(snap.offset_seconds));
        assert!((1..=7).contains(&snap.weekday));
    }
}
