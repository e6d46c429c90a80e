//! Session Scenario Tests
//!
//! End-to-end behavior of a device session fed with realistic traffic:
//! - Proprietary datapoint devices
//! - Zone enrollment
//! - Profile learning
//! - Battery gating
//

use std::sync::Arc;

use meshbridge_core::catalog::id as cluster;
use meshbridge_core::{
    AttributeValue, Datapoint, DatapointFrame, DatapointValue, EndpointTopology, EngineConfig,
    EnrollmentStatus, MeshEvent, MemorySink, SignalSource, TopologySnapshot,
};
use meshbridge_devices::capabilities::{names, CapabilityStore};
use meshbridge_devices::session::{tunnel_command, DeviceSession};
use meshbridge_devices::zone::{self, status_bit};
use meshbridge_devices::{DeviceClass, Operation};

fn new_session(id: &str) -> (DeviceSession, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    (DeviceSession::new(id, &EngineConfig::default(), sink.clone()), sink)
}

fn tunnel_only() -> TopologySnapshot {
    TopologySnapshot::new(vec![
        EndpointTopology::new(1).with_inputs([cluster::PROPRIETARY_DATAPOINT])
    ])
}

fn report(frame: DatapointFrame) -> Vec<u8> {
    frame.encode().unwrap()
}

// ============================================================================
// Proprietary datapoint device
// ============================================================================

#[test]
fn test_tunnel_switch_gets_onoff() {
    let (mut session, sink) = new_session("switch-1");
    session.handle_topology(tunnel_only());

    let dialects = &session.profile().dialects;
    assert!(dialects.proprietary_datapoint);
    assert!(dialects.profile.is_none());
    assert!(dialects.private_vendors.is_empty());

    let frame = DatapointFrame::new(1).with_datapoint(Datapoint::new(1, DatapointValue::Bool(true)));
    session.handle_command(1, cluster::PROPRIETARY_DATAPOINT, tunnel_command::DATA_REPORT, &report(frame));

    assert!(session.store().has_capability(names::ONOFF));
    assert_eq!(
        session.store().capability_value(names::ONOFF),
        Some(AttributeValue::Boolean(true))
    );
    assert_eq!(sink.named("capability_granted").len(), 1);
    assert_eq!(sink.named("capability_changed").len(), 1);
}

#[test]
fn test_repeated_report_changes_once() {
    let (mut session, sink) = new_session("switch-1");
    session.handle_topology(tunnel_only());
    for seq in 0..3 {
        let frame = DatapointFrame::new(seq).with_datapoint(Datapoint::new(1, DatapointValue::Bool(true)));
        session.handle_command(1, cluster::PROPRIETARY_DATAPOINT, tunnel_command::DATA_REPORT, &report(frame));
    }
    assert_eq!(session.capabilities(), vec![names::ONOFF.to_string()]);
    assert_eq!(sink.named("capability_granted").len(), 1);
    assert_eq!(sink.named("capability_changed").len(), 1);
}

#[test]
fn test_unmapped_and_unrecognized_datapoints_are_reported() {
    let (mut session, sink) = new_session("thing-1");
    session.handle_topology(tunnel_only());

    // dp 101 has no rule; dp 7 carries an unknown tag 9
    let mut payload = report(DatapointFrame::new(4).with_datapoint(Datapoint::new(101, DatapointValue::Enum(2))));
    payload.extend_from_slice(&[7, 9, 0, 2, 0xAB, 0xCD]);
    session.handle_command(1, cluster::PROPRIETARY_DATAPOINT, tunnel_command::DATA_REPORT, &payload);

    let unknown = sink.named("unknown_signal");
    assert_eq!(unknown.len(), 2);
    let MeshEvent::UnknownSignal { source, value, .. } = &unknown[1] else {
        panic!("expected unknown signal");
    };
    assert_eq!(source, &SignalSource::Datapoint { id: 7, tag: 9 });
    assert_eq!(value, &AttributeValue::Binary(vec![0xAB, 0xCD]));
    assert!(session.capabilities().is_empty());
}

#[test]
fn test_truncated_frame_does_not_stop_the_session() {
    let (mut session, sink) = new_session("switch-1");
    session.handle_topology(tunnel_only());
    session.handle_command(1, cluster::PROPRIETARY_DATAPOINT, tunnel_command::DATA_REPORT, &[0, 1, 1, 1, 0, 4, 1]);
    assert_eq!(sink.named("decode_failed").len(), 1);

    let frame = DatapointFrame::new(2).with_datapoint(Datapoint::new(2, DatapointValue::Value(255)));
    session.handle_command(1, cluster::PROPRIETARY_DATAPOINT, tunnel_command::DATA_REPORT, &report(frame));
    assert_eq!(
        session.store().capability_value(names::DIM),
        Some(AttributeValue::Float(1.0))
    );
}

#[test]
fn test_private_cluster_grows_dialects() {
    let (mut session, sink) = new_session("aqara-1");
    session.handle_topology(TopologySnapshot::new(vec![EndpointTopology::new(1)
        .with_profile(0x0104)
        .with_inputs([cluster::BASIC, cluster::TEMPERATURE_MEASUREMENT])]));
    assert_eq!(sink.named("dialect_detected").len(), 1);

    session.handle_attribute(1, cluster::XIAOMI_PRIVATE, 0x00F7, AttributeValue::Binary(vec![1]));
    session.handle_attribute(1, cluster::XIAOMI_PRIVATE, 0x00F7, AttributeValue::Binary(vec![1]));
    assert!(session.profile().dialects.private_vendors.contains("XIAOMI"));
    assert!(session.profile().dialects.is_standard());
    assert_eq!(sink.named("dialect_detected").len(), 2);
}

// ============================================================================
// Zone enrollment
// ============================================================================

#[test]
fn test_enroll_request_is_answered() {
    let (mut session, sink) = new_session("pir-1");
    let out = session.handle_command(1, cluster::IAS_ZONE, zone::command::ENROLL_REQUEST, &[0x0D, 0x00, 0x02, 0x10]);

    assert_eq!(out.len(), 1);
    let Operation::SendCommand { cluster: c, command, payload, .. } = &out[0].operation else {
        panic!("expected enroll response");
    };
    assert_eq!(*c, cluster::IAS_ZONE);
    assert_eq!(*command, zone::command::ENROLL_RESPONSE);
    assert_eq!(payload[0], zone::ENROLL_SUCCESS);
    let zone_id = payload[1];
    assert_eq!(zone_id, 1);

    let state = session.zones().get(1).unwrap();
    assert_eq!(state.status(), EnrollmentStatus::EnrollRequested);
    assert_eq!(state.zone_id, zone_id);
    assert_eq!(state.alarm_capability(), names::ALARM_MOTION);

    let transitions = sink.named("zone_enrollment");
    assert!(matches!(
        transitions[0],
        MeshEvent::ZoneEnrollment {
            from: EnrollmentStatus::Unenrolled,
            to: EnrollmentStatus::EnrollRequested,
            ..
        }
    ));

    // Asking again gets the same id and no new transition
    let again = session.handle_command(1, cluster::IAS_ZONE, zone::command::ENROLL_REQUEST, &[0x0D, 0x00]);
    assert!(matches!(
        &again[0].operation,
        Operation::SendCommand { payload, .. } if payload[1] == zone_id
    ));
    assert_eq!(sink.named("zone_enrollment").len(), 1);
}

#[test]
fn test_zone_ids_are_sequential_per_endpoint() {
    let (mut session, _sink) = new_session("multi-1");
    session.handle_topology(TopologySnapshot::new(vec![
        EndpointTopology::new(1).with_inputs([cluster::IAS_ZONE]),
        EndpointTopology::new(2).with_inputs([cluster::IAS_ZONE]),
    ]));
    assert_eq!(session.zones().get(1).unwrap().zone_id, 1);
    assert_eq!(session.zones().get(2).unwrap().zone_id, 2);
}

#[test]
fn test_zone_status_never_regresses() {
    // Small LCG so the sequence is reproducible
    let mut state: u32 = 0x2545_F491;
    let mut next = move || {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        (state >> 16) as u8
    };

    for _ in 0..50 {
        let (mut session, _sink) = new_session("zone-1");
        let mut previous = EnrollmentStatus::Unenrolled;
        for _ in 0..30 {
            match next() % 5 {
                0 => {
                    session.handle_command(1, cluster::IAS_ZONE, zone::command::ENROLL_REQUEST, &[0x15, 0x00]);
                }
                1 => {
                    let status = u16::from(next());
                    session.handle_command(
                        1,
                        cluster::IAS_ZONE,
                        zone::command::STATUS_CHANGE_NOTIFICATION,
                        &status.to_le_bytes(),
                    );
                }
                2 => {
                    session.handle_attribute(
                        1,
                        cluster::IAS_ZONE,
                        zone::attr::ZONE_STATE,
                        AttributeValue::Integer(i64::from(next() % 2)),
                    );
                }
                3 => {
                    session.handle_attribute(
                        1,
                        cluster::IAS_ZONE,
                        zone::attr::ZONE_STATUS,
                        AttributeValue::Integer(i64::from(next())),
                    );
                }
                _ => {
                    // Malformed notification
                    session.handle_command(1, cluster::IAS_ZONE, zone::command::STATUS_CHANGE_NOTIFICATION, &[]);
                }
            }
            let current = session.zones().get(1).unwrap().status();
            assert!(current >= previous, "{:?} regressed to {:?}", previous, current);
            previous = current;
        }
    }
}

#[test]
fn test_polled_status_updates_bitmap_only() {
    let (mut session, _sink) = new_session("door-1");
    session.handle_attribute(1, cluster::IAS_ZONE, zone::attr::ZONE_TYPE, AttributeValue::Integer(0x0015));
    session.handle_attribute(
        1,
        cluster::IAS_ZONE,
        zone::attr::ZONE_STATUS,
        AttributeValue::Integer(i64::from(status_bit::ALARM1 | status_bit::TAMPER)),
    );

    let state = session.zones().get(1).unwrap();
    assert_eq!(state.status(), EnrollmentStatus::Unenrolled);
    assert_eq!(state.last_alarm_bitmap, Some(0x0005));
    assert_eq!(
        session.store().capability_value(names::ALARM_CONTACT),
        Some(AttributeValue::Boolean(true))
    );
    assert_eq!(
        session.store().capability_value(names::ALARM_TAMPER),
        Some(AttributeValue::Boolean(true))
    );
}

// ============================================================================
// Profile learning
// ============================================================================

#[test]
fn test_unknown_climate_sensor_is_learned() {
    let (mut session, sink) = new_session("climate-1");
    session.handle_topology(tunnel_only());
    for (seq, (t, h)) in [(215, 48), (217, 47), (220, 45)].into_iter().enumerate() {
        let frame = DatapointFrame::new(seq as u16)
            .with_datapoint(Datapoint::new(102, DatapointValue::Value(t)))
            .with_datapoint(Datapoint::new(103, DatapointValue::Value(h)));
        session.handle_command(1, cluster::PROPRIETARY_DATAPOINT, tunnel_command::DATA_REPORT, &report(frame));
    }

    assert_eq!(session.learner().classify().class, DeviceClass::EnvironmentalSensor);
    let learned = session.learn();
    assert_eq!(learned.device_class, DeviceClass::EnvironmentalSensor);
    assert!(learned.capabilities.contains(&names::MEASURE_TEMPERATURE.to_string()));
    assert!(learned.capabilities.contains(&names::MEASURE_HUMIDITY.to_string()));
    assert_eq!(session.learner().history(102).unwrap().count, 3);
    assert!(session.profile().learned_at.is_some());
    assert_eq!(sink.named("profile_learned").len(), 1);
}

#[test]
fn test_basic_identity_feeds_identifier() {
    let (mut session, _sink) = new_session("dimmer-1");
    session.handle_attribute(1, cluster::BASIC, 0x0004, AttributeValue::String("IKEA of Sweden".into()));
    session.handle_attribute(1, cluster::BASIC, 0x0005, AttributeValue::String("TRADFRI bulb".into()));
    session.handle_attribute(1, cluster::ON_OFF, 0x0000, AttributeValue::Boolean(true));
    session.handle_attribute(1, cluster::LEVEL_CONTROL, 0x0000, AttributeValue::Integer(127));

    let learned = session.learn();
    assert!(learned.identifier.starts_with("ikea_of_sweden_tradfri_bulb_"));
    assert_eq!(learned.device_class, DeviceClass::LightDimmer);
    assert_eq!(session.profile().model.as_deref(), Some("TRADFRI bulb"));
}

// ============================================================================
// Battery gating
// ============================================================================

#[test]
fn test_no_battery_capability_without_signal() {
    let (mut session, _sink) = new_session("plug-1");
    session.handle_topology(TopologySnapshot::new(vec![EndpointTopology::new(1)
        .with_inputs([cluster::BASIC, cluster::POWER_CONFIG, cluster::ON_OFF])]));
    // Declared battery powered, but never reports a battery value
    session.handle_attribute(1, cluster::BASIC, 0x0007, AttributeValue::Integer(3));
    session.handle_attribute(1, cluster::ON_OFF, 0x0000, AttributeValue::Boolean(false));
    session.handle_attribute(1, cluster::POWER_CONFIG, 0x0020, AttributeValue::Integer(30));

    let caps = session.capabilities();
    assert!(!caps.contains(&names::MEASURE_BATTERY.to_string()));
    assert!(!caps.contains(&names::ALARM_BATTERY.to_string()));
    assert!(session.power().chemistry().is_empty());
}

#[test]
fn test_mains_device_ignores_battery_datapoint() {
    let (mut session, _sink) = new_session("plug-2");
    session.handle_topology(tunnel_only());
    session.handle_attribute(1, cluster::BASIC, 0x0007, AttributeValue::Integer(1));
    let frame = DatapointFrame::new(1)
        .with_datapoint(Datapoint::new(1, DatapointValue::Bool(true)))
        .with_datapoint(Datapoint::new(4, DatapointValue::Value(80)));
    session.handle_command(1, cluster::PROPRIETARY_DATAPOINT, tunnel_command::DATA_REPORT, &report(frame));

    assert_eq!(session.capabilities(), vec![names::ONOFF.to_string()]);
    assert!(!session.power().battery_signaled());
}

#[test]
fn test_battery_report_grants_and_sets_chemistry() {
    let (mut session, _sink) = new_session("remote-1");
    session.handle_topology(TopologySnapshot::new(vec![EndpointTopology::new(1)
        .with_inputs([cluster::BASIC, cluster::POWER_CONFIG])
        .with_outputs([cluster::ON_OFF])]));
    session.handle_attribute(1, cluster::POWER_CONFIG, 0x0021, AttributeValue::Integer(180));

    assert_eq!(
        session.store().capability_value(names::MEASURE_BATTERY),
        Some(AttributeValue::Float(90.0))
    );
    assert_eq!(session.power().chemistry(), vec!["CR2032".to_string()]);
}

#[test]
fn test_battery_low_bit_signals_battery() {
    let (mut session, _sink) = new_session("smoke-1");
    session.handle_command(1, cluster::IAS_ZONE, zone::command::ENROLL_REQUEST, &[0x28, 0x00]);
    session.handle_command(
        1,
        cluster::IAS_ZONE,
        zone::command::STATUS_CHANGE_NOTIFICATION,
        &status_bit::BATTERY_LOW.to_le_bytes(),
    );

    assert_eq!(
        session.store().capability_value(names::ALARM_BATTERY),
        Some(AttributeValue::Boolean(true))
    );
    assert_eq!(
        session.store().capability_value(names::ALARM_SMOKE),
        Some(AttributeValue::Boolean(false))
    );
    assert!(!session.power().chemistry().is_empty());
}
