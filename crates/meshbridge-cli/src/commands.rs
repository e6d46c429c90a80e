//! Subcommand implementations.
//!
//! Each command returns a JSON document; `main` only prints it.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use meshbridge_core::datapoint::decode_all;
use meshbridge_core::time::{FixedZone, LocalZone, OffsetProvider, SyncEpoch};
use meshbridge_core::{DatapointFrame, EngineConfig, MemorySink, TimeResponder};
use meshbridge_devices::{DeviceSession, InboundEvent, OutboundRequest};

/// Parse a hex string, ignoring whitespace and an optional `0x` prefix.
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let cleaned = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
        .unwrap_or(&cleaned);
    hex::decode(cleaned).with_context(|| format!("invalid hex input '{}'", input))
}

/// Decode a tunnel payload.
///
/// With `bare` the input carries no sequence header.
pub fn decode(input: &str, bare: bool) -> Result<Value> {
    let bytes = parse_hex(input)?;
    if bare {
        let datapoints = decode_all(&bytes).context("failed to decode datapoints")?;
        return Ok(json!({ "datapoints": datapoints }));
    }
    let frame = DatapointFrame::decode(&bytes).context("failed to decode frame")?;
    Ok(serde_json::to_value(frame)?)
}

/// Recorded inbound traffic for one device.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Trace {
    Detailed {
        #[serde(default = "default_device_id")]
        device_id: String,
        #[serde(default)]
        vendor: Option<String>,
        #[serde(default)]
        model: Option<String>,
        events: Vec<InboundEvent>,
    },
    Events(Vec<InboundEvent>),
}

fn default_device_id() -> String {
    "replay".to_string()
}

impl Trace {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read trace {}", path.display()))?;
        Self::from_json_str(&content).with_context(|| format!("invalid trace {}", path.display()))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }
}

fn describe_outbound(request: &OutboundRequest) -> Value {
    json!({
        "id": request.id.to_string(),
        "operation": request.operation,
    })
}

/// Run a trace through a fresh session.
///
/// Outbound requests are listed but never completed.
pub fn replay(trace: Trace, config: &EngineConfig) -> Result<Value> {
    let (device_id, vendor, model, events) = match trace {
        Trace::Detailed {
            device_id,
            vendor,
            model,
            events,
        } => (device_id, vendor, model, events),
        Trace::Events(events) => (default_device_id(), None, None, events),
    };

    let sink = Arc::new(MemorySink::new());
    let mut session =
        DeviceSession::new(device_id.clone(), config, sink.clone()).with_identity(vendor, model);

    tracing::info!(
        category = "replay",
        device_id = %device_id,
        events = events.len(),
        "Replaying trace"
    );

    let mut outbound = Vec::new();
    for event in events {
        for request in session.handle(event) {
            outbound.push(describe_outbound(&request));
        }
    }
    let learned = session.learn();

    Ok(json!({
        "device_id": device_id,
        "capabilities": session.store().to_json(),
        "dialects": session.profile().dialects,
        "zones": session.zones().iter().collect::<Vec<_>>(),
        "power": session.power().summary(),
        "learned_profile": learned,
        "outbound": outbound,
        "events": sink.events(),
    }))
}

/// Largest UTC offset accepted by `time`, one day.
const MAX_OFFSET_MINUTES: i32 = 24 * 60;

/// Current time answer, with the tunnel sync payload for `seq`.
pub fn time(
    offset_minutes: Option<i32>,
    epoch: SyncEpoch,
    seq: u16,
    now: DateTime<Utc>,
) -> Result<Value> {
    let zone: Arc<dyn OffsetProvider> = match offset_minutes {
        Some(minutes) => {
            if !(-MAX_OFFSET_MINUTES..=MAX_OFFSET_MINUTES).contains(&minutes) {
                bail!(
                    "offset of {} minutes is out of range (max {} either way)",
                    minutes,
                    MAX_OFFSET_MINUTES
                );
            }
            Arc::new(FixedZone(minutes * 60))
        }
        None => Arc::new(LocalZone),
    };
    let snapshot = TimeResponder::with_zone(zone).time_at(now);
    let attributes: serde_json::Map<String, Value> = snapshot
        .cluster_attributes()
        .into_iter()
        .map(|(id, value)| (format!("0x{:04x}", id), value.to_json()))
        .collect();

    Ok(json!({
        "snapshot": snapshot,
        "epoch": epoch,
        "sync_payload": hex::encode(snapshot.sync_payload(epoch)),
        "sync_response": hex::encode(snapshot.sync_response(seq, epoch)),
        "time_cluster": attributes,
    }))
}
