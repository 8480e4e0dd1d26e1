use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const EVENT_TYPES: [&str; 4] = ["LOW_BATTERY", "STALE", "IMPACT", "GEOFENCE"];
const SEVERITIES: [&str; 3] = ["info", "warning", "critical"];
const STATUSES: [&str; 3] = ["online", "offline", "degraded"];

/// Server-to-client push frame.
#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Frame {
    pub fn new(kind: &'static str, data: Value) -> Self {
        Self {
            kind,
            data: Some(data),
        }
    }
}

/// Client-to-server frame. Only the type matters to the simulator.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

/// Reply to a client frame, if it warrants one.
pub fn reply_to(frame: &ClientFrame) -> Option<Frame> {
    match frame.kind.as_str() {
        "subscribe" => Some(Frame::new("subscribed", json!({ "channels": frame.channels }))),
        "ping" => Some(Frame {
            kind: "pong",
            data: None,
        }),
        _ => None,
    }
}

/// A random notification for one of `num_devices` devices.
///
/// With probability `unknown_ratio` the frame has a type clients should ignore.
pub fn random_frame(rng: &mut impl Rng, num_devices: usize, unknown_ratio: f64) -> Frame {
    let device_id = format!("dev-{:03}", rng.gen_range(0..num_devices.max(1)));

    // NaN would panic in gen_bool
    let unknown_ratio = if unknown_ratio.is_nan() { 0.0 } else { unknown_ratio.clamp(0.0, 1.0) };
    if rng.gen_bool(unknown_ratio) {
        return Frame::new("maintenance_window", json!({ "device_id": device_id }));
    }

    match rng.gen_range(0..10) {
        0..=5 => Frame::new(
            "telemetry_update",
            json!({
                "device_id": device_id,
                "ts": Utc::now(),
                "lat": rng.gen_range(42.30..42.40),
                "lon": rng.gen_range(-71.10..-71.00),
                "battery_pct": rng.gen_range(5.0..100.0),
                "speed_mps": rng.gen_range(0.0..30.0),
            }),
        ),
        6 | 7 => Frame::new(
            "device_status_updated",
            json!({
                "device_id": device_id,
                "status": STATUSES[rng.gen_range(0..STATUSES.len())],
            }),
        ),
        8 => Frame::new(
            "events_updated",
            json!({ "count": rng.gen_range(1..5) }),
        ),
        _ => Frame::new(
            "event_created",
            json!({
                "id": uuid::Uuid::new_v4().to_string(),
                "device_id": device_id,
                "ts": Utc::now(),
                "type": EVENT_TYPES[rng.gen_range(0..EVENT_TYPES.len())],
                "severity": SEVERITIES[rng.gen_range(0..SEVERITIES.len())],
            }),
        ),
    }
}
