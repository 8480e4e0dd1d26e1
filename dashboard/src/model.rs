use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Connectivity status reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Degraded,
    #[serde(other)]
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Degraded => "degraded",
            DeviceStatus::Unknown => "unknown",
        }
    }
}

/// A fleet device as returned by `GET /devices`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    pub status: DeviceStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "device_metadata")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatLng {
    pub lat: f64,
    pub lon: f64,
}

/// A single telemetry sample. `ts` is the reading time on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub id: i64,
    pub device_id: String,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub battery_pct: Option<f64>,
    #[serde(default)]
    pub speed_mps: Option<f64>,
    #[serde(default)]
    pub temp_c: Option<f64>,
    #[serde(default)]
    pub accel_g: Option<f64>,
}

impl TelemetryReading {
    /// Position of the reading; a half-present coordinate counts as none.
    pub fn position(&self) -> Option<LatLng> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(LatLng { lat, lon }),
            _ => None,
        }
    }
}

/// Latest reading per device id; `None` when the device has none or its fetch failed.
pub type LatestTelemetry = HashMap<String, Option<TelemetryReading>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    LowBattery,
    Stale,
    Impact,
    Geofence,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::LowBattery => "LOW_BATTERY",
            EventType::Stale => "STALE",
            EventType::Impact => "IMPACT",
            EventType::Geofence => "GEOFENCE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Alert raised by the backend's detection rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub device_id: String,
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub severity: Severity,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }
}

/// Envelope of every server-to-client push frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl PushMessage {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: None,
        }
    }
}

/// Client-to-server subscription frame, sent once per connection.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeRequest {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub channels: Vec<&'static str>,
}

impl Default for SubscribeRequest {
    fn default() -> Self {
        Self {
            kind: "subscribe",
            channels: vec!["telemetry", "devices", "events"],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_device_from_backend_json() {
        let device: Device = serde_json::from_value(json!({
            "id": "dev-001",
            "name": "Truck 1",
            "model": "TR-200",
            "firmware_version": "1.4.2",
            "city": "Boston",
            "status": "degraded",
            "created_at": "2024-05-01T10:00:00+00:00",
            "last_seen_at": null,
            "device_metadata": {"fleet": "north"}
        }))
        .unwrap();

        assert_eq!(device.status, DeviceStatus::Degraded);
        assert!(device.last_seen_at.is_none());
        assert_eq!(device.metadata["fleet"], "north");
    }

    #[test]
    fn test_unknown_status() {
        let status: DeviceStatus = serde_json::from_value(json!("maintenance")).unwrap();
        assert_eq!(status, DeviceStatus::Unknown);
    }

    #[test]
    fn test_partial_coordinates_have_no_position() {
        let reading: TelemetryReading = serde_json::from_value(json!({
            "id": 7,
            "device_id": "dev-001",
            "ts": "2024-05-01T10:00:00Z",
            "lat": 42.36,
            "battery_pct": 81
        }))
        .unwrap();

        assert!(reading.position().is_none());
        assert_eq!(reading.battery_pct, Some(81.0));
    }

    #[test]
    fn test_event_type_wire_names() {
        let event: Event = serde_json::from_value(json!({
            "id": "4f8a",
            "device_id": "dev-001",
            "ts": "2024-05-01T10:00:00Z",
            "type": "LOW_BATTERY",
            "severity": "warning",
            "payload": {"battery_pct": 12},
            "created_at": "2024-05-01T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(event.kind, EventType::LowBattery);
        assert!(!event.is_acknowledged());
    }

    #[test]
    fn test_subscribe_frame() {
        let frame = serde_json::to_value(SubscribeRequest::default()).unwrap();
        assert_eq!(
            frame,
            json!({"type": "subscribe", "channels": ["telemetry", "devices", "events"]})
        );
    }

    #[test]
    fn test_push_message_ignores_extra_fields() {
        let msg: PushMessage =
            serde_json::from_str(r#"{"type":"events_updated","count":3}"#).unwrap();
        assert_eq!(msg.kind, "events_updated");
        assert!(msg.data.is_none());
    }
}
