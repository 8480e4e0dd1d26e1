use crate::errors::{Error, Result};
use crate::model::{Device, Event, EventType, Severity, TelemetryReading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryQuery {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl TelemetryQuery {
    pub fn latest() -> Self {
        Self {
            limit: Some(1),
            ..Default::default()
        }
    }

    fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(start) = &self.start_time {
            pairs.push(("start_time", start.to_rfc3339()));
        }
        if let Some(end) = &self.end_time {
            pairs.push(("end_time", end.to_rfc3339()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQuery {
    pub device_id: Option<String>,
    pub kind: Option<EventType>,
    pub severity: Option<Severity>,
    pub acknowledged: Option<bool>,
    pub limit: Option<u32>,
}

impl EventQuery {
    fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(device_id) = &self.device_id {
            pairs.push(("device_id", device_id.clone()));
        }
        if let Some(kind) = self.kind {
            pairs.push(("type", kind.as_str().to_string()));
        }
        if let Some(severity) = self.severity {
            pairs.push(("severity", severity.as_str().to_string()));
        }
        if let Some(acknowledged) = self.acknowledged {
            pairs.push(("acknowledged", acknowledged.to_string()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        pairs
    }
}

#[derive(Debug, Serialize)]
struct AcknowledgeBody<'a> {
    acknowledged_by: &'a str,
}

/// Read/write surface of the fleet backend.
#[async_trait]
pub trait FleetApi: Send + Sync + 'static {
    async fn list_devices(&self) -> Result<Vec<Device>>;

    async fn get_device(&self, device_id: &str) -> Result<Device>;

    async fn telemetry(&self, device_id: &str, query: &TelemetryQuery)
        -> Result<Vec<TelemetryReading>>;

    /// Most recent reading by `ts`, as ordered by the backend.
    async fn latest_telemetry(&self, device_id: &str) -> Result<Option<TelemetryReading>> {
        let readings = self.telemetry(device_id, &TelemetryQuery::latest()).await?;
        Ok(readings.into_iter().next())
    }

    async fn list_events(&self, query: &EventQuery) -> Result<Vec<Event>>;

    async fn acknowledge_event(&self, event_id: &str, acknowledged_by: &str) -> Result<Event>;
}

/// `reqwest` implementation of [`FleetApi`].
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Appends `segments` to the base path, percent-encoding each one so an
    /// id can never add a path level or a query.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("Invalid API URL {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("API URL {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn request<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let res = builder.send().await?;
        let status = res.status();
        debug!("{} {}", status.as_u16(), res.url());

        if !status.is_success() {
            return Err(Error::from_status(status));
        }
        Ok(res.json::<T>().await?)
    }
}

#[async_trait]
impl FleetApi for ApiClient {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        self.request(self.http.get(self.url(&["devices"])?)).await
    }

    async fn get_device(&self, device_id: &str) -> Result<Device> {
        self.request(self.http.get(self.url(&["devices", device_id])?))
            .await
    }

    async fn telemetry(
        &self,
        device_id: &str,
        query: &TelemetryQuery,
    ) -> Result<Vec<TelemetryReading>> {
        let url = self.url(&["devices", device_id, "telemetry"])?;
        self.request(self.http.get(url).query(&query.to_pairs()))
            .await
    }

    async fn list_events(&self, query: &EventQuery) -> Result<Vec<Event>> {
        self.request(self.http.get(self.url(&["events"])?).query(&query.to_pairs()))
            .await
    }

    async fn acknowledge_event(&self, event_id: &str, acknowledged_by: &str) -> Result<Event> {
        let url = self.url(&["events", event_id, "acknowledge"])?;
        self.request(self.http.post(url).json(&AcknowledgeBody { acknowledged_by }))
            .await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/api/v1", addr)
    }

    fn reading_json(device_id: &str, id: i64) -> Value {
        json!({
            "id": id,
            "device_id": device_id,
            "ts": "2024-05-01T10:00:00Z",
            "lat": 40.7,
            "lon": -74.0,
            "speed_mps": 12.5
        })
    }

    #[tokio::test]
    async fn test_latest_telemetry_uses_limit_one() {
        let app = Router::new().route(
            "/api/v1/devices/:id/telemetry",
            get(
                |Path(id): Path<String>, Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q.get("limit").map(String::as_str), Some("1"));
                    Json(json!([reading_json(&id, 42)]))
                },
            ),
        );
        let client = ApiClient::new(serve(app).await);

        let reading = client.latest_telemetry("dev-1").await.unwrap().unwrap();
        assert_eq!(reading.id, 42);
        assert_eq!(reading.device_id, "dev-1");
    }

    #[tokio::test]
    async fn test_latest_telemetry_empty() {
        let app = Router::new().route(
            "/api/v1/devices/:id/telemetry",
            get(|| async { Json(json!([])) }),
        );
        let client = ApiClient::new(serve(app).await);

        assert!(client.latest_telemetry("dev-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_event_filters_are_sent() {
        let app = Router::new().route(
            "/api/v1/events",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(q.get("acknowledged").map(String::as_str), Some("false"));
                assert_eq!(q.get("type").map(String::as_str), Some("IMPACT"));
                assert_eq!(q.get("limit").map(String::as_str), Some("100"));
                assert!(!q.contains_key("severity"));
                Json(json!([]))
            }),
        );
        let client = ApiClient::new(serve(app).await);

        let query = EventQuery {
            kind: Some(EventType::Impact),
            acknowledged: Some(false),
            limit: Some(100),
            ..Default::default()
        };
        assert!(client.list_events(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_success_status_is_request_error() {
        let app = Router::new().route(
            "/api/v1/devices/:id",
            get(|| async { (StatusCode::NOT_FOUND, Json(json!({"detail": "Device not found"}))) }),
        );
        let client = ApiClient::new(serve(app).await);

        match client.get_device("missing").await {
            Err(Error::Request { status, reason }) => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(reason, "Not Found");
            }
            other => panic!("expected request error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ids_stay_one_path_segment() {
        let app = Router::new()
            .route(
                "/api/v1/devices/:id",
                get(|Path(id): Path<String>| async move {
                    Json(json!({
                        "id": id,
                        "name": "Truck",
                        "model": "TR-200",
                        "status": "online",
                        "created_at": "2024-05-01T10:00:00Z"
                    }))
                }),
            )
            .route(
                "/api/v1/devices/:id/telemetry",
                get(|Path(id): Path<String>| async move { Json(json!([reading_json(&id, 7)])) }),
            );
        let client = ApiClient::new(serve(app).await);

        let device = client.get_device("depot/7").await.unwrap();
        assert_eq!(device.id, "depot/7");
        let reading = client.latest_telemetry("truck 9?x=1").await.unwrap().unwrap();
        assert_eq!(reading.device_id, "truck 9?x=1");
    }

    #[tokio::test]
    async fn test_unusable_base_url_is_config_error() {
        let client = ApiClient::new("not a url");
        assert!(matches!(client.list_devices().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_acknowledge_posts_operator() {
        let app = Router::new().route(
            "/api/v1/events/:id/acknowledge",
            post(|Path(id): Path<String>, Json(body): Json<Value>| async move {
                Json(json!({
                    "id": id,
                    "device_id": "dev-1",
                    "ts": "2024-05-01T10:00:00Z",
                    "type": "IMPACT",
                    "severity": "critical",
                    "payload": {"accel_g": 4.2},
                    "acknowledged_at": "2024-05-01T10:05:00Z",
                    "acknowledged_by": body["acknowledged_by"],
                    "created_at": "2024-05-01T10:00:00Z"
                }))
            }),
        );
        let client = ApiClient::new(serve(app).await);

        let event = client.acknowledge_event("e1", "ops").await.unwrap();
        assert!(event.is_acknowledged());
        assert_eq!(event.acknowledged_by.as_deref(), Some("ops"));
    }
}
