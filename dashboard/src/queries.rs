use crate::cache::{Query, QueryClient, QueryKey, QueryOptions};
use crate::errors::Result;
use crate::model::{Device, Event, EventType, LatestTelemetry, Severity};
use crate::rest::{EventQuery, FleetApi};
use crate::sync::QueryTarget;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const DEVICES_INTERVAL: Duration = Duration::from_secs(10);
pub const EVENTS_INTERVAL: Duration = Duration::from_secs(5);
pub const TELEMETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const EVENTS_PAGE_LIMIT: u32 = 100;

/// Filter tuple of the events page. `None` means "all".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EventFilter {
    pub kind: Option<EventType>,
    pub severity: Option<Severity>,
    pub show_acknowledged: bool,
}

impl EventFilter {
    fn key(&self) -> QueryKey {
        QueryKey::new(QueryTarget::Events.as_str())
            .param(self.kind.map(|k| k.as_str()).unwrap_or("all"))
            .param(self.severity.map(|s| s.as_str()).unwrap_or("all"))
            .param(self.show_acknowledged)
    }

    fn to_query(&self) -> EventQuery {
        EventQuery {
            kind: self.kind,
            severity: self.severity,
            acknowledged: if self.show_acknowledged { None } else { Some(false) },
            limit: Some(EVENTS_PAGE_LIMIT),
            ..Default::default()
        }
    }
}

/// Latest reading for every device, fetched concurrently.
///
/// A device whose request fails is reported with no reading; the batch as a
/// whole never fails.
pub async fn fetch_latest_for_all<A: FleetApi + ?Sized>(
    api: &A,
    device_ids: &[String],
) -> LatestTelemetry {
    let readings = join_all(device_ids.iter().map(|device_id| async move {
        match api.latest_telemetry(device_id).await {
            Ok(reading) => (device_id.clone(), reading),
            Err(e) => {
                warn!("Failed to fetch telemetry for {}: {}", device_id, e);
                (device_id.clone(), None)
            }
        }
    }))
    .await;
    readings.into_iter().collect()
}

/// The dashboard's queries, bound to one API client and one cache.
pub struct FleetQueries<A: FleetApi> {
    api: Arc<A>,
    client: QueryClient,
}

impl<A: FleetApi> Clone for FleetQueries<A> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            client: self.client.clone(),
        }
    }
}

impl<A: FleetApi> FleetQueries<A> {
    pub fn new(api: Arc<A>, client: QueryClient) -> Self {
        Self { api, client }
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    pub fn devices(&self) -> Arc<Query<Vec<Device>>> {
        let api = self.api.clone();
        self.client.query(
            QueryKey::new(QueryTarget::Devices.as_str()),
            QueryOptions::every(DEVICES_INTERVAL),
            move || {
                let api = api.clone();
                async move { api.list_devices().await }
            },
        )
    }

    /// Unacknowledged events feeding the dashboard stats.
    pub fn dashboard_events(&self, limit: u32) -> Arc<Query<Vec<Event>>> {
        let api = self.api.clone();
        self.client.query(
            QueryKey::new(QueryTarget::Events.as_str()),
            QueryOptions::every(EVENTS_INTERVAL),
            move || {
                let api = api.clone();
                let query = EventQuery {
                    acknowledged: Some(false),
                    limit: Some(limit),
                    ..Default::default()
                };
                async move { api.list_events(&query).await }
            },
        )
    }

    pub fn events(&self, filter: &EventFilter) -> Arc<Query<Vec<Event>>> {
        let api = self.api.clone();
        let query = filter.to_query();
        self.client.query(
            filter.key(),
            QueryOptions::every(EVENTS_INTERVAL),
            move || {
                let api = api.clone();
                let query = query.clone();
                async move { api.list_events(&query).await }
            },
        )
    }

    /// Latest readings for exactly this device set; the key changes with it.
    pub fn all_telemetry(&self, device_ids: &[String]) -> Arc<Query<LatestTelemetry>> {
        let api = self.api.clone();
        let ids = device_ids.to_vec();
        self.client.query(
            QueryKey::new(QueryTarget::AllTelemetry.as_str()).param(device_ids.join(",")),
            QueryOptions::every(TELEMETRY_INTERVAL),
            move || {
                let api = api.clone();
                let ids = ids.clone();
                async move {
                    if ids.is_empty() {
                        return Ok(LatestTelemetry::new());
                    }
                    Ok(fetch_latest_for_all(api.as_ref(), &ids).await)
                }
            },
        )
    }

    /// Acknowledges an event, then invalidates every events query.
    ///
    /// A failure changes nothing in the cache; the event stays unacknowledged.
    pub async fn acknowledge(&self, event_id: &str, acknowledged_by: &str) -> Result<Event> {
        match self.api.acknowledge_event(event_id, acknowledged_by).await {
            Ok(event) => {
                info!("Event {} acknowledged by {}", event_id, acknowledged_by);
                self.client
                    .invalidate_queries(QueryTarget::Events.as_str());
                Ok(event)
            }
            Err(e) => {
                error!("Failed to acknowledge event {}: {}", event_id, e);
                Err(e)
            }
        }
    }
}
