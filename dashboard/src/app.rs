//! Headless dashboard runtime.
//!
//! Holds observers on the dashboard's queries for as long as it runs and folds
//! their data into a [`DashboardSnapshot`] after every completed fetch.

use crate::cache::Observer;
use crate::markers::{MarkerEngine, MemoryRenderer, RenderedMarker, Viewport};
use crate::model::{Device, Event, LatestTelemetry};
use crate::queries::FleetQueries;
use crate::rest::FleetApi;
use crate::views::{compute_stats, sort_devices, FleetStats};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

/// Everything a client needs to draw the dashboard.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DashboardSnapshot {
    pub stats: FleetStats,
    /// Sorted for display.
    pub devices: Vec<Device>,
    pub events: Vec<Event>,
    pub markers: Vec<RenderedMarker>,
    pub viewport: Option<Viewport>,
    pub selected_device: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Shared view of a running [`Dashboard`].
#[derive(Clone)]
pub struct DashboardHandle {
    snapshot: Arc<RwLock<DashboardSnapshot>>,
    selection: Arc<watch::Sender<Option<String>>>,
}

impl DashboardHandle {
    pub fn snapshot(&self) -> DashboardSnapshot {
        self.snapshot.read().clone()
    }

    /// Selects a device on the map, or clears the selection.
    pub fn select(&self, device_id: Option<String>) {
        self.selection.send_replace(device_id);
    }
}

pub struct Dashboard<A: FleetApi> {
    queries: FleetQueries<A>,
    events_limit: u32,
    engine: MarkerEngine<MemoryRenderer>,
    snapshot: Arc<RwLock<DashboardSnapshot>>,
    selection: watch::Receiver<Option<String>>,
}

impl<A: FleetApi> Dashboard<A> {
    pub fn new(queries: FleetQueries<A>, events_limit: u32) -> (Self, DashboardHandle) {
        let (selection_tx, selection) = watch::channel(None);
        let snapshot = Arc::new(RwLock::new(DashboardSnapshot::default()));
        let dashboard = Self {
            queries,
            events_limit,
            engine: MarkerEngine::new(MemoryRenderer::new()),
            snapshot: snapshot.clone(),
            selection,
        };
        let handle = DashboardHandle {
            snapshot,
            selection: Arc::new(selection_tx),
        };
        (dashboard, handle)
    }

    /// Runs until `shutdown` fires or its sender is dropped. Dropping the
    /// observers on exit stops every poller this dashboard started.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        info!("Starting dashboard");
        let mut devices = self.queries.devices().observe();
        let mut events = self.queries.dashboard_events(self.events_limit).observe();
        let mut telemetry: Option<Observer<LatestTelemetry>> = None;
        let mut tracked: Vec<String> = Vec::new();

        loop {
            let device_ids: Vec<String> = devices
                .data()
                .map(|list| list.iter().map(|d| d.id.clone()).collect())
                .unwrap_or_default();
            if device_ids != tracked {
                debug!("Device set changed, tracking {} devices", device_ids.len());
                telemetry = if device_ids.is_empty() {
                    None
                } else {
                    Some(self.queries.all_telemetry(&device_ids).observe())
                };
                tracked = device_ids;
                let pruned = self.queries.client().prune();
                if pruned > 0 {
                    debug!("Pruned {} unused queries", pruned);
                }
            }

            self.render(&devices, &events, telemetry.as_ref());

            tokio::select! {
                _ = &mut shutdown => break,
                _ = devices.changed() => {}
                _ = events.changed() => {}
                _ = telemetry_changed(&mut telemetry) => {}
                changed = self.selection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Dashboard stopped");
    }

    fn render(
        &mut self,
        devices: &Observer<Vec<Device>>,
        events: &Observer<Vec<Event>>,
        telemetry: Option<&Observer<LatestTelemetry>>,
    ) {
        let devices = devices.data().unwrap_or_default();
        let events = events.data().unwrap_or_default();
        let latest = telemetry.and_then(Observer::data).unwrap_or_default();
        let selected = self.selection.borrow_and_update().clone();

        self.engine
            .reconcile(&devices, &latest, selected.as_deref());

        let renderer = self.engine.renderer();
        *self.snapshot.write() = DashboardSnapshot {
            stats: compute_stats(&devices, &events),
            devices: sort_devices(&devices),
            events: (*events).clone(),
            markers: renderer.scene(),
            viewport: renderer.viewport(),
            selected_device: selected,
            updated_at: Some(Utc::now()),
        };
    }
}

async fn telemetry_changed(telemetry: &mut Option<Observer<LatestTelemetry>>) {
    match telemetry {
        Some(observer) => {
            observer.changed().await;
        }
        None => std::future::pending::<()>().await,
    }
}
