//! Incremental map-marker reconciliation.
//!
//! Markers live in an arena owned by [`MarkerEngine`] and are addressed by
//! device id. A pass creates markers for newly positioned devices, moves
//! existing ones in place, and removes markers only for devices that left the
//! device set. Rendering goes through [`MapRenderer`].

use crate::metrics::MARKERS;
use crate::model::{Device, DeviceStatus, LatLng, LatestTelemetry, TelemetryReading};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info};

pub const SELECTED_OPACITY: f64 = 1.0;
pub const UNSELECTED_OPACITY: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub south_west: LatLng,
    pub north_east: LatLng,
}

impl Bounds {
    pub fn around(points: impl IntoIterator<Item = LatLng>) -> Option<Self> {
        let mut points = points.into_iter();
        let first = points.next()?;
        let mut bounds = Bounds {
            south_west: first,
            north_east: first,
        };
        for p in points {
            bounds.south_west.lat = bounds.south_west.lat.min(p.lat);
            bounds.south_west.lon = bounds.south_west.lon.min(p.lon);
            bounds.north_east.lat = bounds.north_east.lat.max(p.lat);
            bounds.north_east.lon = bounds.north_east.lon.max(p.lon);
        }
        Some(bounds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FitOptions {
    pub padding: (u32, u32),
    pub max_zoom: u8,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            padding: (50, 50),
            max_zoom: 13,
        }
    }
}

/// Popup content of a marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerContent {
    pub name: String,
    pub model: String,
    pub status: DeviceStatus,
    pub battery_pct: Option<f64>,
    pub speed_kmh: Option<f64>,
}

impl MarkerContent {
    pub fn new(device: &Device, reading: &TelemetryReading) -> Self {
        Self {
            name: device.name.clone(),
            model: device.model.clone(),
            status: device.status,
            battery_pct: reading.battery_pct,
            speed_kmh: reading.speed_mps.map(|mps| (mps * 3.6 * 10.0).round() / 10.0),
        }
    }
}

impl fmt::Display for MarkerContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        writeln!(f, "{}", self.model)?;
        write!(f, "Status: {}", self.status.as_str())?;
        if let Some(battery) = self.battery_pct {
            write!(f, "\nBattery: {}%", battery)?;
        }
        if let Some(speed) = self.speed_kmh {
            write!(f, "\nSpeed: {:.1} km/h", speed)?;
        }
        Ok(())
    }
}

/// Drawing surface the engine drives.
pub trait MapRenderer {
    type Handle;

    fn create(&mut self, device_id: &str, position: LatLng) -> Self::Handle;

    /// Routes clicks on the marker to selection of `device_id`.
    fn bind_select(&mut self, handle: &Self::Handle, device_id: &str);

    fn set_position(&mut self, handle: &Self::Handle, position: LatLng);

    fn set_content(&mut self, handle: &Self::Handle, content: &MarkerContent);

    fn set_opacity(&mut self, handle: &Self::Handle, opacity: f64);

    fn open_popup(&mut self, handle: &Self::Handle);

    fn close_popup(&mut self, handle: &Self::Handle);

    fn remove(&mut self, handle: Self::Handle);

    fn fit_bounds(&mut self, bounds: Bounds, options: FitOptions);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkerId(usize);

#[derive(Debug)]
pub struct Marker<H> {
    device_id: String,
    handle: H,
    position: LatLng,
    opacity: f64,
    selected: bool,
}

impl<H> Marker<H> {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn position(&self) -> LatLng {
        self.position
    }

    pub fn opacity(&self) -> f64 {
        self.opacity
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub fitted: bool,
}

pub struct MarkerEngine<R: MapRenderer> {
    renderer: R,
    slots: Vec<Option<Marker<R::Handle>>>,
    free: Vec<usize>,
    index: HashMap<String, MarkerId>,
    fit: FitOptions,
    fitted: bool,
}

impl<R: MapRenderer> MarkerEngine<R> {
    pub fn new(renderer: R) -> Self {
        Self::with_fit(renderer, FitOptions::default())
    }

    pub fn with_fit(renderer: R, fit: FitOptions) -> Self {
        Self {
            renderer,
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            fit,
            fitted: false,
        }
    }

    /// Brings markers in line with `devices` and their latest readings.
    ///
    /// A device without a positioned reading keeps whatever marker it had.
    /// Viewport auto-fit happens once, the first time any marker exists.
    pub fn reconcile(
        &mut self,
        devices: &[Device],
        latest: &LatestTelemetry,
        selected: Option<&str>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for device in devices {
            let Some(reading) = latest.get(&device.id).and_then(Option::as_ref) else {
                continue;
            };
            let Some(position) = reading.position() else {
                continue;
            };
            let content = MarkerContent::new(device, reading);

            match self.index.get(&device.id).copied() {
                Some(id) => {
                    self.update(id, position, &content);
                    report.updated += 1;
                }
                None => {
                    self.create(&device.id, position, &content);
                    report.created += 1;
                }
            }
        }

        let present: HashSet<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        let departed: Vec<String> = self
            .index
            .keys()
            .filter(|id| !present.contains(id.as_str()))
            .cloned()
            .collect();
        for device_id in departed {
            self.remove(&device_id);
            report.removed += 1;
        }

        self.apply_selection(selected);

        if !self.fitted && !self.index.is_empty() {
            if let Some(bounds) = Bounds::around(self.markers().map(|m| m.position)) {
                info!("Fitting viewport to {} markers", self.index.len());
                self.renderer.fit_bounds(bounds, self.fit);
                self.fitted = true;
                report.fitted = true;
            }
        }

        MARKERS.set(self.index.len() as f64);
        debug!(
            "Reconciled markers: {} created, {} updated, {} removed",
            report.created, report.updated, report.removed
        );
        report
    }

    fn create(&mut self, device_id: &str, position: LatLng, content: &MarkerContent) {
        let handle = self.renderer.create(device_id, position);
        self.renderer.bind_select(&handle, device_id);
        self.renderer.set_content(&handle, content);

        let marker = Marker {
            device_id: device_id.to_string(),
            handle,
            position,
            opacity: UNSELECTED_OPACITY,
            selected: false,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(marker);
                slot
            }
            None => {
                self.slots.push(Some(marker));
                self.slots.len() - 1
            }
        };
        self.index.insert(device_id.to_string(), MarkerId(slot));
    }

    fn update(&mut self, id: MarkerId, position: LatLng, content: &MarkerContent) {
        if let Some(marker) = self.slots[id.0].as_mut() {
            self.renderer.set_position(&marker.handle, position);
            marker.position = position;
            self.renderer.set_content(&marker.handle, content);
        }
    }

    fn remove(&mut self, device_id: &str) {
        if let Some(id) = self.index.remove(device_id) {
            if let Some(marker) = self.slots[id.0].take() {
                self.renderer.remove(marker.handle);
            }
            self.free.push(id.0);
        }
    }

    fn apply_selection(&mut self, selected: Option<&str>) {
        for marker in self.slots.iter_mut().flatten() {
            marker.selected = selected == Some(marker.device_id.as_str());
            marker.opacity = if marker.selected {
                SELECTED_OPACITY
            } else {
                UNSELECTED_OPACITY
            };
            self.renderer.set_opacity(&marker.handle, marker.opacity);
            if marker.selected {
                self.renderer.open_popup(&marker.handle);
            } else {
                self.renderer.close_popup(&marker.handle);
            }
        }
    }

    pub fn get(&self, device_id: &str) -> Option<&Marker<R::Handle>> {
        let id = self.index.get(device_id)?;
        self.slots[id.0].as_ref()
    }

    pub fn markers(&self) -> impl Iterator<Item = &Marker<R::Handle>> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn has_fitted(&self) -> bool {
        self.fitted
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedMarker {
    pub device_id: String,
    pub position: LatLng,
    pub opacity: f64,
    pub popup_open: bool,
    pub popup: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Viewport {
    pub bounds: Bounds,
    pub options: FitOptions,
}

/// Headless renderer that keeps the drawn scene in memory.
#[derive(Debug, Default)]
pub struct MemoryRenderer {
    markers: HashMap<u64, RenderedMarker>,
    next_handle: u64,
    viewport: Option<Viewport>,
}

impl MemoryRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drawn markers ordered by device id.
    pub fn scene(&self) -> Vec<RenderedMarker> {
        let mut scene: Vec<RenderedMarker> = self.markers.values().cloned().collect();
        scene.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        scene
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }
}

impl MapRenderer for MemoryRenderer {
    type Handle = u64;

    fn create(&mut self, device_id: &str, position: LatLng) -> u64 {
        self.next_handle += 1;
        self.markers.insert(
            self.next_handle,
            RenderedMarker {
                device_id: device_id.to_string(),
                position,
                opacity: 1.0,
                popup_open: false,
                popup: String::new(),
            },
        );
        self.next_handle
    }

    fn bind_select(&mut self, _handle: &u64, _device_id: &str) {}

    fn set_position(&mut self, handle: &u64, position: LatLng) {
        if let Some(marker) = self.markers.get_mut(handle) {
            marker.position = position;
        }
    }

    fn set_content(&mut self, handle: &u64, content: &MarkerContent) {
        if let Some(marker) = self.markers.get_mut(handle) {
            marker.popup = content.to_string();
        }
    }

    fn set_opacity(&mut self, handle: &u64, opacity: f64) {
        if let Some(marker) = self.markers.get_mut(handle) {
            marker.opacity = opacity;
        }
    }

    fn open_popup(&mut self, handle: &u64) {
        if let Some(marker) = self.markers.get_mut(handle) {
            marker.popup_open = true;
        }
    }

    fn close_popup(&mut self, handle: &u64) {
        if let Some(marker) = self.markers.get_mut(handle) {
            marker.popup_open = false;
        }
    }

    fn remove(&mut self, handle: u64) {
        self.markers.remove(&handle);
    }

    fn fit_bounds(&mut self, bounds: Bounds, options: FitOptions) {
        self.viewport = Some(Viewport { bounds, options });
    }
}
