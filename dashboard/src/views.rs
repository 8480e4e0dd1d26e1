use crate::model::{Device, DeviceStatus, Event, Severity};
use serde::Serialize;

fn status_rank(status: DeviceStatus) -> u8 {
    match status {
        DeviceStatus::Online => 0,
        DeviceStatus::Degraded => 1,
        DeviceStatus::Offline => 2,
        DeviceStatus::Unknown => 3,
    }
}

/// Online first, then most recently seen. Never-seen devices count as epoch.
pub fn sort_devices(devices: &[Device]) -> Vec<Device> {
    let mut sorted = devices.to_vec();
    // sort_by is stable; ties keep their input order
    sorted.sort_by(|a, b| {
        let seen_a = a.last_seen_at.map(|t| t.timestamp_millis()).unwrap_or(0);
        let seen_b = b.last_seen_at.map(|t| t.timestamp_millis()).unwrap_or(0);
        status_rank(a.status)
            .cmp(&status_rank(b.status))
            .then(seen_b.cmp(&seen_a))
    });
    sorted
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FleetStats {
    pub total: usize,
    pub online: usize,
    pub online_percentage: u32,
    pub critical: usize,
    pub warning: usize,
}

pub fn compute_stats(devices: &[Device], events: &[Event]) -> FleetStats {
    let total = devices.len();
    let online = devices
        .iter()
        .filter(|d| d.status == DeviceStatus::Online)
        .count();
    let online_percentage = if total > 0 {
        ((online as f64 / total as f64) * 100.0).round() as u32
    } else {
        0
    };

    FleetStats {
        total,
        online,
        online_percentage,
        critical: events
            .iter()
            .filter(|e| e.severity == Severity::Critical)
            .count(),
        warning: events
            .iter()
            .filter(|e| e.severity == Severity::Warning)
            .count(),
    }
}
