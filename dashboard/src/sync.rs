use crate::cache::QueryClient;
use crate::metrics::INVALIDATIONS_TOTAL;
use crate::model::PushMessage;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Logical cached queries a push notification can make stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryTarget {
    Devices,
    AllTelemetry,
    Events,
}

impl QueryTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryTarget::Devices => "devices",
            QueryTarget::AllTelemetry => "all-telemetry",
            QueryTarget::Events => "events",
        }
    }
}

/// Which queries a push notification invalidates. Unknown types map to nothing.
pub fn invalidation_targets(message: &PushMessage) -> &'static [QueryTarget] {
    match message.kind.as_str() {
        "telemetry_update" | "device_status_updated" => {
            &[QueryTarget::Devices, QueryTarget::AllTelemetry]
        }
        "events_updated" | "event_created" => &[QueryTarget::Events],
        _ => &[],
    }
}

/// Marks the targeted queries stale; the cache decides when to refetch.
pub fn apply(client: &QueryClient, message: &PushMessage) -> usize {
    let targets = invalidation_targets(message);
    if targets.is_empty() {
        debug!("Ignoring push message {}", message.kind);
        return 0;
    }

    let mut invalidated = 0;
    for target in targets {
        INVALIDATIONS_TOTAL.with_label_values(&[target.as_str()]).inc();
        invalidated += client.invalidate_queries(target.as_str());
    }
    debug!(
        "Push message {} invalidated {} queries",
        message.kind, invalidated
    );
    invalidated
}

/// Applies push messages in arrival order until the sender goes away.
pub async fn run_sync(mut messages: broadcast::Receiver<PushMessage>, client: QueryClient) {
    info!("Starting push synchronization");
    loop {
        match messages.recv().await {
            Ok(message) => {
                apply(&client, &message);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Push synchronization lagged, skipped {} messages", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    info!("Push synchronization stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{QueryKey, QueryOptions};
    use serde_json::json;

    fn message(kind: &str) -> PushMessage {
        PushMessage::new(kind)
    }

    #[test]
    fn test_device_notifications() {
        for kind in ["telemetry_update", "device_status_updated"] {
            assert_eq!(
                invalidation_targets(&message(kind)),
                &[QueryTarget::Devices, QueryTarget::AllTelemetry]
            );
        }
    }

    #[test]
    fn test_event_notifications() {
        for kind in ["events_updated", "event_created"] {
            assert_eq!(invalidation_targets(&message(kind)), &[QueryTarget::Events]);
        }
    }

    #[test]
    fn test_unrecognized_types_are_ignored() {
        for kind in ["connected", "subscribed", "pong", "", "EVENTS_UPDATED", "telemetry"] {
            assert!(invalidation_targets(&message(kind)).is_empty());
        }
        let with_data = PushMessage {
            kind: "device_deleted".to_string(),
            data: Some(json!({"id": "dev-1"})),
        };
        assert!(invalidation_targets(&with_data).is_empty());
    }

    #[test]
    fn test_target_names() {
        assert_eq!(QueryTarget::Devices.as_str(), "devices");
        assert_eq!(QueryTarget::AllTelemetry.as_str(), "all-telemetry");
        assert_eq!(QueryTarget::Events.as_str(), "events");
    }

    #[tokio::test]
    async fn test_device_status_leaves_events_untouched() {
        let client = QueryClient::new();
        let devices = client.query(QueryKey::new("devices"), QueryOptions::default(), || async { Ok(1u8) });
        let telemetry = client.query(
            QueryKey::new("all-telemetry").param("dev-1"),
            QueryOptions::default(),
            || async { Ok(2u8) },
        );
        let events = client.query(QueryKey::new("events"), QueryOptions::default(), || async { Ok(3u8) });
        devices.fetch().await;
        telemetry.fetch().await;
        events.fetch().await;

        assert_eq!(apply(&client, &message("device_status_updated")), 2);

        assert!(devices.is_stale());
        assert!(telemetry.is_stale());
        assert!(!events.is_stale());
    }

    #[tokio::test]
    async fn test_run_sync_applies_in_order() {
        let client = QueryClient::new();
        let events = client.query(QueryKey::new("events"), QueryOptions::default(), || async { Ok(3u8) });
        events.fetch().await;

        let (tx, rx) = broadcast::channel(16);
        let handle = tokio::spawn(run_sync(rx, client.clone()));
        tx.send(message("pong")).unwrap();
        tx.send(message("event_created")).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(events.is_stale());
    }
}
