use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use dashboard::cache::QueryClient;
use dashboard::push::{ConnectionState, PushClient, PushConfig};
use dashboard::queries::FleetQueries;
use dashboard::rest::{ApiClient, FleetApi};
use dashboard::sync::run_sync;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

#[derive(Default)]
struct Backend {
    device_calls: AtomicUsize,
    event_calls: AtomicUsize,
}

async fn list_devices(State(backend): State<Arc<Backend>>) -> Json<Value> {
    backend.device_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!([{
        "id": "dev-001",
        "name": "Truck 1",
        "model": "TR-200",
        "status": "online",
        "created_at": "2024-05-01T10:00:00+00:00",
        "last_seen_at": "2024-05-01T11:59:00+00:00",
        "device_metadata": {}
    }]))
}

async fn list_events(State(backend): State<Arc<Backend>>) -> Json<Value> {
    backend.event_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!([]))
}

async fn rest_backend() -> (String, Arc<Backend>) {
    let backend = Arc::new(Backend::default());
    let app = Router::new()
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/events", get(list_events))
        .with_state(backend.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/api/v1", addr), backend)
}

/// Accepts push clients and hands each connection to the test.
async fn push_backend() -> (String, mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = accept_async(stream).await {
                if tx.send(ws).is_err() {
                    break;
                }
            }
        }
    });
    (format!("ws://{}/api/v1/ws", addr), rx)
}

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        match timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return serde_json::from_str(&text).unwrap(),
            Ok(Some(Ok(_))) => continue,
            other => panic!("expected a text frame, got {:?}", other),
        }
    }
}

async fn wait_until(what: &str, pred: impl Fn() -> bool) {
    for _ in 0..300 {
        if pred() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_push_notification_refetches_only_affected_queries() {
    let (api_url, backend) = rest_backend().await;
    let (ws_url, mut connections) = push_backend().await;

    let client = QueryClient::new();
    let queries = FleetQueries::new(Arc::new(ApiClient::new(api_url)), client.clone());
    let devices = queries.devices().observe();
    let events = queries.dashboard_events(50).observe();

    let push = PushClient::new(PushConfig::new(ws_url));
    let sync = tokio::spawn(run_sync(push.subscribe(), client.clone()));
    push.connect();

    let mut ws = timeout(Duration::from_secs(5), connections.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        next_text(&mut ws).await,
        json!({"type": "subscribe", "channels": ["telemetry", "devices", "events"]})
    );
    assert_eq!(push.state(), ConnectionState::Open);

    wait_until("initial fetches", || {
        backend.device_calls.load(Ordering::SeqCst) == 1
            && backend.event_calls.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(devices.data().unwrap()[0].id, "dev-001");

    ws.send(Message::Text(
        r#"{"type":"device_status_updated","data":{"device_id":"dev-001","status":"offline"}}"#
            .to_string(),
    ))
    .await
    .unwrap();

    wait_until("devices refetch", || {
        backend.device_calls.load(Ordering::SeqCst) == 2
    })
    .await;
    assert_eq!(backend.event_calls.load(Ordering::SeqCst), 1);

    // Garbage is dropped without closing the channel
    ws.send(Message::Text("not json".to_string())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"events_updated","count":2}"#.to_string()))
        .await
        .unwrap();

    wait_until("events refetch", || {
        backend.event_calls.load(Ordering::SeqCst) == 2
    })
    .await;
    assert!(push.is_connected());
    assert!(events.data().unwrap().is_empty());

    push.disconnect().await;
    drop(push);
    timeout(Duration::from_secs(5), sync).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reconnects_and_resubscribes_after_close() {
    let (ws_url, mut connections) = push_backend().await;
    let push = PushClient::new(
        PushConfig::new(ws_url).reconnect_interval(Duration::from_millis(100)),
    );
    push.connect();

    let mut first = timeout(Duration::from_secs(5), connections.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next_text(&mut first).await["type"], "subscribe");
    first.close(None).await.unwrap();

    let mut second = timeout(Duration::from_secs(5), connections.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next_text(&mut second).await["type"], "subscribe");
    assert_eq!(push.reconnect_attempts(), 1);

    push.disconnect().await;
    assert_eq!(push.state(), ConnectionState::Disconnected);
}

#[tokio::test]
#[ignore]
async fn test_live_backend() {
    let api_url = std::env::var("API_URL")
        .unwrap_or_else(|_| dashboard::config::DEFAULT_API_URL.to_string());
    let api = ApiClient::new(api_url);

    let devices = api.list_devices().await.unwrap();
    println!("{} devices", devices.len());
    if let Some(device) = devices.first() {
        let latest = api.latest_telemetry(&device.id).await.unwrap();
        println!("{}: {:?}", device.id, latest);
    }
}
