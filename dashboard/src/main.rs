use dashboard::app::Dashboard;
use dashboard::cache::QueryClient;
use dashboard::config::Config;
use dashboard::metrics;
use dashboard::push::{PushClient, PushConfig};
use dashboard::queries::FleetQueries;
use dashboard::rest::ApiClient;
use dashboard::server;
use dashboard::sync::run_sync;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting fleet dashboard");
    info!("API: {}", config.api_url);
    info!("Push channel: {}", config.ws_url);
    info!("HTTP server: {}", config.http_addr);

    metrics::init_metrics();

    let client = QueryClient::new();
    let queries = FleetQueries::new(Arc::new(ApiClient::new(&config.api_url)), client.clone());

    // Subscribe before connecting so no early notification is missed
    let push = PushClient::new(
        PushConfig::new(&config.ws_url).reconnect_interval(config.reconnect_interval),
    );
    let sync_handle = tokio::spawn(run_sync(push.subscribe(), client));
    push.connect();

    let (dashboard, handle) = Dashboard::new(queries.clone(), config.events_limit);
    let (stop_dashboard, dashboard_stopped) = oneshot::channel();
    let mut dashboard_handle = tokio::spawn(dashboard.run(dashboard_stopped));

    let app = server::create_router(
        handle,
        queries,
        push.state_changes(),
        config.acknowledged_by.clone(),
    );

    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    let dashboard_running = tokio::select! {
        _ = &mut dashboard_handle => {
            error!("Dashboard task terminated");
            false
        }
        _ = server_handle => {
            error!("HTTP server terminated");
            true
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            true
        }
    };

    info!("Shutting down");
    if dashboard_running {
        let _ = stop_dashboard.send(());
        let _ = dashboard_handle.await;
    }
    push.disconnect().await;
    drop(push);
    let _ = sync_handle.await;
    info!("Shutdown complete");
}
