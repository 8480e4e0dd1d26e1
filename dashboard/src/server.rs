use crate::app::{DashboardHandle, DashboardSnapshot};
use crate::metrics;
use crate::model::Event;
use crate::push::ConnectionState;
use crate::queries::FleetQueries;
use crate::rest::FleetApi;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::error;

struct AppState<A: FleetApi> {
    dashboard: DashboardHandle,
    queries: FleetQueries<A>,
    connection: watch::Receiver<ConnectionState>,
    acknowledged_by: String,
}

impl<A: FleetApi> Clone for AppState<A> {
    fn clone(&self) -> Self {
        Self {
            dashboard: self.dashboard.clone(),
            queries: self.queries.clone(),
            connection: self.connection.clone(),
            acknowledged_by: self.acknowledged_by.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SnapshotResponse {
    connection: ConnectionState,
    #[serde(flatten)]
    snapshot: DashboardSnapshot,
}

#[derive(Debug, Deserialize)]
struct SelectionRequest {
    device_id: Option<String>,
}

pub fn create_router<A: FleetApi>(
    dashboard: DashboardHandle,
    queries: FleetQueries<A>,
    connection: watch::Receiver<ConnectionState>,
    acknowledged_by: String,
) -> Router {
    let state = AppState {
        dashboard,
        queries,
        connection,
        acknowledged_by,
    };

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/snapshot", get(get_snapshot::<A>))
        .route("/api/v1/selection", put(put_selection::<A>))
        .route(
            "/api/v1/events/:id/acknowledge",
            post(acknowledge_event::<A>),
        )
        .with_state(state)
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

async fn get_snapshot<A: FleetApi>(State(state): State<AppState<A>>) -> Json<SnapshotResponse> {
    Json(SnapshotResponse {
        connection: *state.connection.borrow(),
        snapshot: state.dashboard.snapshot(),
    })
}

async fn put_selection<A: FleetApi>(
    State(state): State<AppState<A>>,
    Json(request): Json<Option<SelectionRequest>>,
) -> StatusCode {
    // a bare `null` body clears like `{"device_id": null}`
    state
        .dashboard
        .select(request.and_then(|request| request.device_id));
    StatusCode::NO_CONTENT
}

async fn acknowledge_event<A: FleetApi>(
    State(state): State<AppState<A>>,
    Path(event_id): Path<String>,
) -> Result<Json<Event>, AppError> {
    let event = state
        .queries
        .acknowledge(&event_id, &state.acknowledged_by)
        .await?;
    Ok(Json(event))
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::BAD_GATEWAY,
            format!("Upstream request failed: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
