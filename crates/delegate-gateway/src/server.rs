//! Router assembly and the shared application state.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use delegate_core::error::DelegateError;
use delegate_core::paths::Home;
use delegate_db::{ids::IdRegistry, Db};
use delegate_runtime::ActivityHub;
use delegate_workflows::WorkflowRegistry;

use crate::{routes, sse};

/// Shared handles behind every request.
pub struct AppState {
    pub db: Db,
    pub ids: IdRegistry,
    pub home: Home,
    pub hub: Arc<ActivityHub>,
    pub workflows: Arc<WorkflowRegistry>,
}

/// Error wrapper mapping the core taxonomy onto HTTP statuses with
/// the `{"detail": ...}` body shape.
#[derive(Debug)]
pub struct ApiError(pub DelegateError);

impl From<DelegateError> for ApiError {
    fn from(err: DelegateError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DelegateError::Validation(_) => StatusCode::BAD_REQUEST,
            DelegateError::NotFound(_) => StatusCode::NOT_FOUND,
            DelegateError::Conflict(_) => StatusCode::CONFLICT,
            DelegateError::Permission(_) => StatusCode::FORBIDDEN,
            DelegateError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "detail": self.0.to_string() }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Assemble the router over the shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/bootstrap", get(routes::bootstrap))
        .route("/teams", get(routes::list_teams))
        .route("/teams/{team}/tasks", get(routes::team_tasks))
        .route(
            "/teams/{team}/messages",
            get(routes::team_messages).post(routes::send_message),
        )
        .route("/api/tasks/{id}", get(routes::get_task))
        .route("/api/tasks/{id}/approve", post(routes::approve_task))
        .route("/api/tasks/{id}/reject", post(routes::reject_task))
        .route("/api/tasks/{id}/cancel", post(routes::cancel_task))
        .route("/api/tasks/{id}/retry-merge", post(routes::retry_merge))
        .route("/api/tasks/{id}/reviews", get(routes::task_reviews))
        .route(
            "/api/tasks/{id}/reviews/current",
            get(routes::current_review),
        )
        .route("/stream", get(sse::global_stream))
        .route("/teams/{team}/activity/stream", get(sse::team_stream))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the daemon shuts the listener down.
pub async fn serve(state: Arc<AppState>, listen: &str) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!("gateway listening on {listen}");
    axum::serve(listener, router).await?;
    Ok(())
}
