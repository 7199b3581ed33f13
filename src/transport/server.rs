use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{middleware, Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::dashboard;
use crate::error::{FabricError, Result};
use crate::scheduler::engine::DispatchEngine;
use crate::transport::auth::{require_token, AuthState};
use crate::transport::protocol::{
    CapacityRequest, ErrorBody, HeartbeatRequest, HeartbeatResponse, PollQuery, PollResponse,
    RegisterRequest, RegisterResponse, ReportRequest, ReportResponse, SubmitRequest,
    SubmitResponse, TaskView,
};

impl FabricError {
    pub fn status(&self) -> StatusCode {
        match self {
            FabricError::Auth(_) => StatusCode::UNAUTHORIZED,
            FabricError::UnknownAgent(_) | FabricError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            FabricError::CapacityExceeded(_)
            | FabricError::StaleAttempt { .. }
            | FabricError::InvalidState(_) => StatusCode::CONFLICT,
            FabricError::Protocol(_) => StatusCode::BAD_REQUEST,
            FabricError::QueueFull | FabricError::Store(_) | FabricError::Connection(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            FabricError::TaskExecution(_) | FabricError::Io(_) | FabricError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for FabricError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for FabricError {
    fn from(rejection: JsonRejection) -> Self {
        FabricError::Protocol(rejection.body_text())
    }
}

/// JSON body extractor whose rejections use the `{code, message}` error body.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(FabricError))]
pub struct ApiJson<T>(pub T);

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DispatchEngine>,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
}

/// Build the control-plane router. Everything except `/health` requires
/// the shared bearer token.
pub fn router(state: AppState, auth: AuthState) -> Router {
    let protected = Router::new()
        .route("/agent/register", post(register))
        .route("/agent/heartbeat", post(heartbeat))
        .route("/agent/poll", get(poll))
        .route("/agent/report", post(report))
        .route("/agent/{id}", delete(unregister))
        .route("/agent/{id}/capacity", put(set_capacity))
        .route("/task/submit", post(submit))
        .route("/task/{id}", get(task_status))
        .route("/task/{id}/cancel", post(cancel))
        .nest("/api", dashboard::routes())
        .layer(middleware::from_fn_with_state(auth, require_token));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `app` until `shutdown` fires.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Control plane listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn register(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<Json<RegisterResponse>> {
    let agent_id = state.engine.register(req, Instant::now()).await?;
    Ok(Json(RegisterResponse {
        agent_id,
        heartbeat_interval_ms: state.heartbeat_interval.as_millis() as u64,
        poll_interval_ms: state.poll_interval.as_millis() as u64,
    }))
}

async fn heartbeat(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>> {
    Ok(Json(state.engine.heartbeat(req, Instant::now()).await?))
}

async fn poll(State(state): State<AppState>, Query(query): Query<PollQuery>) -> Result<Json<PollResponse>> {
    Ok(Json(state.engine.poll(query.agent_id).await?))
}

async fn report(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ReportRequest>,
) -> Result<Json<ReportResponse>> {
    Ok(Json(state.engine.report(req, Instant::now()).await?))
}

async fn unregister(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode> {
    state.engine.unregister(id, Instant::now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_capacity(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ApiJson(req): ApiJson<CapacityRequest>,
) -> Result<StatusCode> {
    state.engine.set_capacity(id, req.capacity).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>)> {
    if req.payload.command.trim().is_empty() {
        return Err(FabricError::Protocol("payload command is empty".to_string()));
    }
    let task_id = state.engine.submit(req.into()).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { task_id })))
}

async fn task_status(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<TaskView>> {
    let task = state.engine.task(id).await?;
    Ok(Json(TaskView::from(&task)))
}

async fn cancel(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<TaskView>> {
    let task = state.engine.cancel(id, Instant::now()).await?;
    Ok(Json(TaskView::from(&task)))
}
