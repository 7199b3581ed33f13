//! Read-only JSON views over the fleet, the backlog and result history.

use std::collections::BTreeSet;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::engine::EngineSummary;
use crate::scheduler::registry::{AgentHealth, AgentState, HealthSignal};
use crate::store::{ResultQuery, ResultRecord};
use crate::transport::protocol::TaskView;
use crate::transport::server::AppState;

#[derive(Debug, Serialize)]
pub struct AgentView {
    pub id: Uuid,
    pub hostname: String,
    pub address: String,
    pub version: String,
    pub capacity: u32,
    pub load: u32,
    pub labels: BTreeSet<String>,
    pub health: AgentHealth,
    pub signal: HealthSignal,
    pub last_heartbeat_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl From<&AgentState> for AgentView {
    fn from(agent: &AgentState) -> Self {
        Self {
            id: agent.id,
            hostname: agent.hostname.clone(),
            address: agent.address.clone(),
            version: agent.version.clone(),
            capacity: agent.capacity,
            load: agent.load(),
            labels: agent.labels.clone(),
            health: agent.health,
            signal: agent.signal,
            last_heartbeat_at: agent.last_heartbeat_at,
            registered_at: agent.registered_at,
        }
    }
}

/// Dashboard routes, nested under `/api` by the control-plane router.
pub fn routes() -> Router<AppState> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/agents", get(list_agents))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}/results", get(task_results))
        .route("/results", get(query_results))
        .route("/summary", get(summary))
        .layer(cors)
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentView>> {
    let agents = state.engine.agents().await;
    Json(agents.iter().map(AgentView::from).collect())
}

async fn list_tasks(State(state): State<AppState>) -> Json<Vec<TaskView>> {
    let tasks = state.engine.tasks().await;
    Json(tasks.iter().map(TaskView::from).collect())
}

async fn task_results(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Vec<ResultRecord>>> {
    Ok(Json(state.engine.store().records_for_task(id).await?))
}

async fn query_results(
    State(state): State<AppState>,
    Query(query): Query<ResultQuery>,
) -> Result<Json<Vec<ResultRecord>>> {
    Ok(Json(state.engine.store().query(&query).await?))
}

async fn summary(State(state): State<AppState>) -> Json<EngineSummary> {
    Json(state.engine.summary().await)
}
