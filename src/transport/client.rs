use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::{FabricError, Result};
use crate::transport::protocol::{
    CapacityRequest, ErrorBody, HeartbeatRequest, HeartbeatResponse, PollResponse,
    RegisterRequest, RegisterResponse, ReportRequest, ReportResponse, SubmitRequest,
    SubmitResponse, TaskView,
};

/// HTTP client for the control plane, used by agents and the task CLI.
#[derive(Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>, token: SecretString, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FabricError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse> {
        let builder = self.http.post(self.url("/agent/register")).json(req);
        self.send(builder, req.agent_id).await
    }

    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let builder = self.http.post(self.url("/agent/heartbeat")).json(req);
        self.send(builder, Some(req.agent_id)).await
    }

    pub async fn poll(&self, agent_id: Uuid) -> Result<PollResponse> {
        let builder = self
            .http
            .get(self.url("/agent/poll"))
            .query(&[("agent_id", agent_id.to_string())]);
        self.send(builder, Some(agent_id)).await
    }

    pub async fn report(&self, req: &ReportRequest) -> Result<ReportResponse> {
        let builder = self.http.post(self.url("/agent/report")).json(req);
        self.send(builder, Some(req.agent_id)).await
    }

    pub async fn unregister(&self, agent_id: Uuid) -> Result<()> {
        let builder = self.http.delete(self.url(&format!("/agent/{}", agent_id)));
        self.send_empty(builder, Some(agent_id)).await
    }

    pub async fn set_capacity(&self, agent_id: Uuid, capacity: u32) -> Result<()> {
        let builder = self
            .http
            .put(self.url(&format!("/agent/{}/capacity", agent_id)))
            .json(&CapacityRequest { capacity });
        self.send_empty(builder, Some(agent_id)).await
    }

    pub async fn submit(&self, req: &SubmitRequest) -> Result<Uuid> {
        let builder = self.http.post(self.url("/task/submit")).json(req);
        let response: SubmitResponse = self.send(builder, None).await?;
        Ok(response.task_id)
    }

    pub async fn task(&self, task_id: Uuid) -> Result<TaskView> {
        let builder = self.http.get(self.url(&format!("/task/{}", task_id)));
        self.send(builder, Some(task_id)).await
    }

    pub async fn cancel(&self, task_id: Uuid) -> Result<TaskView> {
        let builder = self.http.post(self.url(&format!("/task/{}/cancel", task_id)));
        self.send(builder, Some(task_id)).await
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder, subject: Option<Uuid>) -> Result<T> {
        let response = self.execute(builder, subject).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| FabricError::Protocol(format!("malformed response: {}", e)))
    }

    async fn send_empty(&self, builder: RequestBuilder, subject: Option<Uuid>) -> Result<()> {
        self.execute(builder, subject).await.map(|_| ())
    }

    async fn execute(&self, builder: RequestBuilder, subject: Option<Uuid>) -> Result<reqwest::Response> {
        let response = builder
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| FabricError::Connection(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.json::<ErrorBody>().await.ok();
        Err(decode_error(status, body, subject))
    }
}

/// Map a non-2xx response back onto the error taxonomy. `subject` is the
/// agent or task the request was about.
fn decode_error(status: StatusCode, body: Option<ErrorBody>, subject: Option<Uuid>) -> FabricError {
    let subject = subject.unwrap_or_else(Uuid::nil);
    let message = body
        .as_ref()
        .map(|b| b.message.clone())
        .unwrap_or_else(|| status.to_string());
    if status == StatusCode::UNAUTHORIZED {
        return FabricError::Auth(message);
    }
    match body.as_ref().map(|b| b.code.as_str()) {
        Some("unknown_agent") => FabricError::UnknownAgent(subject),
        Some("task_not_found") => FabricError::TaskNotFound(subject),
        Some("capacity_exceeded") => FabricError::CapacityExceeded(subject),
        Some("queue_full") => FabricError::QueueFull,
        Some("invalid_state") => FabricError::InvalidState(message),
        Some("protocol") => FabricError::Protocol(message),
        _ if status.is_server_error() => FabricError::Connection(message),
        _ if status.is_client_error() => FabricError::Protocol(message),
        _ => FabricError::Internal(message),
    }
}
