use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::agent::executor::{ExecutionResult, ExecutionStatus, TaskExecutor};
use crate::agent::identity::AgentIdentity;
use crate::config::AgentConfig;
use crate::error::{FabricError, Result};
use crate::scheduler::registry::HealthSignal;
use crate::transport::client::ControlPlaneClient;
use crate::transport::protocol::{
    AssignmentMessage, HeartbeatRequest, RegisterRequest, RegisterResponse, ReportOutcome,
    ReportRequest,
};
use crate::version;

const BASE_BACKOFF: Duration = Duration::from_millis(500);
const REPORT_ATTEMPTS: u32 = 3;
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Capped exponential backoff with up to 50% random jitter.
pub fn backoff_delay(attempt: u32, max: Duration) -> Duration {
    let exp = BASE_BACKOFF.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let delay = exp.min(max);
    let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
    (delay + Duration::from_millis(jitter_ms)).min(max)
}

type RunningTasks = Arc<Mutex<HashMap<Uuid, CancellationToken>>>;

/// Long-running agent: registers, heartbeats, polls for assignments and
/// executes each in its own slot.
pub struct AgentRuntime {
    config: AgentConfig,
    client: ControlPlaneClient,
    executor: TaskExecutor,
    slots: Arc<Semaphore>,
    capacity: AtomicU32,
    running: RunningTasks,
    tracker: TaskTracker,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let client = ControlPlaneClient::new(
            config.server_url.clone(),
            config.token.clone(),
            config.request_timeout,
        )?;
        Ok(Self {
            executor: TaskExecutor::new(config.executor.clone()),
            slots: Arc::new(Semaphore::new(config.capacity as usize)),
            capacity: AtomicU32::new(config.capacity),
            running: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
            client,
            config,
        })
    }

    /// Tasks currently holding a slot
    pub fn load(&self) -> u32 {
        self.capacity
            .load(Ordering::SeqCst)
            .saturating_sub(self.slots.available_permits() as u32)
    }

    /// Run until `shutdown` fires, then drain in-flight tasks. Returns an
    /// error only for fatal conditions such as a rejected token.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let known = AgentIdentity::load(&self.config.identity_path())
            .filter(|identity| identity.server_url == self.config.server_url)
            .map(|identity| identity.agent_id);

        let Some(session) = self.register_with_backoff(known, &shutdown).await? else {
            return Ok(());
        };
        let agent_id = session.agent_id;
        tracing::info!(
            agent_id = %agent_id,
            capacity = self.config.capacity,
            heartbeat_ms = session.heartbeat_interval_ms,
            poll_ms = session.poll_interval_ms,
            "Agent registered"
        );

        let result = tokio::try_join!(
            self.heartbeat_loop(agent_id, Duration::from_millis(session.heartbeat_interval_ms), &shutdown),
            self.poll_loop(agent_id, Duration::from_millis(session.poll_interval_ms), &shutdown),
        );

        self.drain().await;
        result.map(|_| ())
    }

    fn registration(&self, agent_id: Option<Uuid>) -> RegisterRequest {
        RegisterRequest {
            agent_id,
            hostname: self.config.hostname.clone(),
            address: self.config.advertise_addr.clone(),
            version: version::VERSION.to_string(),
            capacity: self.capacity.load(Ordering::SeqCst),
            labels: self.config.labels.clone(),
        }
    }

    /// Register, retrying connection errors with backoff. `Ok(None)` means
    /// shutdown arrived first.
    async fn register_with_backoff(
        &self,
        agent_id: Option<Uuid>,
        shutdown: &CancellationToken,
    ) -> Result<Option<RegisterResponse>> {
        let mut attempt = 0;
        loop {
            match self.client.register(&self.registration(agent_id)).await {
                Ok(response) => {
                    let identity = AgentIdentity::new(response.agent_id, self.config.server_url.clone());
                    if let Err(e) = identity.save(&self.config.identity_path()) {
                        tracing::warn!(error = %e, "Failed to persist agent identity");
                    }
                    return Ok(Some(response));
                }
                Err(e) if e.is_transient() => {
                    let delay = backoff_delay(attempt, self.config.max_backoff);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Registration failed, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Registration refused");
                    return Err(e);
                }
            }
        }
    }

    async fn heartbeat_loop(&self, agent_id: Uuid, every: Duration, shutdown: &CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = interval.tick() => {}
            }

            let load = self.load();
            let signal = if self.slots.available_permits() == 0 {
                HealthSignal::Saturated
            } else {
                HealthSignal::Normal
            };
            let request = HeartbeatRequest { agent_id, load, signal };
            match self.client.heartbeat(&request).await {
                Ok(response) => {
                    for task_id in response.cancel {
                        self.cancel_task(task_id);
                    }
                    self.apply_capacity(response.capacity);
                }
                Err(FabricError::UnknownAgent(_)) => {
                    tracing::warn!(agent_id = %agent_id, "Server forgot this agent, re-registering");
                    // Attempts in flight were written off by the server
                    self.cancel_all();
                    if self.register_with_backoff(Some(agent_id), shutdown).await?.is_none() {
                        return Ok(());
                    }
                }
                Err(e @ FabricError::Auth(_)) => return Err(e),
                Err(e) => tracing::warn!(error = %e, "Heartbeat failed"),
            }
        }
    }

    async fn poll_loop(&self, agent_id: Uuid, every: Duration, shutdown: &CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = interval.tick() => {}
            }

            match self.client.poll(agent_id).await {
                Ok(response) => {
                    for task_id in response.cancel {
                        self.cancel_task(task_id);
                    }
                    for assignment in response.assignments {
                        self.accept(agent_id, assignment).await;
                    }
                }
                Err(FabricError::UnknownAgent(_)) => {
                    tracing::debug!("Poll refused until re-registration");
                }
                Err(e @ FabricError::Auth(_)) => return Err(e),
                Err(e) => tracing::warn!(error = %e, "Poll failed"),
            }
        }
    }

    /// Take a slot for `assignment` and start it, or reject it when full.
    async fn accept(&self, agent_id: Uuid, assignment: AssignmentMessage) {
        let task_id = assignment.task_id;
        let Ok(permit) = self.slots.clone().try_acquire_owned() else {
            tracing::warn!(task_id = %task_id, "No free slot, rejecting assignment");
            let reject = ReportRequest::new(agent_id, &assignment, ReportOutcome::Rejected);
            if let Err(e) = self.client.report(&reject).await {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to report rejection");
            }
            return;
        };

        let started = ReportRequest::new(agent_id, &assignment, ReportOutcome::Started);
        match self.client.report(&started).await {
            Ok(ack) if !ack.accepted => {
                tracing::debug!(task_id = %task_id, attempt = assignment.attempt, "Assignment superseded before start");
                return;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(task_id = %task_id, error = %e, "Failed to report start"),
        }

        let cancel = CancellationToken::new();
        lock(&self.running).insert(task_id, cancel.clone());

        let timeout = (assignment.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let executor = self.executor.clone();
        let client = self.client.clone();
        let running = self.running.clone();
        self.tracker.spawn(async move {
            let payload = assignment.payload.clone();
            let execution = tokio::spawn(async move {
                executor.execute(task_id, &payload, timeout, cancel).await
            });
            let result = match execution.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    tracing::error!(task_id = %task_id, "Task execution panicked");
                    ExecutionResult::failed(task_id, "execution panicked", Duration::ZERO)
                }
                Err(e) => ExecutionResult::failed(task_id, e.to_string(), Duration::ZERO),
            };
            lock(&running).remove(&task_id);
            drop(permit);
            report_result(&client, agent_id, &assignment, result).await;
        });
    }

    fn cancel_task(&self, task_id: Uuid) {
        if let Some(token) = lock(&self.running).get(&task_id) {
            tracing::info!(task_id = %task_id, "Cancelling task on server request");
            token.cancel();
        }
    }

    fn cancel_all(&self) {
        for token in lock(&self.running).values() {
            token.cancel();
        }
    }

    /// Follow the server's authoritative slot count.
    fn apply_capacity(&self, capacity: u32) {
        let current = self.capacity.swap(capacity, Ordering::SeqCst);
        if capacity > current {
            self.slots.add_permits((capacity - current) as usize);
        } else if capacity < current {
            let forgotten = self.slots.forget_permits((current - capacity) as usize);
            // Busy slots cannot be forgotten; count them back in
            let missing = (current - capacity) as usize - forgotten;
            self.capacity.fetch_add(missing as u32, Ordering::SeqCst);
        }
        if capacity != current {
            tracing::info!(from = current, to = capacity, "Slot count changed by server");
        }
    }

    /// Wait for in-flight tasks up to the grace period, then kill the rest.
    async fn drain(&self) {
        self.tracker.close();
        let in_flight = self.tracker.len();
        if in_flight > 0 {
            tracing::info!(in_flight, grace_secs = self.config.shutdown_grace.as_secs(), "Waiting for running tasks");
        }
        if tokio::time::timeout(self.config.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("Grace period over, killing remaining tasks");
            self.cancel_all();
            let _ = tokio::time::timeout(KILL_WAIT, self.tracker.wait()).await;
        }
        tracing::info!("Agent stopped");
    }
}

fn lock(running: &RunningTasks) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
    running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn final_report(agent_id: Uuid, assignment: &AssignmentMessage, result: ExecutionResult) -> ReportRequest {
    let outcome = match result.status {
        ExecutionStatus::Succeeded => ReportOutcome::Succeeded,
        ExecutionStatus::Failed | ExecutionStatus::TimedOut | ExecutionStatus::Cancelled => ReportOutcome::Failed,
    };
    ReportRequest {
        duration_ms: result.duration.as_millis() as u64,
        exit_code: result.exit_code,
        summary: result.output,
        error: result.error,
        ..ReportRequest::new(agent_id, assignment, outcome)
    }
}

/// Send the final report, retrying transient failures a few times.
async fn report_result(
    client: &ControlPlaneClient,
    agent_id: Uuid,
    assignment: &AssignmentMessage,
    result: ExecutionResult,
) {
    let report = final_report(agent_id, assignment, result);
    for attempt in 0..REPORT_ATTEMPTS {
        match client.report(&report).await {
            Ok(ack) => {
                if !ack.accepted {
                    tracing::debug!(task_id = %report.task_id, "Server dropped report for superseded attempt");
                }
                return;
            }
            Err(e) if e.is_transient() && attempt + 1 < REPORT_ATTEMPTS => {
                tracing::warn!(task_id = %report.task_id, error = %e, "Report failed, retrying");
                tokio::time::sleep(backoff_delay(attempt, Duration::from_secs(5))).await;
            }
            Err(e) => {
                tracing::error!(task_id = %report.task_id, error = %e, "Giving up on report");
                return;
            }
        }
    }
}
