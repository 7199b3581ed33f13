//! Dispatch engine: the single writer of scheduling state.
//!
//! Queue, registry and assignment table live behind one lock, so creating,
//! completing and expiring an assignment are serialized with respect to
//! each other. Nothing awaits I/O while holding that lock. Delivery to
//! agents happens after the lock is released, and result records go
//! through an in-order outbox drained by a single flusher.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::{FabricError, Result};
use crate::scheduler::assignment::{Assignment, AssignmentTable};
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::registry::{AgentHealth, AgentInfo, AgentRegistry, AgentState, SweepReport};
use crate::scheduler::task::{Outcome, Task, TaskError, TaskSpec, TaskState};
use crate::store::{ResultRecord, ResultStore};
use crate::transport::delivery::Delivery;
use crate::transport::protocol::{
    AssignmentMessage, HeartbeatRequest, HeartbeatResponse, PollResponse, RegisterRequest,
    ReportOutcome, ReportRequest, ReportResponse,
};

/// A pending write to the result store.
#[derive(Debug, Clone)]
enum StoreWrite {
    Record(ResultRecord),
    Archive(Box<Task>),
}

/// How an attempt ended, as seen by the engine.
#[derive(Debug)]
struct AttemptEnd {
    outcome: Outcome,
    duration_ms: Option<u64>,
    exit_code: Option<i32>,
    summary: Option<String>,
    detail: Option<String>,
}

impl AttemptEnd {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            duration_ms: None,
            exit_code: None,
            summary: None,
            detail: None,
        }
    }

    fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

fn error_class(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Failed => "task_execution",
        Outcome::TimedOut => "timeout",
        Outcome::AgentLost => "agent_lost",
        Outcome::Rejected => "capacity_exceeded",
        Outcome::DeliveryFailed => "connection",
        Outcome::Cancelled => "cancelled",
        Outcome::Succeeded => "none",
    }
}

/// An assignment created under the lock, waiting to be handed over.
#[derive(Debug)]
struct Planned {
    agent_id: Uuid,
    message: AssignmentMessage,
}

struct SchedulerState {
    queue: TaskQueue,
    registry: AgentRegistry,
    assignments: AssignmentTable,
    outbox: VecDeque<StoreWrite>,
    /// Tasks each agent should kill, drained by its next heartbeat or poll
    cancellations: HashMap<Uuid, Vec<Uuid>>,
}

impl SchedulerState {
    /// Close the live attempt of `task_id`: free the slot, queue its result
    /// record and move the task on. Returns `None` if no attempt was live.
    fn end_attempt(&mut self, task_id: &Uuid, end: AttemptEnd, now: Instant) -> Option<TaskState> {
        let assignment = self.assignments.remove(task_id)?;
        self.registry.unbind(&assignment.agent_id, task_id);

        let duration_ms = end
            .duration_ms
            .unwrap_or_else(|| assignment.elapsed(now).as_millis() as u64);
        self.outbox.push_back(StoreWrite::Record(ResultRecord {
            task_id: *task_id,
            agent_id: Some(assignment.agent_id),
            attempt: assignment.attempt,
            outcome: end.outcome,
            duration_ms,
            exit_code: end.exit_code,
            detail: end.detail.clone(),
            recorded_at: Utc::now(),
        }));

        let next = match end.outcome {
            Outcome::Succeeded => {
                self.registry.record_success(&assignment.agent_id, now);
                self.queue
                    .complete(task_id, end.exit_code, end.summary)
                    .map(|_| TaskState::Succeeded)
            }
            Outcome::Cancelled => self.queue.cancel(task_id).map(|_| TaskState::Cancelled),
            outcome => {
                self.queue.note_result(task_id, end.exit_code, end.summary);
                let error = TaskError {
                    class: error_class(outcome).to_string(),
                    message: end.detail.unwrap_or_else(|| outcome.to_string()),
                };
                self.queue.requeue(task_id, outcome, error)
            }
        };

        match next {
            Ok(state) => {
                tracing::info!(
                    task_id = %task_id,
                    agent_id = %assignment.agent_id,
                    attempt = assignment.attempt,
                    outcome = %end.outcome,
                    state = %state,
                    duration_ms,
                    "Attempt finished"
                );
                if state.is_terminal() {
                    self.archive(task_id);
                }
                Some(state)
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Task state out of step with assignment");
                None
            }
        }
    }

    fn archive(&mut self, task_id: &Uuid) {
        if let Some(task) = self.queue.get_task(task_id) {
            self.outbox.push_back(StoreWrite::Archive(Box::new(task.clone())));
        }
    }

    /// Reserve the next task some healthy agent could take.
    fn reserve_next(&mut self) -> Option<Uuid> {
        self.queue.next(|profile| self.registry.has_candidate(profile))
    }

    /// Bind a reserved task to the best candidate agent.
    fn assign_reserved(
        &mut self,
        task_id: Uuid,
        config: &DispatchConfig,
        now: Instant,
    ) -> Result<Option<Planned>> {
        let (profile, timeout, payload) = {
            let task = self
                .queue
                .get_task(&task_id)
                .ok_or(FabricError::TaskNotFound(task_id))?;
            (task.profile.clone(), task.timeout(), task.payload.clone())
        };
        let Some(agent_id) = self.registry.select_candidate(&profile) else {
            self.queue.release(&task_id);
            return Ok(None);
        };

        self.registry.bind(&agent_id, task_id)?;
        let attempt = match self.queue.confirm(&task_id, agent_id) {
            Ok(attempt) => attempt,
            Err(e) => {
                self.registry.unbind(&agent_id, &task_id);
                return Err(e);
            }
        };
        let assignment = Assignment::new(task_id, agent_id, attempt, timeout, config.report_grace, now)?;
        let deadline = assignment.deadline;
        self.assignments.insert(assignment)?;

        tracing::info!(task_id = %task_id, agent_id = %agent_id, attempt, "Task assigned");
        Ok(Some(Planned {
            agent_id,
            message: AssignmentMessage {
                task_id,
                attempt,
                payload,
                deadline,
            },
        }))
    }

    /// Take a task that broke the dispatch pass out of circulation.
    fn quarantine(&mut self, task_id: &Uuid, reason: String, now: Instant) {
        self.queue.release(task_id);
        let error = TaskError {
            class: "internal".to_string(),
            message: reason,
        };

        if let Some(assignment) = self.assignments.remove(task_id) {
            self.registry.unbind(&assignment.agent_id, task_id);
            self.push_failure(task_id, Some(assignment.agent_id), assignment.attempt, &error, assignment.elapsed(now));
        } else if let Some(task) = self.queue.get_task(task_id).filter(|t| t.state.is_live()) {
            // Confirmed but never made it into the assignment table
            let (agent_id, attempt) = (task.assigned_agent, task.attempt);
            if let Some(agent_id) = agent_id {
                self.registry.unbind(&agent_id, task_id);
            }
            self.push_failure(task_id, agent_id, attempt, &error, std::time::Duration::ZERO);
        }

        if let Err(e) = self.queue.abort(task_id, error) {
            tracing::error!(task_id = %task_id, error = %e, "Failed to abort task");
            return;
        }
        self.archive(task_id);
    }

    fn push_failure(
        &mut self,
        task_id: &Uuid,
        agent_id: Option<Uuid>,
        attempt: u32,
        error: &TaskError,
        elapsed: std::time::Duration,
    ) {
        self.outbox.push_back(StoreWrite::Record(ResultRecord {
            task_id: *task_id,
            agent_id,
            attempt,
            outcome: Outcome::Failed,
            duration_ms: elapsed.as_millis() as u64,
            exit_code: None,
            detail: Some(error.message.clone()),
            recorded_at: Utc::now(),
        }));
    }

    /// End every live attempt held by `agent_id` as lost.
    fn reclaim_agent(&mut self, agent_id: &Uuid, reason: &str, now: Instant) -> usize {
        let tasks = self.registry.live_tasks(agent_id);
        for task_id in &tasks {
            self.end_attempt(task_id, AttemptEnd::new(Outcome::AgentLost).detail(reason), now);
        }
        tasks.len()
    }
}

/// Fleet and backlog counters for the dashboard.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineSummary {
    pub agents_healthy: usize,
    pub agents_suspect: usize,
    pub agents_dead: usize,
    pub total_capacity: u32,
    pub total_load: u32,
    pub pending: usize,
    pub requeued: usize,
    pub assigned: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Result writes not yet flushed to the store
    pub unflushed_results: usize,
    pub store_healthy: bool,
}

pub struct DispatchEngine {
    config: DispatchConfig,
    state: Mutex<SchedulerState>,
    store: Arc<dyn ResultStore>,
    delivery: Arc<dyn Delivery>,
    flush_lock: Mutex<()>,
    store_healthy: AtomicBool,
    wakeup: Notify,
}

impl DispatchEngine {
    pub fn new(config: DispatchConfig, store: Arc<dyn ResultStore>, delivery: Arc<dyn Delivery>) -> Self {
        let state = SchedulerState {
            queue: TaskQueue::with_capacity(config.max_tasks)
                .with_max_retries(config.max_retries)
                .with_fairness_burst(config.fairness_burst),
            registry: AgentRegistry::new(config.suspect_window, config.dead_window, config.dead_retention),
            assignments: AssignmentTable::new(),
            outbox: VecDeque::new(),
            cancellations: HashMap::new(),
        };
        Self {
            config,
            state: Mutex::new(state),
            store,
            delivery,
            flush_lock: Mutex::new(()),
            store_healthy: AtomicBool::new(true),
            wakeup: Notify::new(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    pub fn store_healthy(&self) -> bool {
        self.store_healthy.load(Ordering::SeqCst)
    }

    /// Register an agent, or re-register a known one. A re-registering
    /// agent has restarted, so whatever it was running is lost.
    pub async fn register(&self, req: RegisterRequest, now: Instant) -> Result<Uuid> {
        if req.capacity == 0 {
            return Err(FabricError::InvalidState(
                "agent capacity must be at least 1".to_string(),
            ));
        }
        let agent_id = req.agent_id.unwrap_or_else(Uuid::new_v4);
        {
            let mut state = self.state.lock().await;
            let lost = state.reclaim_agent(&agent_id, "agent re-registered", now);
            if lost > 0 {
                tracing::warn!(agent_id = %agent_id, lost, "Re-registered agent abandoned running tasks");
            }
            state.registry.upsert(
                AgentInfo {
                    id: agent_id,
                    hostname: req.hostname,
                    address: req.address,
                    version: req.version,
                    capacity: req.capacity,
                    labels: req.labels,
                },
                now,
            );
            state.cancellations.remove(&agent_id);
            self.delivery.open(agent_id);
        }
        self.wakeup.notify_one();
        Ok(agent_id)
    }

    pub async fn heartbeat(&self, req: HeartbeatRequest, now: Instant) -> Result<HeartbeatResponse> {
        let response = {
            let mut state = self.state.lock().await;
            let capacity = state
                .registry
                .record_heartbeat(&req.agent_id, req.load, req.signal, now)?
                .capacity;
            HeartbeatResponse {
                pending_assignments: self.delivery.pending(req.agent_id),
                cancel: state.cancellations.remove(&req.agent_id).unwrap_or_default(),
                capacity,
            }
        };
        self.wakeup.notify_one();
        Ok(response)
    }

    /// Hand an agent its queued assignments. Messages for attempts that
    /// ended while waiting in the mailbox are dropped.
    pub async fn poll(&self, agent_id: Uuid) -> Result<PollResponse> {
        let mut state = self.state.lock().await;
        match state.registry.get(&agent_id) {
            Some(agent) if agent.health != AgentHealth::Dead => {}
            _ => return Err(FabricError::UnknownAgent(agent_id)),
        }
        let assignments: Vec<AssignmentMessage> = self
            .delivery
            .drain(agent_id)
            .into_iter()
            .filter(|m| {
                state
                    .assignments
                    .live_attempt(&m.task_id, &agent_id, m.attempt)
                    .is_ok()
            })
            .collect();
        Ok(PollResponse {
            assignments,
            cancel: state.cancellations.remove(&agent_id).unwrap_or_default(),
        })
    }

    pub async fn submit(&self, spec: TaskSpec) -> Result<Uuid> {
        if let Some(timeout) = spec.timeout {
            if timeout > self.config.max_task_timeout {
                return Err(FabricError::Protocol(format!(
                    "deadline of {}s exceeds the maximum of {}s",
                    timeout.as_secs(),
                    self.config.max_task_timeout.as_secs()
                )));
            }
        }
        let task_id = {
            let mut state = self.state.lock().await;
            state.queue.submit(spec, self.config.default_task_timeout)?
        };
        tracing::info!(task_id = %task_id, "Task accepted");
        self.wakeup.notify_one();
        Ok(task_id)
    }

    /// Apply an agent's report. Reports for anything but the live attempt
    /// are dropped and answered with `accepted: false`.
    pub async fn report(&self, req: ReportRequest, now: Instant) -> Result<ReportResponse> {
        let mut state = self.state.lock().await;
        if let Err(e) = state
            .assignments
            .live_attempt(&req.task_id, &req.agent_id, req.attempt)
        {
            tracing::debug!(agent_id = %req.agent_id, outcome = ?req.outcome, error = %e, "Dropping stale report");
            return Ok(ReportResponse { accepted: false });
        }

        let mut end = match req.outcome {
            ReportOutcome::Started => {
                state.queue.mark_running(&req.task_id)?;
                tracing::debug!(task_id = %req.task_id, agent_id = %req.agent_id, "Task running");
                return Ok(ReportResponse { accepted: true });
            }
            ReportOutcome::Succeeded => AttemptEnd::new(Outcome::Succeeded),
            ReportOutcome::Failed => {
                let detail = req.error.clone().unwrap_or_else(|| match req.exit_code {
                    Some(code) => format!("exit code {}", code),
                    None => "task failed".to_string(),
                });
                AttemptEnd::new(Outcome::Failed).detail(detail)
            }
            ReportOutcome::Rejected => {
                let detail = FabricError::CapacityExceeded(req.agent_id).to_string();
                tracing::warn!(task_id = %req.task_id, agent_id = %req.agent_id, "Agent rejected assignment");
                AttemptEnd::new(Outcome::Rejected).detail(detail)
            }
        };
        if req.duration_ms > 0 {
            end.duration_ms = Some(req.duration_ms);
        }
        end.exit_code = req.exit_code;
        end.summary = req.summary;
        state.end_attempt(&req.task_id, end, now);
        drop(state);

        self.wakeup.notify_one();
        Ok(ReportResponse { accepted: true })
    }

    /// One dispatch pass: assign everything that can be assigned, then
    /// deliver outside the lock. Returns how many deliveries succeeded.
    pub async fn dispatch_once(&self, now: Instant) -> usize {
        if !self.store_healthy() {
            tracing::debug!("Dispatch paused while the result store is unavailable");
            return 0;
        }

        let planned = {
            let mut state = self.state.lock().await;
            let mut planned = Vec::new();
            while let Some(task_id) = state.reserve_next() {
                let step = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    state.assign_reserved(task_id, &self.config, now)
                }));
                match step {
                    Ok(Ok(Some(p))) => planned.push(p),
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        tracing::error!(task_id = %task_id, error = %e, "Assignment failed, quarantining task");
                        state.quarantine(&task_id, e.to_string(), now);
                    }
                    Err(panic) => {
                        let reason = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "dispatch panicked".to_string());
                        tracing::error!(task_id = %task_id, reason = %reason, "Dispatch panicked, quarantining task");
                        state.quarantine(&task_id, reason, now);
                    }
                }
            }
            planned
        };
        if planned.is_empty() {
            return 0;
        }

        let timeout = self.config.delivery_timeout;
        let results = futures::future::join_all(planned.into_iter().map(|p| async move {
            let result = match tokio::time::timeout(timeout, self.delivery.deliver(p.agent_id, p.message.clone())).await {
                Ok(result) => result,
                Err(_) => Err(FabricError::Connection(format!(
                    "delivery to agent {} timed out",
                    p.agent_id
                ))),
            };
            (p, result)
        }))
        .await;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (p, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => failed.push((p, e)),
            }
        }
        if !failed.is_empty() {
            let mut state = self.state.lock().await;
            for (p, e) in failed {
                tracing::warn!(task_id = %p.message.task_id, agent_id = %p.agent_id, error = %e, "Delivery failed");
                let live = state
                    .assignments
                    .live_attempt(&p.message.task_id, &p.agent_id, p.message.attempt)
                    .is_ok();
                if live {
                    let end = AttemptEnd::new(Outcome::DeliveryFailed).detail(e.to_string());
                    state.end_attempt(&p.message.task_id, end, Instant::now());
                }
                state.registry.mark_suspect(&p.agent_id);
            }
        }
        delivered
    }

    /// Reclaim attempts whose deadline plus grace has passed.
    pub async fn check_timeouts(&self, now: Instant) -> usize {
        let mut state = self.state.lock().await;
        let expired = state.assignments.expired(now);
        for task_id in &expired {
            let Some(assignment) = state.assignments.get(task_id).cloned() else {
                continue;
            };
            tracing::warn!(
                task_id = %task_id,
                agent_id = %assignment.agent_id,
                attempt = assignment.attempt,
                "Attempt timed out"
            );
            let detail = format!("no result after {}ms", assignment.elapsed(now).as_millis());
            state.end_attempt(task_id, AttemptEnd::new(Outcome::TimedOut).detail(detail), now);
            state
                .cancellations
                .entry(assignment.agent_id)
                .or_default()
                .push(*task_id);
        }
        drop(state);
        if !expired.is_empty() {
            self.wakeup.notify_one();
        }
        expired.len()
    }

    /// Age agent health and reclaim the work of agents that just died.
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let report = {
            let mut state = self.state.lock().await;
            let report = state.registry.sweep_stale(now);
            for agent_id in &report.died {
                let lost = state.reclaim_agent(agent_id, "agent stopped heartbeating", now);
                state.cancellations.remove(agent_id);
                if lost > 0 {
                    tracing::warn!(agent_id = %agent_id, lost, "Reclaimed tasks of dead agent");
                }
            }
            for agent_id in &report.evicted {
                self.delivery.close(*agent_id);
            }
            report
        };
        if !report.died.is_empty() {
            self.wakeup.notify_one();
        }
        report
    }

    /// Cancel a task. A live attempt is closed as cancelled and its agent
    /// is told to kill the process.
    pub async fn cancel(&self, task_id: Uuid, now: Instant) -> Result<Task> {
        let mut state = self.state.lock().await;
        if state.queue.get_task(&task_id).is_none() {
            drop(state);
            return match self.store.find_task(task_id).await? {
                Some(task) => Err(FabricError::InvalidState(format!(
                    "task {} is already {}",
                    task_id, task.state
                ))),
                None => Err(FabricError::TaskNotFound(task_id)),
            };
        }

        match state.assignments.get(&task_id).map(|a| a.agent_id) {
            Some(agent_id) => {
                let end = AttemptEnd::new(Outcome::Cancelled).detail("cancelled by requester");
                state.end_attempt(&task_id, end, now);
                state.cancellations.entry(agent_id).or_default().push(task_id);
            }
            None => {
                state.queue.cancel(&task_id)?;
                state.archive(&task_id);
            }
        }
        tracing::info!(task_id = %task_id, "Task cancelled");
        state
            .queue
            .get_task(&task_id)
            .cloned()
            .ok_or(FabricError::TaskNotFound(task_id))
    }

    /// Drop an agent on operator request, reclaiming its work.
    pub async fn unregister(&self, agent_id: Uuid, now: Instant) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.registry.get(&agent_id).is_none() {
                return Err(FabricError::UnknownAgent(agent_id));
            }
            state.reclaim_agent(&agent_id, "agent unregistered", now);
            state.registry.remove(&agent_id);
            state.cancellations.remove(&agent_id);
            self.delivery.close(agent_id);
        }
        tracing::info!(agent_id = %agent_id, "Agent unregistered");
        self.wakeup.notify_one();
        Ok(())
    }

    pub async fn set_capacity(&self, agent_id: Uuid, capacity: u32) -> Result<()> {
        self.state
            .lock()
            .await
            .registry
            .set_capacity(&agent_id, capacity)?;
        self.wakeup.notify_one();
        Ok(())
    }

    /// Current task state, falling back to the archive once evicted.
    pub async fn task(&self, task_id: Uuid) -> Result<Task> {
        let live = self.state.lock().await.queue.get_task(&task_id).cloned();
        match live {
            Some(task) => Ok(task),
            None => self
                .store
                .find_task(task_id)
                .await?
                .ok_or(FabricError::TaskNotFound(task_id)),
        }
    }

    pub async fn agents(&self) -> Vec<AgentState> {
        self.state
            .lock()
            .await
            .registry
            .all_agents()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.state
            .lock()
            .await
            .queue
            .all_tasks()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn summary(&self) -> EngineSummary {
        let state = self.state.lock().await;
        let mut summary = EngineSummary {
            pending: state.queue.count_in_state(TaskState::Pending),
            requeued: state.queue.count_in_state(TaskState::Requeued),
            assigned: state.queue.count_in_state(TaskState::Assigned),
            running: state.queue.count_in_state(TaskState::Running),
            succeeded: state.queue.count_in_state(TaskState::Succeeded),
            failed: state.queue.count_in_state(TaskState::Failed),
            cancelled: state.queue.count_in_state(TaskState::Cancelled),
            unflushed_results: state.outbox.len(),
            store_healthy: self.store_healthy(),
            ..Default::default()
        };
        for agent in state.registry.all_agents() {
            match agent.health {
                AgentHealth::Healthy => summary.agents_healthy += 1,
                AgentHealth::Suspect => summary.agents_suspect += 1,
                AgentHealth::Dead => summary.agents_dead += 1,
            }
            if agent.health != AgentHealth::Dead {
                summary.total_capacity += agent.capacity;
            }
            summary.total_load += agent.load();
        }
        summary
    }

    /// Write queued results to the store in order. On failure the write
    /// stays queued and dispatch pauses until a later flush succeeds.
    pub async fn flush(&self) -> Result<usize> {
        let _flusher = self.flush_lock.lock().await;
        let mut written = 0;
        loop {
            let next = self.state.lock().await.outbox.front().cloned();
            let Some(write) = next else {
                break;
            };
            let result = match &write {
                StoreWrite::Record(record) => self.store.append(record).await,
                StoreWrite::Archive(task) => self.store.archive_task(task).await,
            };
            if let Err(e) = result {
                if self.store_healthy.swap(false, Ordering::SeqCst) {
                    tracing::error!(error = %e, "Result store unavailable, pausing dispatch");
                }
                return Err(e);
            }
            self.state.lock().await.outbox.pop_front();
            written += 1;
        }
        if !self.store_healthy.swap(true, Ordering::SeqCst) {
            tracing::info!("Result store recovered, resuming dispatch");
            self.wakeup.notify_one();
        }
        Ok(written)
    }

    /// Evict terminal tasks past the retention window. Skipped while
    /// archive writes are still queued.
    pub async fn cleanup_finished(&self) -> usize {
        let mut state = self.state.lock().await;
        if !state.outbox.is_empty() {
            return 0;
        }
        let retention = chrono::Duration::from_std(self.config.finished_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let removed = state.queue.cleanup_finished(Utc::now() - retention);
        if removed > 0 {
            tracing::debug!(removed, "Evicted finished tasks");
        }
        removed
    }

    /// Cross-check queue, registry and assignments. Returns one line per
    /// violated invariant.
    pub async fn check_consistency(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut violations = Vec::new();

        for agent in state.registry.all_agents() {
            if agent.load() > agent.capacity {
                violations.push(format!(
                    "agent {} holds {} tasks with capacity {}",
                    agent.id,
                    agent.load(),
                    agent.capacity
                ));
            }
            for task_id in &agent.live_tasks {
                if state.assignments.get(task_id).map(|a| a.agent_id) != Some(agent.id) {
                    violations.push(format!(
                        "agent {} holds task {} without a matching assignment",
                        agent.id, task_id
                    ));
                }
            }
        }

        for task in state.queue.all_tasks() {
            let assignment = state.assignments.get(&task.id);
            match (task.state.is_live(), assignment) {
                (true, Some(a)) if Some(a.agent_id) == task.assigned_agent && a.attempt == task.attempt => {}
                (true, _) => violations.push(format!(
                    "task {} is {} without a matching assignment",
                    task.id, task.state
                )),
                (false, Some(a)) => violations.push(format!(
                    "task {} is {} but attempt {} is live",
                    task.id, task.state, a.attempt
                )),
                (false, None) => {}
            }
        }

        let bound: usize = state.registry.all_agents().iter().map(|a| a.live_tasks.len()).sum();
        if bound != state.assignments.len() {
            violations.push(format!(
                "{} bound slots for {} live assignments",
                bound,
                state.assignments.len()
            ));
        }
        violations
    }

    /// Spawn the dispatch, monitor and flush loops on `tracker`. They stop
    /// when `shutdown` fires; the flush loop drains the outbox one last time.
    pub fn spawn_loops(self: &Arc<Self>, tracker: &TaskTracker, shutdown: CancellationToken) {
        let engine = self.clone();
        let token = shutdown.clone();
        tracker.spawn(async move { engine.dispatch_loop(token).await });

        let engine = self.clone();
        let token = shutdown.clone();
        tracker.spawn(async move { engine.monitor_loop(token).await });

        let engine = self.clone();
        tracker.spawn(async move { engine.flush_loop(shutdown).await });
    }

    async fn dispatch_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.dispatch_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.wakeup.notified() => {}
            }
            self.dispatch_once(Instant::now()).await;
        }
        tracing::debug!("Dispatch loop stopped");
    }

    async fn monitor_loop(&self, shutdown: CancellationToken) {
        let mut timeouts = tokio::time::interval(self.config.timeout_tick);
        let mut sweeps = tokio::time::interval(self.config.sweep_interval);
        timeouts.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweeps.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timeouts.tick() => {
                    self.check_timeouts(Instant::now()).await;
                }
                _ = sweeps.tick() => {
                    self.sweep(Instant::now()).await;
                    self.cleanup_finished().await;
                    for violation in self.check_consistency().await {
                        tracing::error!(violation = %violation, "Scheduling state inconsistent");
                    }
                }
            }
        }
        tracing::debug!("Monitor loop stopped");
    }

    async fn flush_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.flush().await {
                        tracing::debug!(error = %e, "Result flush failed");
                    }
                }
            }
        }
        match self.flush().await {
            Ok(written) => tracing::info!(written, "Final result flush complete"),
            Err(e) => tracing::error!(error = %e, "Final result flush failed, unwritten results lost"),
        }
    }
}
