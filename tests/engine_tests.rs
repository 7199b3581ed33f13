//! Dispatch engine scenarios driven with a virtual clock.
//!
//! Every test calls the engine's loop steps (`dispatch_once`, `sweep`,
//! `check_timeouts`) directly with explicit instants instead of spawning
//! the background loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use buildfarm_lite::config::DispatchConfig;
use buildfarm_lite::scheduler::task::{Outcome, ResourceProfile, Task, TaskPayload, TaskSpec, TaskState};
use buildfarm_lite::scheduler::{AgentHealth, DispatchEngine, HealthSignal};
use buildfarm_lite::store::{MemoryStore, ResultQuery, ResultRecord, ResultStore};
use buildfarm_lite::transport::delivery::{Delivery, Mailbox};
use buildfarm_lite::transport::protocol::{
    AssignmentMessage, HeartbeatRequest, RegisterRequest, ReportOutcome, ReportRequest,
};
use buildfarm_lite::{FabricError, Result};

fn test_config() -> DispatchConfig {
    DispatchConfig {
        suspect_window: Duration::from_secs(5),
        dead_window: Duration::from_secs(20),
        dead_retention: Duration::from_secs(60),
        max_retries: 3,
        report_grace: Duration::from_secs(1),
        ..DispatchConfig::default()
    }
}

struct Fixture {
    engine: DispatchEngine,
    store: Arc<MemoryStore>,
}

impl Fixture {
    fn new(config: DispatchConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let engine = DispatchEngine::new(config, store.clone(), Arc::new(Mailbox::new()));
        Self { engine, store }
    }

    async fn agent(&self, capacity: u32, now: Instant) -> Uuid {
        self.agent_with_labels(capacity, &[], now).await
    }

    async fn agent_with_labels(&self, capacity: u32, labels: &[&str], now: Instant) -> Uuid {
        self.engine
            .register(registration(None, capacity, labels), now)
            .await
            .unwrap()
    }

    async fn submit(&self, cmd: &str, priority: u8) -> Uuid {
        self.engine
            .submit(TaskSpec::new(TaskPayload::shell(cmd)).with_priority(priority))
            .await
            .unwrap()
    }

    async fn state(&self, task_id: Uuid) -> TaskState {
        self.engine.task(task_id).await.unwrap().state
    }

    /// Poll `agent` and expect exactly one assignment.
    async fn take_one(&self, agent: Uuid) -> AssignmentMessage {
        let mut polled = self.engine.poll(agent).await.unwrap();
        assert_eq!(polled.assignments.len(), 1, "expected one assignment");
        polled.assignments.remove(0)
    }

    async fn report(&self, agent: Uuid, message: &AssignmentMessage, outcome: ReportOutcome, now: Instant) -> bool {
        self.engine
            .report(ReportRequest::new(agent, message, outcome), now)
            .await
            .unwrap()
            .accepted
    }

    async fn assert_consistent(&self) {
        let violations = self.engine.check_consistency().await;
        assert!(violations.is_empty(), "violations: {:?}", violations);
    }
}

fn registration(agent_id: Option<Uuid>, capacity: u32, labels: &[&str]) -> RegisterRequest {
    RegisterRequest {
        agent_id,
        hostname: "builder".to_string(),
        address: "10.0.0.1:0".to_string(),
        version: "test".to_string(),
        capacity,
        labels: labels.iter().map(|l| l.to_string()).collect(),
    }
}

fn heartbeat(agent_id: Uuid, load: u32) -> HeartbeatRequest {
    HeartbeatRequest {
        agent_id,
        load,
        signal: HealthSignal::Normal,
    }
}

#[tokio::test]
async fn test_task_runs_to_success_and_is_recorded() {
    let f = Fixture::new(test_config());
    let now = Instant::now();
    let agent = f.agent(1, now).await;
    let task = f.submit("make -j1 foo.o", 0).await;
    assert_eq!(f.state(task).await, TaskState::Pending);

    assert_eq!(f.engine.dispatch_once(now).await, 1);
    assert_eq!(f.state(task).await, TaskState::Assigned);
    f.assert_consistent().await;

    let message = f.take_one(agent).await;
    assert_eq!(message.task_id, task);
    assert_eq!(message.attempt, 1);

    assert!(f.report(agent, &message, ReportOutcome::Started, now).await);
    assert_eq!(f.state(task).await, TaskState::Running);

    let done = ReportRequest {
        exit_code: Some(0),
        duration_ms: 1200,
        summary: Some("built foo.o".to_string()),
        ..ReportRequest::new(agent, &message, ReportOutcome::Succeeded)
    };
    assert!(f.engine.report(done, now).await.unwrap().accepted);

    let finished = f.engine.task(task).await.unwrap();
    assert_eq!(finished.state, TaskState::Succeeded);
    assert_eq!(finished.outcome, Some(Outcome::Succeeded));
    assert_eq!(finished.summary.as_deref(), Some("built foo.o"));
    f.assert_consistent().await;

    assert_eq!(f.engine.flush().await.unwrap(), 2);
    let records = f.store.records_for_task(task).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempt, 1);
    assert_eq!(records[0].outcome, Outcome::Succeeded);
    assert_eq!(records[0].agent_id, Some(agent));
    assert_eq!(records[0].duration_ms, 1200);

    let archived = f.store.find_task(task).await.unwrap().unwrap();
    assert_eq!(archived.state, TaskState::Succeeded);
}

#[tokio::test]
async fn test_dead_agent_work_moves_to_healthy_agent() {
    let config = test_config();
    let dead_window = config.dead_window;
    let f = Fixture::new(config);
    let start = Instant::now();
    let first = f.agent(1, start).await;
    let second = f.agent(1, start).await;

    let task = f.submit("cc -c a.c", 0).await;
    assert_eq!(f.engine.dispatch_once(start).await, 1);
    let owner = f.engine.task(task).await.unwrap().assigned_agent.unwrap();
    let survivor = if owner == first { second } else { first };

    let message = f.take_one(owner).await;
    assert!(f.report(owner, &message, ReportOutcome::Started, start).await);

    // Only the survivor keeps heartbeating
    let later = start + dead_window;
    f.engine.heartbeat(heartbeat(survivor, 0), later).await.unwrap();
    let report = f.engine.sweep(later).await;
    assert_eq!(report.died, vec![owner]);

    let requeued = f.engine.task(task).await.unwrap();
    assert_eq!(requeued.state, TaskState::Requeued);
    assert_eq!(requeued.retry_count, 1);
    assert_eq!(requeued.last_error.as_ref().unwrap().class, "agent_lost");
    f.assert_consistent().await;

    assert_eq!(f.engine.dispatch_once(later).await, 1);
    let reassigned = f.engine.task(task).await.unwrap();
    assert_eq!(reassigned.assigned_agent, Some(survivor));
    assert_eq!(reassigned.attempt, 2);

    // The dead agent has to register again before it gets anything
    assert!(matches!(
        f.engine.heartbeat(heartbeat(owner, 1), later).await,
        Err(FabricError::UnknownAgent(id)) if id == owner
    ));
    assert!(matches!(f.engine.poll(owner).await, Err(FabricError::UnknownAgent(_))));
}

#[tokio::test]
async fn test_suspect_agent_keeps_work_but_gets_nothing_new() {
    let config = test_config();
    let suspect_window = config.suspect_window;
    let f = Fixture::new(config);
    let start = Instant::now();
    let agent = f.agent(2, start).await;

    let first = f.submit("true", 0).await;
    assert_eq!(f.engine.dispatch_once(start).await, 1);

    let later = start + suspect_window;
    let report = f.engine.sweep(later).await;
    assert_eq!(report.suspected, vec![agent]);
    assert_eq!(f.state(first).await, TaskState::Assigned);

    let second = f.submit("true", 0).await;
    assert_eq!(f.engine.dispatch_once(later).await, 0);
    assert_eq!(f.state(second).await, TaskState::Pending);

    // A heartbeat brings it back
    f.engine.heartbeat(heartbeat(agent, 1), later).await.unwrap();
    assert_eq!(f.engine.dispatch_once(later).await, 1);
    assert_eq!(f.state(second).await, TaskState::Assigned);
    f.assert_consistent().await;
}

#[tokio::test]
async fn test_equal_priority_is_fifo() {
    let f = Fixture::new(test_config());
    let now = Instant::now();
    let agent = f.agent(1, now).await;
    let t1 = f.submit("echo 1", 5).await;
    let t2 = f.submit("echo 2", 5).await;

    assert_eq!(f.engine.dispatch_once(now).await, 1);
    let message = f.take_one(agent).await;
    assert_eq!(message.task_id, t1);
    assert_eq!(f.state(t2).await, TaskState::Pending);

    assert!(f.report(agent, &message, ReportOutcome::Succeeded, now).await);
    assert_eq!(f.engine.dispatch_once(now).await, 1);
    assert_eq!(f.take_one(agent).await.task_id, t2);
}

#[tokio::test]
async fn test_higher_priority_goes_first() {
    let f = Fixture::new(test_config());
    let now = Instant::now();
    let agent = f.agent(1, now).await;
    let _low = f.submit("echo low", 1).await;
    let high = f.submit("echo high", 9).await;

    assert_eq!(f.engine.dispatch_once(now).await, 1);
    assert_eq!(f.take_one(agent).await.task_id, high);
}

#[tokio::test]
async fn test_timeout_requeues_and_late_report_is_stale() {
    let config = test_config();
    let grace = config.report_grace;
    let f = Fixture::new(config);
    let start = Instant::now();
    let agent = f.agent(1, start).await;

    let task = f
        .engine
        .submit(TaskSpec::new(TaskPayload::shell("sleep 100")).with_timeout(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(f.engine.dispatch_once(start).await, 1);
    let message = f.take_one(agent).await;
    assert!(f.report(agent, &message, ReportOutcome::Started, start).await);

    // Not yet: deadline passed but grace has not
    let at_deadline = start + Duration::from_secs(2);
    assert_eq!(f.engine.check_timeouts(at_deadline).await, 0);

    let expired = at_deadline + grace + Duration::from_millis(1);
    assert_eq!(f.engine.check_timeouts(expired).await, 1);
    let requeued = f.engine.task(task).await.unwrap();
    assert_eq!(requeued.state, TaskState::Requeued);
    assert_eq!(requeued.retry_count, 1);
    assert_eq!(requeued.last_error.as_ref().unwrap().class, "timeout");
    f.assert_consistent().await;

    // The agent is told to kill the process on its next heartbeat
    let beat = f.engine.heartbeat(heartbeat(agent, 1), expired).await.unwrap();
    assert_eq!(beat.cancel, vec![task]);

    // The original attempt's late result changes nothing
    let late = ReportRequest {
        exit_code: Some(0),
        ..ReportRequest::new(agent, &message, ReportOutcome::Succeeded)
    };
    assert!(!f.engine.report(late, expired).await.unwrap().accepted);
    let after = f.engine.task(task).await.unwrap();
    assert_eq!(after.state, TaskState::Requeued);
    assert_eq!(after.retry_count, 1);

    f.engine.flush().await.unwrap();
    let records = f.store.records_for_task(task).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Outcome::TimedOut);
}

#[tokio::test]
async fn test_exhausted_retries_fail_without_further_dispatch() {
    let mut config = test_config();
    config.max_retries = 2;
    let f = Fixture::new(config);
    let now = Instant::now();
    let agent = f.agent(1, now).await;
    let task = f.submit("exit 1", 0).await;

    for attempt in 1..=3 {
        assert_eq!(f.engine.dispatch_once(now).await, 1, "attempt {}", attempt);
        let message = f.take_one(agent).await;
        assert_eq!(message.attempt, attempt);
        let failed = ReportRequest {
            exit_code: Some(1),
            error: Some("compiler exited 1".to_string()),
            ..ReportRequest::new(agent, &message, ReportOutcome::Failed)
        };
        assert!(f.engine.report(failed, now).await.unwrap().accepted);
    }

    let failed = f.engine.task(task).await.unwrap();
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.retry_count, 2);
    let error = failed.last_error.as_ref().unwrap();
    assert_eq!(error.class, "task_execution");
    assert_eq!(error.message, "compiler exited 1");

    assert_eq!(f.engine.dispatch_once(now).await, 0);
    assert!(f.engine.poll(agent).await.unwrap().assignments.is_empty());

    f.engine.flush().await.unwrap();
    let attempts: Vec<u32> = f
        .store
        .records_for_task(task)
        .await
        .unwrap()
        .iter()
        .map(|r| r.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_rejection_requeues_elsewhere() {
    let f = Fixture::new(test_config());
    let now = Instant::now();
    let busy = f.agent(1, now).await;
    let task = f.submit("true", 0).await;
    assert_eq!(f.engine.dispatch_once(now).await, 1);

    let message = f.take_one(busy).await;
    assert!(f.report(busy, &message, ReportOutcome::Rejected, now).await);
    let requeued = f.engine.task(task).await.unwrap();
    assert_eq!(requeued.state, TaskState::Requeued);
    assert_eq!(requeued.last_error.as_ref().unwrap().class, "capacity_exceeded");

    let idle = f.agent(2, now).await;
    f.engine.set_capacity(busy, 0).await.unwrap();
    assert_eq!(f.engine.dispatch_once(now).await, 1);
    assert_eq!(f.engine.task(task).await.unwrap().assigned_agent, Some(idle));
}

#[tokio::test]
async fn test_report_from_wrong_agent_is_stale() {
    let f = Fixture::new(test_config());
    let now = Instant::now();
    let owner = f.agent(1, now).await;
    let other = f.agent(1, now).await;
    let task = f.submit("true", 0).await;
    assert_eq!(f.engine.dispatch_once(now).await, 1);

    let assigned = f.engine.task(task).await.unwrap().assigned_agent.unwrap();
    let intruder = if assigned == owner { other } else { owner };
    let message = f.take_one(assigned).await;

    assert!(!f.report(intruder, &message, ReportOutcome::Succeeded, now).await);
    assert_eq!(f.state(task).await, TaskState::Assigned);

    let wrong_attempt = AssignmentMessage {
        attempt: message.attempt + 1,
        ..message.clone()
    };
    assert!(!f.report(assigned, &wrong_attempt, ReportOutcome::Succeeded, now).await);
    assert!(f.report(assigned, &message, ReportOutcome::Succeeded, now).await);
    assert!(!f.report(assigned, &message, ReportOutcome::Succeeded, now).await);
    f.assert_consistent().await;
}

#[tokio::test]
async fn test_labels_gate_dispatch() {
    let f = Fixture::new(test_config());
    let now = Instant::now();
    let plain = f.agent(4, now).await;
    let task = f
        .engine
        .submit(TaskSpec::new(TaskPayload::shell("nvcc k.cu")).with_profile(ResourceProfile::default().with_label("cuda")))
        .await
        .unwrap();

    assert_eq!(f.engine.dispatch_once(now).await, 0);
    assert_eq!(f.state(task).await, TaskState::Pending);
    assert!(f.engine.poll(plain).await.unwrap().assignments.is_empty());

    let gpu = f.agent_with_labels(1, &["cuda", "linux"], now).await;
    assert_eq!(f.engine.dispatch_once(now).await, 1);
    assert_eq!(f.take_one(gpu).await.task_id, task);
}

#[tokio::test]
async fn test_least_loaded_agent_is_chosen() {
    let f = Fixture::new(test_config());
    let now = Instant::now();
    let a = f.agent(4, now).await;
    let b = f.agent(4, now).await;

    for _ in 0..4 {
        f.submit("true", 0).await;
    }
    assert_eq!(f.engine.dispatch_once(now).await, 4);
    let agents = f.engine.agents().await;
    for agent in agents.iter().filter(|x| x.id == a || x.id == b) {
        assert_eq!(agent.load(), 2);
    }
}

#[tokio::test]
async fn test_cancel_pending_and_running_tasks() {
    let f = Fixture::new(test_config());
    let now = Instant::now();
    let agent = f.agent(1, now).await;
    let running = f.submit("sleep 60", 0).await;
    let pending = f.submit("sleep 60", 0).await;
    assert_eq!(f.engine.dispatch_once(now).await, 1);
    let message = f.take_one(agent).await;
    assert_eq!(message.task_id, running);
    assert!(f.report(agent, &message, ReportOutcome::Started, now).await);

    let cancelled = f.engine.cancel(pending, now).await.unwrap();
    assert_eq!(cancelled.state, TaskState::Cancelled);

    let cancelled = f.engine.cancel(running, now).await.unwrap();
    assert_eq!(cancelled.state, TaskState::Cancelled);
    assert_eq!(f.engine.summary().await.total_load, 0);
    f.assert_consistent().await;

    let polled = f.engine.poll(agent).await.unwrap();
    assert_eq!(polled.cancel, vec![running]);

    // The killed process still reports; the server no longer cares
    assert!(!f.report(agent, &message, ReportOutcome::Failed, now).await);
    assert_eq!(f.state(running).await, TaskState::Cancelled);

    assert!(matches!(
        f.engine.cancel(running, now).await,
        Err(FabricError::InvalidState(_))
    ));
    assert_eq!(f.engine.dispatch_once(now).await, 0);
}

#[tokio::test]
async fn test_cancel_of_evicted_task_uses_archive() {
    let mut config = test_config();
    config.finished_retention = Duration::ZERO;
    let f = Fixture::new(config);
    let now = Instant::now();
    let agent = f.agent(1, now).await;
    let task = f.submit("true", 0).await;
    f.engine.dispatch_once(now).await;
    let message = f.take_one(agent).await;
    assert!(f.report(agent, &message, ReportOutcome::Succeeded, now).await);

    f.engine.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(f.engine.cleanup_finished().await, 1);
    assert!(f.engine.tasks().await.is_empty());

    assert_eq!(f.state(task).await, TaskState::Succeeded);
    assert!(matches!(
        f.engine.cancel(task, now).await,
        Err(FabricError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_unregister_reclaims_work() {
    let f = Fixture::new(test_config());
    let now = Instant::now();
    let agent = f.agent(2, now).await;
    let task = f.submit("true", 0).await;
    f.engine.dispatch_once(now).await;

    f.engine.unregister(agent, now).await.unwrap();
    let task = f.engine.task(task).await.unwrap();
    assert_eq!(task.state, TaskState::Requeued);
    assert_eq!(task.last_error.as_ref().unwrap().class, "agent_lost");
    assert!(f.engine.agents().await.is_empty());
    assert!(matches!(f.engine.poll(agent).await, Err(FabricError::UnknownAgent(_))));
    assert!(matches!(
        f.engine.unregister(agent, now).await,
        Err(FabricError::UnknownAgent(_))
    ));
    f.assert_consistent().await;
}

#[tokio::test]
async fn test_reregistration_abandons_running_attempts() {
    let f = Fixture::new(test_config());
    let now = Instant::now();
    let agent = f.agent(1, now).await;
    let task = f.submit("true", 0).await;
    f.engine.dispatch_once(now).await;
    let message = f.take_one(agent).await;
    assert!(f.report(agent, &message, ReportOutcome::Started, now).await);

    let same = f
        .engine
        .register(registration(Some(agent), 1, &[]), now)
        .await
        .unwrap();
    assert_eq!(same, agent);
    assert_eq!(f.engine.agents().await.len(), 1);

    let requeued = f.engine.task(task).await.unwrap();
    assert_eq!(requeued.state, TaskState::Requeued);
    assert!(!f.report(agent, &message, ReportOutcome::Succeeded, now).await);

    assert_eq!(f.engine.dispatch_once(now).await, 1);
    assert_eq!(f.take_one(agent).await.attempt, 2);
}

#[tokio::test]
async fn test_set_capacity_rules() {
    let f = Fixture::new(test_config());
    let now = Instant::now();
    let agent = f.agent(2, now).await;
    f.submit("true", 0).await;
    f.submit("true", 0).await;
    assert_eq!(f.engine.dispatch_once(now).await, 2);

    assert!(matches!(
        f.engine.set_capacity(agent, 1).await,
        Err(FabricError::InvalidState(_))
    ));
    f.engine.set_capacity(agent, 3).await.unwrap();
    assert!(matches!(
        f.engine.set_capacity(Uuid::new_v4(), 3).await,
        Err(FabricError::UnknownAgent(_))
    ));

    let beat = f.engine.heartbeat(heartbeat(agent, 2), now).await.unwrap();
    assert_eq!(beat.capacity, 3);
}

#[tokio::test]
async fn test_queue_full_rejects_submission() {
    let mut config = test_config();
    config.max_tasks = 2;
    let f = Fixture::new(config);
    f.submit("true", 0).await;
    f.submit("true", 0).await;
    assert!(matches!(
        f.engine.submit(TaskSpec::new(TaskPayload::shell("true"))).await,
        Err(FabricError::QueueFull)
    ));
}

#[tokio::test]
async fn test_summary_counts() {
    let f = Fixture::new(test_config());
    let now = Instant::now();
    let agent = f.agent(2, now).await;
    f.submit("a", 0).await;
    f.submit("b", 0).await;
    f.submit("c", 0).await;
    f.engine.dispatch_once(now).await;
    let message = f.take_one_of(agent).await;
    assert!(f.report(agent, &message, ReportOutcome::Succeeded, now).await);

    let summary = f.engine.summary().await;
    assert_eq!(summary.agents_healthy, 1);
    assert_eq!(summary.total_capacity, 2);
    assert_eq!(summary.total_load, 1);
    assert_eq!(summary.pending, 1);
    assert_eq!(summary.assigned, 1);
    assert_eq!(summary.succeeded, 1);
    assert!(summary.unflushed_results > 0);
    assert!(summary.store_healthy);
}

impl Fixture {
    /// Poll `agent` and take the first of possibly several assignments.
    async fn take_one_of(&self, agent: Uuid) -> AssignmentMessage {
        let mut polled = self.engine.poll(agent).await.unwrap();
        assert!(!polled.assignments.is_empty());
        polled.assignments.remove(0)
    }
}

// =============================================================================
// Failure injection
// =============================================================================

/// Memory store that fails every write while `broken` is set.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    broken: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(FabricError::Store("disk I/O error".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for FlakyStore {
    async fn append(&self, record: &ResultRecord) -> Result<()> {
        self.check()?;
        self.inner.append(record).await
    }

    async fn archive_task(&self, task: &Task) -> Result<()> {
        self.check()?;
        self.inner.archive_task(task).await
    }

    async fn records_for_task(&self, task_id: Uuid) -> Result<Vec<ResultRecord>> {
        self.inner.records_for_task(task_id).await
    }

    async fn query(&self, query: &ResultQuery) -> Result<Vec<ResultRecord>> {
        self.inner.query(query).await
    }

    async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.inner.find_task(task_id).await
    }
}

#[tokio::test]
async fn test_store_outage_pauses_dispatch_without_losing_results() {
    let store = Arc::new(FlakyStore::default());
    let engine = DispatchEngine::new(test_config(), store.clone(), Arc::new(Mailbox::new()));
    let now = Instant::now();
    let agent = engine.register(registration(None, 1, &[]), now).await.unwrap();

    let first = engine.submit(TaskSpec::new(TaskPayload::shell("true"))).await.unwrap();
    engine.dispatch_once(now).await;
    let message = engine.poll(agent).await.unwrap().assignments.remove(0);
    engine
        .report(ReportRequest::new(agent, &message, ReportOutcome::Succeeded), now)
        .await
        .unwrap();

    store.broken.store(true, Ordering::SeqCst);
    assert!(matches!(engine.flush().await, Err(FabricError::Store(_))));
    assert!(!engine.store_healthy());

    let second = engine.submit(TaskSpec::new(TaskPayload::shell("true"))).await.unwrap();
    assert_eq!(engine.dispatch_once(now).await, 0);
    assert_eq!(engine.task(second).await.unwrap().state, TaskState::Pending);
    let summary = engine.summary().await;
    assert_eq!(summary.unflushed_results, 2);
    assert!(!summary.store_healthy);

    store.broken.store(false, Ordering::SeqCst);
    assert_eq!(engine.flush().await.unwrap(), 2);
    assert!(engine.store_healthy());
    assert_eq!(store.records_for_task(first).await.unwrap().len(), 1);

    assert_eq!(engine.dispatch_once(now).await, 1);
    assert_eq!(engine.task(second).await.unwrap().state, TaskState::Assigned);
}

/// Delivery that refuses every agent.
struct Unreachable;

#[async_trait]
impl Delivery for Unreachable {
    async fn deliver(&self, agent_id: Uuid, _message: AssignmentMessage) -> Result<()> {
        Err(FabricError::Connection(format!("agent {} unreachable", agent_id)))
    }

    fn open(&self, _agent_id: Uuid) {}

    fn close(&self, _agent_id: Uuid) {}
}

#[tokio::test]
async fn test_failed_delivery_requeues_and_suspects_agent() {
    let engine = DispatchEngine::new(test_config(), Arc::new(MemoryStore::new()), Arc::new(Unreachable));
    let now = Instant::now();
    let agent = engine.register(registration(None, 1, &[]), now).await.unwrap();
    let task = engine.submit(TaskSpec::new(TaskPayload::shell("true"))).await.unwrap();

    assert_eq!(engine.dispatch_once(now).await, 0);
    let task = engine.task(task).await.unwrap();
    assert_eq!(task.state, TaskState::Requeued);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.last_error.as_ref().unwrap().class, "connection");

    let agents = engine.agents().await;
    assert_eq!(agents[0].id, agent);
    assert_eq!(agents[0].health, AgentHealth::Suspect);
    assert_eq!(agents[0].load(), 0);
    assert!(engine.check_consistency().await.is_empty());
}

// =============================================================================
// Randomized invariants
// =============================================================================

#[tokio::test]
async fn test_random_churn_keeps_invariants() {
    let config = test_config();
    let max_retries = config.max_retries;
    let f = Fixture::new(config);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut now = Instant::now();
    let mut agents: Vec<Uuid> = Vec::new();
    let mut inflight: Vec<(Uuid, AssignmentMessage)> = Vec::new();

    for _ in 0..4 {
        agents.push(f.agent(rng.gen_range(1..=3), now).await);
    }

    for step in 0..600 {
        match rng.gen_range(0..10) {
            0 | 1 => {
                let priority = rng.gen_range(0..4);
                f.submit("true", priority).await;
            }
            2 | 3 => {
                f.engine.dispatch_once(now).await;
                for agent in &agents {
                    if let Ok(polled) = f.engine.poll(*agent).await {
                        inflight.extend(polled.assignments.into_iter().map(|m| (*agent, m)));
                    }
                }
            }
            4 | 5 if !inflight.is_empty() => {
                let (agent, message) = inflight.swap_remove(rng.gen_range(0..inflight.len()));
                let outcome = match rng.gen_range(0..4) {
                    0 => ReportOutcome::Failed,
                    1 => ReportOutcome::Rejected,
                    _ => ReportOutcome::Succeeded,
                };
                f.engine
                    .report(ReportRequest::new(agent, &message, outcome), now)
                    .await
                    .unwrap();
                // Replays must be dropped
                assert!(!f.report(agent, &message, outcome, now).await);
            }
            6 => {
                for agent in &agents {
                    if rng.gen_bool(0.8) {
                        let _ = f.engine.heartbeat(heartbeat(*agent, 0), now).await;
                    }
                }
            }
            7 => {
                now += Duration::from_secs(rng.gen_range(1..8));
                f.engine.sweep(now).await;
                f.engine.check_timeouts(now).await;
            }
            8 => {
                let agent = agents[rng.gen_range(0..agents.len())];
                let _ = f.engine.set_capacity(agent, rng.gen_range(0..=4)).await;
            }
            _ => {
                let agent = agents[rng.gen_range(0..agents.len())];
                f.engine
                    .register(registration(Some(agent), rng.gen_range(1..=3), &[]), now)
                    .await
                    .unwrap();
            }
        }

        let violations = f.engine.check_consistency().await;
        assert!(violations.is_empty(), "step {}: {:?}", step, violations);
        for task in f.engine.tasks().await {
            assert!(task.retry_count <= max_retries, "task {} over retry bound", task.id);
        }
    }
}

#[tokio::test]
async fn test_oversized_deadline_is_rejected_at_submit() {
    let f = Fixture::new(test_config());
    let spec = TaskSpec::new(TaskPayload::shell("make all")).with_timeout(Duration::from_secs(18_446_744_073_709_552));

    assert!(matches!(f.engine.submit(spec).await, Err(FabricError::Protocol(_))));
    assert!(f.engine.tasks().await.is_empty());
}

#[tokio::test]
async fn test_broken_task_is_failed_without_stalling_the_pass() {
    let f = Fixture::new(DispatchConfig {
        max_task_timeout: Duration::MAX,
        ..test_config()
    });
    let now = Instant::now();
    let agent = f.agent(1, now).await;

    // Submitted first, so the pass reaches it before the healthy task
    let broken = f
        .engine
        .submit(TaskSpec::new(TaskPayload::shell("cc -c a.c")).with_timeout(Duration::from_millis(u64::MAX)))
        .await
        .unwrap();
    let healthy = f.submit("cc -c b.c", 0).await;

    assert_eq!(f.engine.dispatch_once(now).await, 1);

    let task = f.engine.task(broken).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.last_error.as_ref().unwrap().class, "internal");
    assert!(task.assigned_agent.is_none());

    // The single slot went to the healthy task in the same pass
    assert_eq!(f.state(healthy).await, TaskState::Assigned);
    let message = f.take_one(agent).await;
    assert_eq!(message.task_id, healthy);
    let agents = f.engine.agents().await;
    assert_eq!(agents[0].live_tasks.len(), 1);
    assert!(agents[0].live_tasks.contains(&healthy));
    f.assert_consistent().await;

    f.engine.flush().await.unwrap();
    let records = f.store.records_for_task(broken).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Outcome::Failed);
}
