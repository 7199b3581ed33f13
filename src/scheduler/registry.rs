use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FabricError, Result};
use crate::scheduler::task::ResourceProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    Healthy,
    /// Missed heartbeats; keeps its work but gets nothing new
    Suspect,
    Dead,
}

impl std::fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentHealth::Healthy => write!(f, "healthy"),
            AgentHealth::Suspect => write!(f, "suspect"),
            AgentHealth::Dead => write!(f, "dead"),
        }
    }
}

/// Resource pressure an agent reports with each heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthSignal {
    #[default]
    Normal,
    /// Every local slot is busy
    Saturated,
}

/// Identity and declared resources of an agent at registration.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub id: Uuid,
    pub hostname: String,
    pub address: String,
    pub version: String,
    pub capacity: u32,
    pub labels: BTreeSet<String>,
}

/// Agent state tracking
#[derive(Debug, Clone)]
pub struct AgentState {
    pub id: Uuid,
    pub hostname: String,
    pub address: String,
    pub version: String,
    pub capacity: u32,
    pub labels: BTreeSet<String>,
    pub health: AgentHealth,
    pub last_heartbeat: Instant,
    pub last_heartbeat_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// Tasks holding one of this agent's slots
    pub live_tasks: HashSet<Uuid>,
    /// Load as last reported by the agent itself
    pub reported_load: u32,
    pub signal: HealthSignal,
    pub last_success: Option<Instant>,
    dead_since: Option<Instant>,
}

impl AgentState {
    fn new(info: AgentInfo, now: Instant) -> Self {
        Self {
            id: info.id,
            hostname: info.hostname,
            address: info.address,
            version: info.version,
            capacity: info.capacity,
            labels: info.labels,
            health: AgentHealth::Healthy,
            last_heartbeat: now,
            last_heartbeat_at: Utc::now(),
            registered_at: Utc::now(),
            live_tasks: HashSet::new(),
            reported_load: 0,
            signal: HealthSignal::Normal,
            last_success: None,
            dead_since: None,
        }
    }

    pub fn load(&self) -> u32 {
        self.live_tasks.len() as u32
    }

    pub fn spare(&self) -> u32 {
        self.capacity.saturating_sub(self.load())
    }

    /// Whether the agent may receive a task with this profile right now.
    pub fn can_accept(&self, profile: &ResourceProfile) -> bool {
        self.health == AgentHealth::Healthy && self.spare() > 0 && profile.satisfied_by(&self.labels)
    }
}

/// Health changes produced by one [`AgentRegistry::sweep_stale`] pass.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub suspected: Vec<Uuid>,
    /// Agents that just died. Their live tasks must be reclaimed.
    pub died: Vec<Uuid>,
    pub evicted: Vec<Uuid>,
}

/// Live view of known agents and their slot accounting
#[derive(Debug)]
pub struct AgentRegistry {
    agents: HashMap<Uuid, AgentState>,
    suspect_window: Duration,
    dead_window: Duration,
    dead_retention: Duration,
}

impl AgentRegistry {
    pub fn new(suspect_window: Duration, dead_window: Duration, dead_retention: Duration) -> Self {
        Self {
            agents: HashMap::new(),
            suspect_window,
            dead_window,
            dead_retention,
        }
    }

    /// Register or re-register an agent. Callers must reclaim the agent's
    /// live tasks before calling this on a known agent.
    pub fn upsert(&mut self, info: AgentInfo, now: Instant) {
        match self.agents.get_mut(&info.id) {
            Some(agent) => {
                agent.hostname = info.hostname;
                agent.address = info.address;
                agent.version = info.version;
                agent.capacity = info.capacity;
                agent.labels = info.labels;
                agent.health = AgentHealth::Healthy;
                agent.last_heartbeat = now;
                agent.last_heartbeat_at = Utc::now();
                agent.dead_since = None;
                tracing::info!(agent_id = %agent.id, capacity = agent.capacity, "Agent re-registered");
            }
            None => {
                tracing::info!(agent_id = %info.id, hostname = %info.hostname, capacity = info.capacity, "Agent registered");
                self.agents.insert(info.id, AgentState::new(info, now));
            }
        }
    }

    /// Update liveness and reported load. Dead and unknown agents must
    /// register again.
    pub fn record_heartbeat(
        &mut self,
        agent_id: &Uuid,
        reported_load: u32,
        signal: HealthSignal,
        now: Instant,
    ) -> Result<&AgentState> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .filter(|a| a.health != AgentHealth::Dead)
            .ok_or(FabricError::UnknownAgent(*agent_id))?;

        agent.last_heartbeat = now;
        agent.last_heartbeat_at = Utc::now();
        agent.reported_load = reported_load;
        agent.signal = signal;

        if agent.health == AgentHealth::Suspect {
            agent.health = AgentHealth::Healthy;
            tracing::info!(agent_id = %agent_id, "Agent recovered");
        }
        // Reporting less than tracked is normal until the agent polls new work
        if reported_load > agent.load() {
            tracing::warn!(
                agent_id = %agent_id,
                reported = reported_load,
                tracked = agent.load(),
                "Agent runs more than it was assigned, keeping tracked load"
            );
        } else if reported_load < agent.load() {
            tracing::debug!(
                agent_id = %agent_id,
                reported = reported_load,
                tracked = agent.load(),
                "Agent has not picked up all assignments yet"
            );
        }
        Ok(agent)
    }

    /// Demote agents whose heartbeats stopped and evict long-dead ones.
    pub fn sweep_stale(&mut self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for agent in self.agents.values_mut() {
            let silent = now.saturating_duration_since(agent.last_heartbeat);
            match agent.health {
                AgentHealth::Healthy | AgentHealth::Suspect if silent >= self.dead_window => {
                    agent.health = AgentHealth::Dead;
                    agent.dead_since = Some(now);
                    tracing::warn!(agent_id = %agent.id, silent_ms = silent.as_millis() as u64, "Agent marked dead");
                    report.died.push(agent.id);
                }
                AgentHealth::Healthy if silent >= self.suspect_window => {
                    agent.health = AgentHealth::Suspect;
                    tracing::warn!(agent_id = %agent.id, silent_ms = silent.as_millis() as u64, "Agent marked suspect");
                    report.suspected.push(agent.id);
                }
                AgentHealth::Dead if agent.live_tasks.is_empty() => {
                    let since = agent.dead_since.unwrap_or(agent.last_heartbeat);
                    if now.saturating_duration_since(since) >= self.dead_retention {
                        report.evicted.push(agent.id);
                    }
                }
                _ => {}
            }
        }

        for id in &report.evicted {
            self.agents.remove(id);
            tracing::info!(agent_id = %id, "Dead agent evicted");
        }
        report
    }

    /// Pick the least-loaded healthy agent able to run `profile`. Ties go
    /// to the agent with the most recent successful completion.
    pub fn select_candidate(&self, profile: &ResourceProfile) -> Option<Uuid> {
        self.agents
            .values()
            .filter(|a| a.can_accept(profile))
            .min_by_key(|a| (a.load(), Reverse(a.last_success), a.id))
            .map(|a| a.id)
    }

    pub fn has_candidate(&self, profile: &ResourceProfile) -> bool {
        self.agents.values().any(|a| a.can_accept(profile))
    }

    /// Take one slot of `agent_id` for `task_id`.
    pub fn bind(&mut self, agent_id: &Uuid, task_id: Uuid) -> Result<()> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or(FabricError::UnknownAgent(*agent_id))?;
        if agent.health != AgentHealth::Healthy || agent.spare() == 0 {
            return Err(FabricError::CapacityExceeded(*agent_id));
        }
        agent.live_tasks.insert(task_id);
        Ok(())
    }

    /// Give back the slot held by `task_id`. Returns false if it held none.
    pub fn unbind(&mut self, agent_id: &Uuid, task_id: &Uuid) -> bool {
        self.agents
            .get_mut(agent_id)
            .map(|a| a.live_tasks.remove(task_id))
            .unwrap_or(false)
    }

    pub fn live_tasks(&self, agent_id: &Uuid) -> Vec<Uuid> {
        self.agents
            .get(agent_id)
            .map(|a| a.live_tasks.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn record_success(&mut self, agent_id: &Uuid, now: Instant) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.last_success = Some(now);
        }
    }

    pub fn mark_suspect(&mut self, agent_id: &Uuid) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            if agent.health == AgentHealth::Healthy {
                agent.health = AgentHealth::Suspect;
                tracing::warn!(agent_id = %agent_id, "Agent marked suspect after failed delivery");
            }
        }
    }

    /// Operator override of an agent's slot count.
    pub fn set_capacity(&mut self, agent_id: &Uuid, capacity: u32) -> Result<()> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or(FabricError::UnknownAgent(*agent_id))?;
        if capacity < agent.load() {
            return Err(FabricError::InvalidState(format!(
                "agent {} runs {} tasks, capacity {} is too low",
                agent_id,
                agent.load(),
                capacity
            )));
        }
        agent.capacity = capacity;
        tracing::info!(agent_id = %agent_id, capacity, "Agent capacity changed");
        Ok(())
    }

    /// Drop an agent. Callers must reclaim its live tasks first.
    pub fn remove(&mut self, agent_id: &Uuid) -> Option<AgentState> {
        self.agents.remove(agent_id)
    }

    pub fn get(&self, agent_id: &Uuid) -> Option<&AgentState> {
        self.agents.get(agent_id)
    }

    /// All agents, oldest registration first
    pub fn all_agents(&self) -> Vec<&AgentState> {
        let mut agents: Vec<&AgentState> = self.agents.values().collect();
        agents.sort_by_key(|a| (a.registered_at, a.id));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
