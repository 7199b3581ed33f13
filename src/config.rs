use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

/// Configuration for child-process task execution on an agent.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Shell used for bare command lines (`<shell> -c <command>`)
    pub shell: String,
    /// Directory tasks run in. Defaults to the agent work directory.
    pub work_dir: Option<PathBuf>,
    /// Bytes of stdout/stderr tail kept in the result summary
    pub max_output_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            work_dir: None,
            max_output_bytes: 4096,
        }
    }
}

/// Timing and policy knobs of the dispatch engine.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// No heartbeat for this long marks an agent `Suspect`
    pub suspect_window: Duration,
    /// No heartbeat for this long marks an agent `Dead` and reclaims its work
    pub dead_window: Duration,
    /// Dead agents are evicted from the registry after this long
    pub dead_retention: Duration,
    /// Requeues allowed per task before it is failed
    pub max_retries: u32,
    /// Consecutive priority picks that may bypass an older task
    pub fairness_burst: u32,
    /// Extra time past the attempt deadline before the attempt is expired
    pub report_grace: Duration,
    pub delivery_timeout: Duration,
    pub dispatch_interval: Duration,
    pub timeout_tick: Duration,
    pub sweep_interval: Duration,
    pub flush_interval: Duration,
    /// Terminal tasks stay queryable in memory for this long after archiving
    pub finished_retention: Duration,
    pub max_tasks: usize,
    /// Attempt budget used when a submission carries no deadline
    pub default_task_timeout: Duration,
    /// Largest per-attempt deadline a submission may ask for
    pub max_task_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            suspect_window: Duration::from_secs(15),
            dead_window: Duration::from_secs(60),
            dead_retention: Duration::from_secs(3600),
            max_retries: 3,
            fairness_burst: 8,
            report_grace: Duration::from_secs(10),
            delivery_timeout: Duration::from_secs(5),
            dispatch_interval: Duration::from_millis(100),
            timeout_tick: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(1),
            flush_interval: Duration::from_millis(250),
            finished_retention: Duration::from_secs(600),
            max_tasks: 10_000,
            default_task_timeout: Duration::from_secs(600),
            max_task_timeout: Duration::from_secs(24 * 3600),
        }
    }
}

/// Configuration of the dispatch server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub token: SecretString,
    /// SQLite database for result records. `None` keeps history in memory.
    pub database_path: Option<PathBuf>,
    /// Heartbeat interval handed to agents at registration
    pub heartbeat_interval: Duration,
    /// Poll interval handed to agents at registration
    pub poll_interval: Duration,
    pub dispatch: DispatchConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            token: SecretString::from(String::new()),
            database_path: None,
            heartbeat_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr, token: impl Into<String>) -> Self {
        Self {
            listen_addr,
            token: SecretString::from(token.into()),
            ..Default::default()
        }
    }

    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }
}

/// Configuration of an agent process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the dispatch server, e.g. `http://10.0.0.1:8080`
    pub server_url: String,
    pub token: SecretString,
    /// Holds the identity file and the process lock; tasks run here by default
    pub work_dir: PathBuf,
    /// Concurrent task slots
    pub capacity: u32,
    pub labels: BTreeSet<String>,
    pub hostname: String,
    /// Address reported to the server for operator display
    pub advertise_addr: String,
    pub request_timeout: Duration,
    /// Upper bound of the registration backoff
    pub max_backoff: Duration,
    /// Time in-flight tasks get to finish on shutdown
    pub shutdown_grace: Duration,
    pub executor: ExecutorConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            token: SecretString::from(String::new()),
            work_dir: PathBuf::from("."),
            capacity: 1,
            labels: BTreeSet::new(),
            hostname: "localhost".to_string(),
            advertise_addr: String::new(),
            request_timeout: Duration::from_secs(10),
            max_backoff: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            executor: ExecutorConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>, work_dir: PathBuf) -> Self {
        Self {
            server_url: server_url.into(),
            token: SecretString::from(token.into()),
            work_dir,
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    /// Path of the persisted agent identity
    pub fn identity_path(&self) -> PathBuf {
        self.work_dir.join("agent-identity.json")
    }
}
