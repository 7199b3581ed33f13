use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use secrecy::SecretString;
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use buildfarm_lite::agent::{AgentRuntime, ProcessLock};
use buildfarm_lite::config::{AgentConfig, DispatchConfig, ExecutorConfig, ServerConfig};
use buildfarm_lite::scheduler::task::{ResourceProfile, TaskPayload};
use buildfarm_lite::server::FabricServer;
use buildfarm_lite::shutdown::install_shutdown_handler;
use buildfarm_lite::transport::protocol::{SubmitRequest, TaskView};
use buildfarm_lite::transport::ControlPlaneClient;
use buildfarm_lite::version::{self, BUILD_TIME, GIT_COMMIT, VERSION};
use buildfarm_lite::FabricError;

#[derive(Parser, Debug)]
#[command(name = "buildfarm-lite")]
#[command(about = "Distributed build agents and task dispatch server")]
#[command(disable_version_flag = true)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, env = "BUILDFARM_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(flatten)]
    agent: AgentArgs,

    /// Without a subcommand the agent runs
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print the version
    Version,

    /// Print version, git commit and build time
    #[command(name = "fullVersion", alias = "full-version")]
    FullVersion,

    /// Run the dispatch server
    Server(ServerArgs),

    /// Submit and inspect tasks
    Task {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

// =============================================================================
// Agent Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Work directory holding the identity file and lock; defaults to the binary's directory
    #[arg(long, env = "BUILDFARM_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Dispatch server base URL
    #[arg(long, env = "BUILDFARM_SERVER", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Shared trust token
    #[arg(long, env = "BUILDFARM_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Concurrent task slots
    #[arg(long, env = "BUILDFARM_CAPACITY", default_value = "1")]
    capacity: u32,

    /// Capability labels advertised to the server
    #[arg(long = "label", env = "BUILDFARM_LABELS", value_delimiter = ',')]
    labels: Vec<String>,

    /// Hostname reported at registration
    #[arg(long, env = "HOSTNAME")]
    hostname: Option<String>,

    /// Address reported to the server for operators
    #[arg(long, default_value = "")]
    advertise_addr: String,

    /// Seconds in-flight tasks get to finish on shutdown
    #[arg(long, default_value = "30")]
    shutdown_grace_secs: u64,
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address the control plane listens on
    #[arg(long, env = "BUILDFARM_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Shared trust token
    #[arg(long, env = "BUILDFARM_TOKEN", hide_env_values = true)]
    token: String,

    /// SQLite database for result records; in memory when absent
    #[arg(long, env = "BUILDFARM_DATABASE")]
    database: Option<PathBuf>,

    /// Retries before a task fails for good
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Heartbeat interval handed to agents, in milliseconds
    #[arg(long, default_value = "5000")]
    heartbeat_interval_ms: u64,

    /// Silence after which an agent is suspect, in seconds
    #[arg(long, default_value = "15")]
    suspect_window_secs: u64,

    /// Silence after which an agent is dead, in seconds
    #[arg(long, default_value = "60")]
    dead_window_secs: u64,

    /// Maximum tasks held in memory
    #[arg(long, default_value = "10000")]
    max_tasks: usize,

    /// Largest per-attempt deadline a submission may ask for, in seconds
    #[arg(long, default_value = "86400")]
    max_deadline_secs: u64,
}

// =============================================================================
// Task Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Dispatch server base URL
    #[arg(long, env = "BUILDFARM_SERVER", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Shared trust token
    #[arg(long, env = "BUILDFARM_TOKEN", hide_env_values = true)]
    token: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum TaskCommands {
    /// Submit a task
    Submit {
        /// Shell line, or the program when arguments follow `--`
        command: String,

        /// Program arguments; when given the command is executed directly
        #[arg(last = true)]
        args: Vec<String>,

        /// Higher runs first
        #[arg(long, default_value = "0")]
        priority: u8,

        /// Label the agent must advertise; repeatable
        #[arg(long = "label")]
        labels: Vec<String>,

        /// Per-attempt deadline in seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    /// Show the state of a task
    Status { task_id: Uuid },
    /// Cancel a task
    Cancel { task_id: Uuid },
}

#[derive(Serialize)]
struct SubmitOutput {
    task_id: Uuid,
}

// =============================================================================
// Helpers
// =============================================================================

fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
    }
}

fn is_sensitive(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    ["TOKEN", "SECRET", "PASSWORD", "KEY", "CREDENTIAL"]
        .iter()
        .any(|marker| upper.contains(marker))
}

fn log_env() {
    for (name, value) in std::env::vars() {
        if is_sensitive(&name) {
            tracing::debug!(name = %name, "    env (redacted)");
        } else {
            tracing::debug!(name = %name, value = %value, "    env");
        }
    }
}

fn default_work_dir() -> std::io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    Ok(exe
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".")))
}

fn print_task(view: &TaskView, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(view)?),
        OutputFormat::Table => {
            println!("Task ID:        {}", view.task_id);
            println!("State:          {}", view.state);
            println!("Priority:       {}", view.priority);
            println!("Attempt:        {}", view.attempt);
            println!("Retries:        {}", view.retry_count);
            if let Some(agent) = view.assigned_agent {
                println!("Agent:          {}", agent);
            }
            if let Some(outcome) = view.outcome {
                println!("Outcome:        {}", outcome);
            }
            if let Some(code) = view.exit_code {
                println!("Exit Code:      {}", code);
            }
            if let Some(reason) = &view.reason {
                println!("Reason:         {}", reason);
            }
            if let Some(summary) = &view.summary {
                println!("Output:");
                for line in summary.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Commands
// =============================================================================

async fn run_agent(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    let work_dir = match args.work_dir {
        Some(dir) => dir,
        None => default_work_dir()?,
    };
    std::fs::create_dir_all(&work_dir)?;
    if let Err(e) = std::env::set_current_dir(&work_dir) {
        return Err(format!("failed to change work dir to {}: {}", work_dir.display(), e).into());
    }

    let Some(_lock) = ProcessLock::acquire(&work_dir)? else {
        tracing::warn!(work_dir = %work_dir.display(), "Another agent holds the process lock, exiting");
        return Ok(());
    };

    tracing::info!(
        pid = std::process::id(),
        version = VERSION,
        git_commit = GIT_COMMIT,
        build_time = BUILD_TIME,
        user = %std::env::var("USER").unwrap_or_default(),
        work_dir = %work_dir.display(),
        "Agent starting"
    );
    log_env();

    let token = args
        .token
        .ok_or_else(|| FabricError::Auth("no trust token configured".to_string()))?;
    let mut config = AgentConfig::new(args.server, token, work_dir.clone()).with_capacity(args.capacity);
    for label in args.labels {
        config = config.with_label(label);
    }
    config.hostname = args.hostname.unwrap_or_else(|| "localhost".to_string());
    config.advertise_addr = args.advertise_addr;
    config.shutdown_grace = Duration::from_secs(args.shutdown_grace_secs);
    config.executor = ExecutorConfig {
        work_dir: Some(work_dir),
        ..ExecutorConfig::default()
    };

    let shutdown = install_shutdown_handler()?;
    let runtime = AgentRuntime::new(config)?;
    runtime.run(shutdown).await?;
    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let dispatch = DispatchConfig {
        max_retries: args.max_retries,
        suspect_window: Duration::from_secs(args.suspect_window_secs),
        dead_window: Duration::from_secs(args.dead_window_secs),
        max_tasks: args.max_tasks,
        max_task_timeout: Duration::from_secs(args.max_deadline_secs),
        ..DispatchConfig::default()
    };
    let mut config = ServerConfig::new(args.listen, args.token);
    config.heartbeat_interval = Duration::from_millis(args.heartbeat_interval_ms);
    config.dispatch = dispatch;
    if let Some(path) = args.database {
        config = config.with_database(path);
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        database = ?config.database_path,
        version = VERSION,
        "Starting dispatch server"
    );

    let shutdown = install_shutdown_handler()?;
    FabricServer::new(config)?.run(shutdown).await?;
    Ok(())
}

async fn run_task_command(client_args: ClientArgs, command: TaskCommands) -> Result<(), Box<dyn std::error::Error>> {
    let client = ControlPlaneClient::new(
        client_args.server,
        SecretString::from(client_args.token),
        Duration::from_secs(10),
    )?;

    match command {
        TaskCommands::Submit {
            command,
            args,
            priority,
            labels,
            deadline_secs,
        } => {
            let profile = labels
                .into_iter()
                .fold(ResourceProfile::default(), |p, l| p.with_label(l));
            let request = SubmitRequest {
                payload: TaskPayload {
                    command,
                    args,
                    ..Default::default()
                },
                priority,
                profile,
                deadline_secs,
            };
            let task_id = client.submit(&request).await?;
            match client_args.output {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&SubmitOutput { task_id })?)
                }
                OutputFormat::Table => println!("Task submitted: {}", task_id),
            }
        }
        TaskCommands::Status { task_id } => {
            let view = client.task(task_id).await?;
            print_task(&view, &client_args.output)?;
        }
        TaskCommands::Cancel { task_id } => {
            let view = client.cancel(task_id).await?;
            print_task(&view, &client_args.output)?;
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("{}", VERSION);
            return ExitCode::SUCCESS;
        }
        Some(Commands::FullVersion) => {
            println!("{}", version::full_version());
            return ExitCode::SUCCESS;
        }
        _ => {}
    }

    if let Err(e) = init_logging(cli.log_format) {
        eprintln!("failed to initialise logging: {}", e);
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        None => run_agent(cli.agent).await,
        Some(Commands::Server(args)) => run_server(args).await,
        Some(Commands::Task { client, command }) => run_task_command(client, command).await,
        Some(Commands::Version | Commands::FullVersion) => Ok(()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
