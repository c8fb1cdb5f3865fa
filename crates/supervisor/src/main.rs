//! pubwatch-supervisor CLI - keep the pipeline running, clear a FAILED state,
//! or show the supervisor document.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use notify::{DispatchWorker, Dispatcher};
use pubwatch::config::{DEFAULT_CONFIG_PATH, ENV_CONFIG};
use pubwatch::logging::{self, LogFormat};
use pubwatch::{Config, ConfigError, StateStore};
use supervisor::process::pid_alive;
use supervisor::{
    ChildProcess, Exit, GitRemote, Phase, SourceControl, Supervisor, SupervisorState, Timings,
};

/// Keeps the pubwatch pipeline alive and up to date.
#[derive(Parser)]
#[command(name = "pubwatch-supervisor")]
#[command(about = "Run the pubwatch pipeline as a supervised child process")]
#[command(version)]
struct Cli {
    /// Config file
    #[arg(short, long, global = true, env = ENV_CONFIG)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise the pipeline until SIGINT/SIGTERM
    Run,

    /// Clear a FAILED state so the next run starts the pipeline again
    Reset,

    /// Print the persisted supervisor state
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format);

    let config_path = cli.config.clone();
    let result = match load_config(config_path.as_deref()) {
        Ok(config) => match cli.command {
            Commands::Run => run(config, config_path.as_deref()).await,
            Commands::Reset => reset(&config).await.map(|()| Exit::Stopped),
            Commands::Status { json } => status(&config, json).await.map(|()| Exit::Stopped),
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(Exit::Stopped) => ExitCode::SUCCESS,
        Ok(Exit::Failed) => ExitCode::FAILURE,
        Err(e) if e.downcast_ref::<ConfigError>().is_some() => {
            error!(error = format!("{e:#}"), "Configuration error");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = format!("{e:#}"), "pubwatch-supervisor failed");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Arc<Config>> {
    let explicit = path.is_some();
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
    Ok(Arc::new(Config::load_or_default(path, explicit)?))
}

/// `pubwatch [--config <path>] run`, from next to this binary.
fn default_command(config_path: Option<&Path>) -> Result<Vec<String>> {
    let exe = std::env::current_exe().context("Failed to locate the supervisor binary")?;
    let pubwatch = exe.with_file_name(format!("pubwatch{}", std::env::consts::EXE_SUFFIX));

    let mut command = vec![pubwatch.display().to_string()];
    if let Some(path) = config_path {
        command.push("--config".to_string());
        command.push(path.display().to_string());
    }
    command.push("run".to_string());
    Ok(command)
}

async fn run(config: Arc<Config>, config_path: Option<&Path>) -> Result<Exit> {
    let settings = &config.supervisor;
    let command = if settings.command.is_empty() {
        default_command(config_path)?
    } else {
        settings.command.clone()
    };
    let process = ChildProcess::new(&command, settings.working_dir.clone())?;
    info!(command = %process.command_line(), "Supervising pipeline");

    let store = StateStore::<SupervisorState>::open(&settings.state_path)
        .await
        .context("Failed to open supervisor state")?;

    let channel = notify::channel_for(
        config.webhook.url.clone(),
        &config.webhook.bot_name,
        Duration::from_secs(config.webhook.timeout_secs),
        config.webhook.disabled,
    )
    .context("Failed to set up notifications")?;
    let stop_dispatch = CancellationToken::new();
    let DispatchWorker {
        handle,
        mut exhausted,
        join,
    } = Dispatcher::new(channel, config.webhook.retry_policy()).spawn(
        stop_dispatch.clone(),
        Duration::from_secs(config.webhook.drain_timeout_secs),
    );
    tokio::spawn(async move {
        while let Some(alert) = exhausted.recv().await {
            warn!(title = %alert.title, attempts = alert.attempts, "Supervisor alert could not be delivered");
        }
    });

    let mut supervisor = Supervisor::new(
        Timings::from_config(&config),
        process,
        Arc::new(store),
        Arc::new(handle),
    )
    .with_heartbeat(config.state.heartbeat_path.clone());
    if let Some(quiet_hours) = config.escalation.quiet_hours.clone() {
        supervisor = supervisor.with_quiet_hours(quiet_hours, config.calendar.offset());
    }
    if settings.auto_update {
        let repo = match &settings.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("Failed to read working directory")?,
        };
        let remote: Arc<dyn SourceControl> = Arc::new(GitRemote::new(
            repo,
            settings.remote.clone(),
            settings.branch.clone(),
            Duration::from_secs(settings.git_timeout_secs),
        ));
        supervisor = supervisor.with_source(remote);
    }

    let cancel = CancellationToken::new();
    pubwatch::shutdown::cancel_on_signal(cancel.clone());
    let exit = supervisor.run(cancel).await.context("Supervisor failed");

    stop_dispatch.cancel();
    match join.await {
        Ok(pending) if !pending.is_empty() => {
            error!(count = pending.len(), "Supervisor alerts were not delivered");
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "Dispatcher task failed"),
    }
    exit
}

async fn reset(config: &Config) -> Result<()> {
    let store = StateStore::<SupervisorState>::open(&config.supervisor.state_path)
        .await
        .context("Failed to open supervisor state")?;
    let previous = store
        .update(|doc| {
            let previous = doc.phase;
            doc.reset();
            previous
        })
        .await
        .context("Failed to write supervisor state")?;
    println!("Supervisor reset ({previous} -> {})", Phase::Stopped);
    Ok(())
}

async fn status(config: &Config, json: bool) -> Result<()> {
    let path = &config.supervisor.state_path;
    let doc: SupervisorState = match tokio::fs::read_to_string(path).await {
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("State file {} is not valid", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => SupervisorState::default(),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    let phase = match doc.phase {
        Phase::Running => doc.phase.as_str().green(),
        Phase::Failed => doc.phase.as_str().red().bold(),
        Phase::Stopped => doc.phase.as_str().normal(),
        _ => doc.phase.as_str().yellow(),
    };
    println!("{:<22} {}", "Phase:".bold(), phase);
    if let Some(pid) = doc.pid {
        let liveness = if pid_alive(pid) { "alive".green() } else { "gone".red() };
        println!("{:<22} {pid} ({liveness})", "Pipeline pid:".bold());
    }
    println!("{:<22} {}", "Consecutive crashes:".bold(), doc.consecutive_crash_count);
    let rows = [
        ("Last restart:", doc.last_restart_at.map(|t| t.to_rfc3339())),
        ("Last remote check:", doc.last_remote_check_at.map(|t| t.to_rfc3339())),
        ("Applied revision:", doc.last_applied_revision),
        ("Rollback point:", doc.rollback_point),
        ("Rejected revision:", doc.rejected_revision),
        ("Failure:", doc.failed_reason),
    ];
    for (label, value) in rows {
        if let Some(value) = value {
            println!("{:<22} {value}", label.bold());
        }
    }
    Ok(())
}
