//! pubwatch CLI - run the monitor, check feeds once, or show persisted state.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pubwatch::config::{DEFAULT_CONFIG_PATH, ENV_CONFIG};
use pubwatch::logging::{self, LogFormat};
use pubwatch::{
    Classification, Config, ConfigError, HttpFeedSource, Monitor, MonitorState, Pipeline, Poller,
    PublicationState, StateStore,
};

/// Scheduled publication monitor.
#[derive(Parser)]
#[command(name = "pubwatch")]
#[command(about = "Watch scheduled publications and alert when they are late or missing")]
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
    /// Run the monitor until SIGINT/SIGTERM
    Run,

    /// Poll and classify every feed once, without persisting or alerting
    Check {
        /// Only this feed
        #[arg(long)]
        feed: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print the persisted monitor state
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

    let result = match load_config(cli.config.as_deref()) {
        Ok(config) => match cli.command {
            Commands::Run => run(config).await,
            Commands::Check { feed, json } => check(&config, feed.as_deref(), json).await,
            Commands::Status { json } => status(&config, json).await,
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.downcast_ref::<ConfigError>().is_some() => {
            error!(error = format!("{e:#}"), "Configuration error");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = format!("{e:#}"), "pubwatch failed");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Arc<Config>> {
    let explicit = path.is_some();
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
    let config = Config::load_or_default(path, explicit)?;
    info!(path = %path.display(), feeds = config.feeds.len(), "Configuration loaded");
    Ok(Arc::new(config))
}

fn feed_source(config: &Config) -> Result<Arc<HttpFeedSource>> {
    let source = HttpFeedSource::new(
        config.api.base_url.clone(),
        config.api.token.as_deref(),
        Duration::from_secs(config.api.timeout_secs),
    )
    .context("Failed to build feed API client")?;
    Ok(Arc::new(source))
}

async fn run(config: Arc<Config>) -> Result<()> {
    let store = StateStore::open(&config.state.path)
        .await
        .context("Failed to open state file")?;
    let channel = notify::channel_for(
        config.webhook.url.clone(),
        &config.webhook.bot_name,
        Duration::from_secs(config.webhook.timeout_secs),
        config.webhook.disabled,
    )
    .context("Failed to set up notifications")?;

    let cancel = CancellationToken::new();
    pubwatch::shutdown::cancel_on_signal(cancel.clone());

    Pipeline::new(Arc::clone(&config), Arc::new(store), feed_source(&config)?, channel)
        .run(cancel)
        .await
        .context("Pipeline failed")
}

async fn check(config: &Config, only: Option<&str>, json: bool) -> Result<()> {
    let feeds: Vec<_> = config
        .feeds
        .iter()
        .filter(|f| only.is_none_or(|id| f.id == id))
        .collect();
    if feeds.is_empty() {
        anyhow::bail!("no feed named '{}'", only.unwrap_or_default());
    }

    let store = StateStore::open(&config.state.path)
        .await
        .context("Failed to open state file")?;
    let monitor = Monitor::new(config, Arc::new(store));
    let poller = Poller::new(feed_source(config)?, Duration::from_secs(config.api.timeout_secs));

    let (monitor, poller) = (&monitor, &poller);
    let results = join_all(feeds.into_iter().map(|feed| async move {
        let snapshot = poller.poll(feed).await;
        monitor.check(feed, &snapshot, Utc::now()).await
    }))
    .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for state in &results {
            print_state(state);
        }
    }
    Ok(())
}

async fn status(config: &Config, json: bool) -> Result<()> {
    let path = &config.state.path;
    let doc: MonitorState = match tokio::fs::read_to_string(path).await {
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("State file {} is not valid", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No state at {}", path.display());
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    for record in doc.feeds.values() {
        print_state(&record.state);
    }
    println!();
    println!(
        "{} held for quiet hours, {} pending delivery, {} undeliverable",
        doc.quiet_queue.len(),
        doc.pending_alerts.len(),
        doc.undelivered.len()
    );
    if let Some(at) = doc.updated_at {
        println!("Last update: {}", at.to_rfc3339());
    }
    Ok(())
}

fn paint(classification: Classification) -> ColoredString {
    let label = classification.as_str();
    match classification {
        Classification::OnTime => label.green(),
        Classification::Pending => label.normal(),
        Classification::Delayed | Classification::Stale => label.yellow(),
        Classification::Missing => label.red().bold(),
        Classification::Unknown => label.magenta(),
    }
}

fn print_state(state: &PublicationState) {
    let mut line = format!("{:<24} {:<8}", state.feed_id.bold(), paint(state.classification));
    if let Some(time) = state.published_time {
        line.push_str(&format!("  published {}", time.format("%H:%M:%S")));
    }
    if let Some(delay) = state.delay_minutes {
        line.push_str(&format!("  {delay:+} min"));
    }
    if let Some(tier) = state.last_alerted_tier {
        line.push_str(&format!("  alerted {tier}"));
    }
    if let Some(delta) = &state.comparison {
        line.push_str(&format!("  ({})", delta.describe()).dimmed().to_string());
    }
    if let Some(error) = &state.last_error {
        line.push_str(&format!("  {}", error.red()));
    }
    println!("{line}");
}
