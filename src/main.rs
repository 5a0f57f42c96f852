//! lifewatch CLI
//!
//! Posts, listens for and inspects cross-process group notifications.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         lifewatch CLI                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Polling    │───▶│    Group     │───▶│  GroupStore  │       │
//! │  │   Wakeup     │    │  Notification│    │ (container/  │       │
//! │  │              │◀───│   Manager    │    │  lifewatch/) │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lifewatch::adapters::{
    DirectoryContainerProvider, EventLogWriter, FanoutEventPublisher, LoggingEventPublisher, PollingConfig,
    PollingWakeup,
};
use lifewatch::domain::Payload;
use lifewatch::relay::{GroupDelivery, GroupHandler};
use lifewatch::{GroupNotificationManager, RelayConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// lifewatch - cross-process group notifications
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding one container per group
    #[arg(long, env = "LIFEWATCH_CONTAINER_ROOT", default_value = "/tmp/lifewatch")]
    container_root: PathBuf,

    /// Identity of this application in subscriber records [default: executable name]
    #[arg(long, env = "LIFEWATCH_APP_ID")]
    app_id: Option<String>,

    /// Append lifecycle and relay events as JSON lines to this file
    #[arg(long, env = "LIFEWATCH_EVENT_LOG")]
    event_log: Option<PathBuf>,

    /// Wakeup poll interval in milliseconds
    #[arg(long, env = "LIFEWATCH_POLL_INTERVAL_MS", default_value = "250")]
    poll_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Post a notification to a group
    Post {
        group: String,
        name: String,
        /// JSON payload
        payload: Option<String>,
        /// Post even if no application subscribes to the name
        #[arg(long)]
        allow_no_subscribers: bool,
    },
    /// Print notifications of a group as they arrive
    Listen {
        group: String,
        name: String,
        /// Receive every entry posted since the last run
        #[arg(long)]
        reliable: bool,
    },
    /// Dump the durable state of a group
    Inspect { group: String },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let mut config = match &args.app_id {
        Some(id) => RelayConfig::for_app(id.clone()),
        None => RelayConfig::default(),
    };
    if let Command::Post {
        allow_no_subscribers: true,
        ..
    } = &args.command
    {
        config.permit_posts_without_subscribers = true;
    }

    info!("Starting lifewatch");
    info!("  Container root: {}", args.container_root.display());
    info!("  App identifier: {}", config.app_identifier);

    let containers = Arc::new(DirectoryContainerProvider::permissive(&args.container_root));
    let wakeup = PollingWakeup::spawn(
        containers.clone(),
        PollingConfig {
            interval: Duration::from_millis(args.poll_interval_ms),
        },
        &tokio::runtime::Handle::current(),
    );
    let manager = GroupNotificationManager::new(config, containers, wakeup.clone());
    let mut events = FanoutEventPublisher::new().with(Arc::new(LoggingEventPublisher::new()));
    if let Some(path) = &args.event_log {
        let log = EventLogWriter::open(path)
            .with_context(|| format!("cannot open event log {}", path.display()))?;
        events = events.with(Arc::new(log));
    }
    manager.set_publisher(Arc::new(events));

    let result = match args.command {
        Command::Post {
            group,
            name,
            payload,
            ..
        } => post(&manager, &group, &name, payload.as_deref()),
        Command::Listen {
            group,
            name,
            reliable,
        } => listen(&manager, &group, &name, reliable).await,
        Command::Inspect { group } => inspect(&manager, &group),
    };

    wakeup.shutdown();
    result
}

fn post(manager: &GroupNotificationManager, group: &str, name: &str, payload: Option<&str>) -> anyhow::Result<()> {
    let payload: Option<Payload> = payload
        .map(serde_json::from_str::<Payload>)
        .transpose()
        .context("payload is not valid JSON")?;

    manager
        .register_group(group)
        .with_context(|| format!("cannot open group {group}"))?;
    let seq = manager
        .post(group, name, payload)
        .with_context(|| format!("failed to post {name} to {group}"))?;
    info!(group, name, seq, "Posted");
    println!("{seq}");
    Ok(())
}

async fn listen(manager: &GroupNotificationManager, group: &str, name: &str, reliable: bool) -> anyhow::Result<()> {
    manager
        .register_group(group)
        .with_context(|| format!("cannot open group {group}"))?;

    let handler: GroupHandler = Arc::new(|delivery: &GroupDelivery| {
        for entry in &delivery.entries {
            let line = serde_json::json!({
                "group": delivery.group,
                "name": delivery.name,
                "seq": entry.seq,
                "posted_at": entry.posted_at,
                "payload": entry.payload,
            });
            println!("{line}");
        }
    });
    let subscription = if reliable {
        manager.subscribe_reliable(group, name, handler)
    } else {
        manager.subscribe(group, name, handler)
    }
    .with_context(|| format!("failed to subscribe to {name} in {group}"))?;

    info!(group, name, reliable, "Listening, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("failed to wait for Ctrl-C")?;

    // keep the reliable record so the next run catches up
    manager.unsubscribe(subscription, reliable);
    info!("Listener stopped");
    Ok(())
}

fn inspect(manager: &GroupNotificationManager, group: &str) -> anyhow::Result<()> {
    manager
        .register_group(group)
        .with_context(|| format!("cannot open group {group}"))?;
    let snapshot = manager.inspect(group)?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // logs go to stderr so stdout carries only command output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
