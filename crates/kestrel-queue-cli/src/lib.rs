//! # Kestrel Queue CLI
//!
//! Command-line interface for pushing to and listening on Kestrel queues.
//!
//! This module provides CLI commands for:
//! - Pushing an example message onto a queue
//! - Listening on a queue until interrupted
//! - Running the publish/consume demo against a server or in memory
//! - Generating shell completions

use async_trait::async_trait;
use clap::{CommandFactory, Parser, Subcommand};
use kestrel_queue::{
    register_message, ConfigurationError, Message, MessageRegistry, ProviderType, QueueConfig,
    QueueError, QueueListener, QueueManager, QueueMessage, QueueName,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Queue used by the demo command
pub const DEMO_QUEUE: &str = "fooQueue";

// ============================================================================
// CLI Structure
// ============================================================================

/// Kestrel Queue CLI - reliable publish/consume over Kestrel queues
#[derive(Parser, Debug)]
#[command(name = "kestrel-queue")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Push to and listen on Kestrel queues")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "KESTREL_QUEUE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Space separated host:port list, overrides the configuration
    #[arg(short, long)]
    pub servers: Option<String>,

    /// Logging level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Push one example message
    Put {
        #[arg(short, long)]
        queue: String,

        #[arg(short, long)]
        value: i32,

        /// Seconds until the message expires
        #[arg(short, long)]
        ttl: Option<u32>,
    },

    /// Log every message arriving on a queue until Ctrl-C
    Listen {
        #[arg(short, long)]
        queue: String,

        /// Only remove a message once it has been logged
        #[arg(short, long)]
        reliable: bool,
    },

    /// Push five messages to a reliable listener and shut down
    Demo {
        /// Use the in-memory backend instead of a server
        #[arg(long)]
        in_memory: bool,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI error types
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Failed to initialize logging: {message}")]
    Logging { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Messages and listeners
// ============================================================================

/// Message pushed by `put` and `demo`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleMessage {
    pub value: i32,
}

impl QueueMessage for ExampleMessage {
    fn identifier() -> &'static str {
        "em"
    }
}

register_message!(ExampleMessage);

/// Logs every message it receives and counts them
#[derive(Debug, Default)]
pub struct LoggingListener {
    received: AtomicUsize,
}

impl LoggingListener {
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueListener for LoggingListener {
    async fn process(&self, queue: &QueueName, message: Box<dyn Message>) -> anyhow::Result<()> {
        match message.downcast_ref::<ExampleMessage>() {
            Some(example) => info!(queue = %queue, value = example.value, "Received message"),
            None => info!(queue = %queue, message = ?message, "Received message"),
        }
        self.received.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    // Completions go to stdout and must not be mixed with log output
    if let Commands::Completions { shell } = cli.command {
        return execute_completions_command(shell);
    }

    initialize_logging(&cli)?;
    let config = resolve_configuration(&cli)?;

    match cli.command {
        Commands::Put { queue, value, ttl } => execute_put_command(config, &queue, value, ttl).await,
        Commands::Listen { queue, reliable } => {
            execute_listen_command(config, &queue, reliable).await
        }
        Commands::Demo { in_memory } => execute_demo_command(config, in_memory).await.map(|_| ()),
        Commands::Completions { .. } => Ok(()),
    }
}

/// Install the global tracing subscriber. `RUST_LOG` wins over `--log-level`.
pub fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "kestrel_queue={level},kestrel_queue_cli={level}",
            level = cli.log_level
        )
        .into()
    });

    let (json, plain) = if cli.json_logs {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .try_init()
        .map_err(|e| CliError::Logging {
            message: e.to_string(),
        })
}

/// Load the configuration file and environment, then apply flag overrides
pub fn resolve_configuration(cli: &Cli) -> Result<QueueConfig, ConfigurationError> {
    let mut config = QueueConfig::load(cli.config.as_deref())?;

    if let Some(servers) = &cli.servers {
        config.servers = servers.clone();
    }
    if let Commands::Demo { in_memory: true } = cli.command {
        config.provider = ProviderType::InMemory;
    }

    config.validate()?;
    Ok(config)
}

fn build_manager(config: QueueConfig) -> Result<QueueManager, CliError> {
    let registry = Arc::new(MessageRegistry::with_discovered());
    Ok(QueueManager::from_config(config, registry)?)
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn execute_put_command(
    config: QueueConfig,
    queue: &str,
    value: i32,
    ttl: Option<u32>,
) -> Result<(), CliError> {
    let ttl = ttl.unwrap_or(config.default_ttl_secs);
    let manager = build_manager(config)?;

    manager
        .put_with_ttl(queue, &ExampleMessage { value }, ttl)
        .await?;
    info!(queue = %queue, value, ttl, "Message pushed");

    manager.shutdown().await;
    Ok(())
}

async fn execute_listen_command(
    config: QueueConfig,
    queue: &str,
    reliable: bool,
) -> Result<(), CliError> {
    let manager = build_manager(config)?;
    let listener = Arc::new(LoggingListener::default());

    manager.listen(queue, listener.clone(), reliable)?;
    info!(queue = %queue, reliable, "Listening, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    info!(received = listener.received(), "Stopping");
    manager.shutdown().await;
    Ok(())
}

/// Push values 1 to 5 one second apart to a reliable listener on
/// [`DEMO_QUEUE`], then shut down. Returns how many messages arrived.
pub async fn execute_demo_command(config: QueueConfig, in_memory: bool) -> Result<usize, CliError> {
    let mut config = config;
    if in_memory {
        config.provider = ProviderType::InMemory;
    }
    execute_demo(config, Duration::from_secs(1)).await
}

pub(crate) async fn execute_demo(config: QueueConfig, interval: Duration) -> Result<usize, CliError> {
    const DEMO_MESSAGES: i32 = 5;

    let manager = build_manager(config)?;
    let listener = Arc::new(LoggingListener::default());
    manager.listen(DEMO_QUEUE, listener.clone(), true)?;

    for value in 1..=DEMO_MESSAGES {
        tokio::time::sleep(interval).await;
        manager.put(DEMO_QUEUE, &ExampleMessage { value }).await?;
        info!(queue = DEMO_QUEUE, value, "Pushed demo message");
    }

    // Give the listener a few intervals to drain the queue
    let expected = DEMO_MESSAGES as usize;
    for _ in 0..10 {
        if listener.received() >= expected {
            break;
        }
        tokio::time::sleep(interval).await;
    }

    let received = listener.received();
    if received < expected {
        warn!(received, expected, "Demo finished before every message arrived");
    } else {
        info!(received, "Demo finished");
    }

    manager.shutdown().await;
    Ok(received)
}

fn execute_completions_command(shell: clap_complete::Shell) -> Result<(), CliError> {
    let mut command = Cli::command();
    let name = command.get_name().to_string();
    clap_complete::generate(shell, &mut command, name, &mut std::io::stdout());
    Ok(())
}
