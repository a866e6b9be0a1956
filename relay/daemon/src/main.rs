//! Relay Daemon - Streaming Delivery Server
//!
//! Runs the streaming delivery engine behind a Unix socket. Clients speak
//! newline-delimited JSON (see [`protocol`]); streamed replies are pushed to
//! every connection following a conversation.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (Ollama at localhost:11434)
//! relay-daemon
//!
//! # Custom socket path and model
//! relay-daemon --socket-path /tmp/relay.sock --model qwen2.5
//!
//! # No model server: echo each message back
//! relay-daemon --generator echo
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Configuration
//!
//! CLI flags override `RELAY_*` environment variables, which override
//! `$XDG_CONFIG_HOME/relay/relay.toml`, which overrides built-in defaults.
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod protocol;
mod server;

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use relay_core::{
    default_config_path, load_config_from_path, ConfigOverrides, ConnectionRegistry, Generator,
    GeneratorKind, InMemoryStore, OllamaGenerator, RelayConfig, ScriptedGenerator,
    StaticToolRegistry, StreamRegistry, StreamingEngine,
};

use server::DaemonServer;

/// Relay Daemon - real-time LLM streaming delivery
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path for client connections
    #[arg(short = 's', long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Generator backend (ollama, echo)
    #[arg(short = 'g', long)]
    generator: Option<GeneratorKind>,

    /// Model name passed to the generator
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// Ollama base URL
    #[arg(long, value_name = "URL")]
    ollama_url: Option<String>,

    /// Tokens per flush
    #[arg(long)]
    batch_size: Option<u32>,

    /// Abort a reply once it exceeds this many tokens
    #[arg(long)]
    max_response_tokens: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            socket_path: self.socket_path.clone(),
            generator: self.generator,
            model: self.model.clone(),
            ollama_url: self.ollama_url.clone(),
            batch_size: self.batch_size,
            max_response_tokens: self.max_response_tokens,
        }
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

fn load_relay_config(args: &Args) -> Result<RelayConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn build_generator(config: &RelayConfig) -> Result<Arc<dyn Generator>> {
    Ok(match config.generator {
        GeneratorKind::Ollama => Arc::new(
            OllamaGenerator::new(config.ollama_url.clone())
                .context("Failed to set up the Ollama generator")?,
        ),
        GeneratorKind::Echo => Arc::new(ScriptedGenerator::echo()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Relay daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = load_relay_config(&args)?;
    info!(
        source = ?config.source(),
        socket_path = ?config.socket_path,
        generator = ?config.generator,
        model = %config.model,
        batch_size = config.batch_size,
        "Configuration loaded"
    );
    if let Some(ref path) = config.config_file_path {
        info!(config_path = ?path, "Config file");
    }

    let generator = build_generator(&config)?;
    let hub = ConnectionRegistry::new();
    let engine = StreamingEngine::new(
        config.engine_config(),
        Arc::new(StreamRegistry::new(config.grace_period)),
        Arc::new(hub.clone()),
        Arc::new(InMemoryStore::new()),
        generator,
        Arc::new(StaticToolRegistry::new()),
    );

    // Setup signal handlers
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let shutdown_clone = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let socket_path = config.socket_path.clone();
    let mut server = DaemonServer::new(socket_path.clone(), engine, hub);

    let result = server.run(shutdown).await;

    info!("Shutting down...");
    if socket_path.exists() {
        if let Err(e) = fs::remove_file(&socket_path) {
            warn!(error = %e, "Failed to remove socket file");
        }
    }

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
