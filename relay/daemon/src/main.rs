//! Relay Daemon - Background Socket Owner and Requester CLI
//!
//! `serve` runs the background context: it owns the conversation sockets and
//! the stored credentials, and answers requester processes over a Unix socket.
//! `chat` is a requester: it streams one completion through a running daemon.
//!
//! # Usage
//!
//! ```bash
//! # Start the background relay
//! RELAY_SESSION_ID=... RELAY_TOKEN=... relay-daemon serve
//!
//! # Stream a completion
//! relay-daemon chat "Explain heartbeats" --model GPT4o
//!
//! # Continue a conversation, one JSON response per line
//! relay-daemon chat "And timeouts?" --conversation <id> --json
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon serve
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (sockets closed, PID file removed)

mod server;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{error, info};

use relay_core::{models, ChatClient, LogLoginFlow, RelayConfig, ResponseKind, UnixBridgeClient};

use server::RelayServer;

/// Relay Daemon - Streaming chat session multiplexer
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Bridge socket path
    #[arg(short = 's', long, env = "RELAY_SOCKET", value_name = "PATH", global = true)]
    socket_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the background relay
    Serve {
        /// PID file path
        #[arg(long, env = "RELAY_PID_FILE", value_name = "PATH")]
        pid_file: Option<PathBuf>,

        /// Chat service host
        #[arg(long, env = "RELAY_HOST")]
        host: Option<String>,

        /// Wait out the request timeout when a socket closes mid-stream
        #[arg(long)]
        wait_on_close: bool,
    },

    /// Stream one completion through a running relay
    Chat {
        /// Prompt text
        prompt: String,

        /// Model name from the catalogue
        #[arg(short = 'm', long, default_value = "aibox-v1")]
        model: String,

        /// Continue an existing conversation
        #[arg(long, value_name = "ID")]
        conversation: Option<String>,

        /// Print every response as a JSON line
        #[arg(long)]
        json: bool,
    },

    /// List the model catalogue
    Models,
}

/// Initialize logging with the specified level
///
/// Logs go to stderr so `chat` output on stdout stays clean.
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(())
}

/// Where the user signs in to the chat service
fn login_url(config: &RelayConfig) -> String {
    format!("https://{}/", config.host)
}

/// Resolve SIGTERM / SIGINT into a shutdown notification
fn spawn_signal_handler(shutdown: Arc<Notify>) {
    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown.notify_one();
    });
}

async fn serve(mut config: RelayConfig, pid_file: Option<PathBuf>) -> Result<()> {
    info!("Relay daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let pid_path = pid_file.unwrap_or_else(server::default_pid_path);
    config.validate().context("Invalid configuration")?;

    let shutdown = Arc::new(Notify::new());
    spawn_signal_handler(Arc::clone(&shutdown));

    let server = RelayServer::new(config, pid_path);
    match server.run(shutdown).await {
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

async fn chat(
    config: &RelayConfig,
    prompt: String,
    model: &str,
    conversation: Option<String>,
    json: bool,
) -> Result<()> {
    let profile = models::find(model).with_context(|| {
        let known: Vec<_> = models::catalogue().into_iter().map(|m| m.name).collect();
        format!("Unknown model {model:?} (known: {})", known.join(", "))
    })?;

    let socket_path = config.bridge_socket_path();
    let bridge = UnixBridgeClient::connect(&socket_path)
        .await
        .with_context(|| format!("Failed to reach relay at {socket_path:?}; is `relay-daemon serve` running?"))?;

    let client = ChatClient::init(
        Arc::new(bridge),
        profile,
        Arc::new(LogLoginFlow::new(login_url(config))),
    )
    .with_request_timeout(config.request_timeout());

    let mut completion = match conversation {
        Some(id) => client.completion_in(id.into(), prompt),
        None => client.completion(prompt),
    };
    info!(conversation_id = %completion.conversation_id(), "Conversation");

    let mut stdout = std::io::stdout();
    let mut printed = 0;
    while let Some(response) = completion.next().await {
        if json {
            writeln!(stdout, "{}", serde_json::to_string(&response)?)?;
        }
        match response.kind {
            ResponseKind::Generating { text } => {
                if !json {
                    write!(stdout, "{}", text.get(printed..).unwrap_or_default())?;
                    stdout.flush()?;
                }
                printed = text.len();
            }
            ResponseKind::Done { text } => {
                if !json {
                    writeln!(stdout, "{}", text.get(printed..).unwrap_or_default())?;
                }
                return Ok(());
            }
            ResponseKind::Error { error } => bail!("Completion failed: {error}"),
        }
    }

    bail!("Completion ended without a result")
}

fn list_models() -> Result<()> {
    let mut stdout = std::io::stdout();
    for model in models::catalogue() {
        let id = model
            .model_id
            .map_or_else(|| "default".to_string(), |id| id.to_string());
        writeln!(
            stdout,
            "{:<20} model_id={:<8} role_id={:<3} max_tokens={}",
            model.name, id, model.role_id, model.max_token_limit
        )?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level)?;

    let mut config = RelayConfig::load(args.config.as_deref()).context("Failed to load config")?;
    if let Some(socket_path) = args.socket_path {
        config.socket_path = Some(socket_path);
    }

    match args.command {
        Command::Serve {
            pid_file,
            host,
            wait_on_close,
        } => {
            if let Some(host) = host {
                config.host = host;
            }
            if wait_on_close {
                config.fail_pending_on_close = false;
            }
            serve(config, pid_file).await
        }
        Command::Chat {
            prompt,
            model,
            conversation,
            json,
        } => chat(&config, prompt, &model, conversation, json).await,
        Command::Models => list_models(),
    }
}
