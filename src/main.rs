//! # tradecast
//!
//! Command-line entry point: run the relay server, watch a stream, or
//! publish an analysis payload.

#![deny(unsafe_code)]

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::Level;

use tradecast_client::{SessionHandlers, SessionOptions, SseSession};
use tradecast_core::{AnalysisOutcome, Envelope};
use tradecast_server::{BroadcastChannel, FileMailbox, MemoryChannel, ServerConfig};
use tradecast_settings::{ChannelBackend, Settings};
use tradecast_telemetry::{init_telemetry, parse_level, TelemetryConfig, TelemetryGuard};

/// Event-stream relay for trade analysis results.
#[derive(Parser, Debug)]
#[command(name = "tradecast", about = "Event-stream relay for trade analysis results")]
struct Cli {
    /// Settings file (defaults to ~/.tradecast/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log level override (error, warn, info, debug, trace).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server.
    Serve {
        /// Port to bind (0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Connect to a stream and print every event until interrupted.
    Watch {
        /// Stream URL (defaults to the client URL from settings).
        #[arg(long)]
        url: Option<String>,
        /// Print only validated analysis results.
        #[arg(long)]
        results_only: bool,
    },
    /// Publish a JSON payload through a running server's analyzer endpoint.
    Publish {
        /// Server base URL, e.g. http://127.0.0.1:3000.
        #[arg(long)]
        server: Option<String>,
        /// Payload file; reads stdin when omitted or `-`.
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => tradecast_settings::load_settings_from_path(path),
        None => tradecast_settings::load_settings(),
    }
    .context("failed to load settings")?;

    let _telemetry = init_logging(&settings, cli.log_level.as_deref())?;

    match cli.command {
        Command::Serve { port } => serve(settings, port).await,
        Command::Watch { url, results_only } => watch(settings, url, results_only).await,
        Command::Publish { server, file } => publish(settings, server, file).await,
    }
}

fn init_logging(settings: &Settings, override_level: Option<&str>) -> Result<TelemetryGuard> {
    let name = override_level.unwrap_or(&settings.logging.level);
    let Some(log_level) = parse_level(name) else {
        bail!("unknown log level: {name}");
    };
    init_telemetry(TelemetryConfig {
        log_level,
        module_levels: vec![("hyper".into(), Level::WARN), ("reqwest".into(), Level::WARN)],
        json: settings.logging.json,
    })
    .context("failed to initialize telemetry")
}

fn build_channel(settings: &Settings) -> Result<Arc<dyn BroadcastChannel>> {
    let poll_interval = Duration::from_millis(settings.channel.poll_interval_ms);
    Ok(match settings.channel.backend {
        ChannelBackend::Memory => Arc::new(MemoryChannel::default()),
        ChannelBackend::File => {
            let dir = PathBuf::from(&settings.channel.mailbox_dir);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create mailbox directory: {}", dir.display()))?;
            Arc::new(FileMailbox::new(dir, poll_interval))
        }
    })
}

async fn serve(settings: Settings, port: Option<u16>) -> Result<()> {
    let channel = build_channel(&settings)?;
    let keep_alive = match settings.server.keep_alive_ms {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    };
    let config = ServerConfig {
        host: settings.server.host.clone(),
        port: port.unwrap_or(settings.server.port),
        topic: settings.server.topic.clone(),
        keep_alive,
        send_queue: settings.server.send_queue,
        upload_url: settings.worker.upload_url(),
        upload_timeout: Duration::from_millis(settings.worker.timeout_ms),
    };

    let handle = tradecast_server::start(config, channel)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "tradecast ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn session_options(settings: &Settings) -> SessionOptions {
    SessionOptions {
        event_types: settings.client.event_types.clone(),
        auto_reconnect: settings.client.auto_reconnect,
        reconnect_interval: Duration::from_millis(settings.client.reconnect_interval_ms),
        max_reconnect_attempts: settings.client.max_reconnect_attempts,
        parse_json: settings.client.parse_json,
        max_messages: settings.client.max_messages,
        ..SessionOptions::default()
    }
}

fn print_envelope(envelope: &Envelope, results_only: bool) {
    match AnalysisOutcome::from_envelope(envelope) {
        AnalysisOutcome::Final(result) => match serde_json::to_string(&result) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to encode result"),
        },
        AnalysisOutcome::Raw(_) if results_only => {}
        AnalysisOutcome::Raw(_) => match serde_json::to_string(envelope) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to encode envelope"),
        },
    }
}

async fn watch(settings: Settings, url: Option<String>, results_only: bool) -> Result<()> {
    let url = url.unwrap_or_else(|| settings.client.url.clone());
    let handlers = SessionHandlers::new()
        .on_open(|| tracing::info!("stream open"))
        .on_message(move |envelope| print_envelope(envelope, results_only))
        .on_error(|e| tracing::warn!(error = %e, retryable = e.is_retryable(), "stream error"));

    let session = SseSession::new(url.clone(), session_options(&settings), handlers)
        .with_context(|| format!("invalid stream URL: {url}"))?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
        _ = session.wait_closed() => tracing::info!("stream ended"),
    }

    session.stop();
    if let Some(error) = session.error() {
        bail!("{error}");
    }
    Ok(())
}

fn read_payload(file: Option<PathBuf>) -> Result<Value> {
    let text = match file {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        _ => {
            let mut buf = String::new();
            let _ = std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };
    serde_json::from_str(&text).context("payload is not valid JSON")
}

async fn publish(settings: Settings, server: Option<String>, file: Option<PathBuf>) -> Result<()> {
    let payload = read_payload(file)?;
    let base = server.unwrap_or_else(|| format!("http://127.0.0.1:{}", settings.server.port));
    let url = format!("{}/api/analyzer", base.trim_end_matches('/'));

    let resp = reqwest::Client::new()
        .post(&url)
        .json(&payload)
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?;
    let status = resp.status();
    let body: Value = resp.json().await.context("analyzer reply is not JSON")?;
    if !status.is_success() {
        let message = body["message"].as_str().unwrap_or("unknown error");
        bail!("publish failed ({status}): {message}");
    }
    tracing::info!(url = %url, "payload published");
    Ok(())
}
