#![forbid(unsafe_code)]

//! `agent-bridge`: run prompts against a local coding agent.
//!
//! Loads configuration, starts the agent on demand, runs each prompt as one
//! turn in order, and prints the agent's reply to stdout. Logs go to stderr.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::io::AsyncReadExt;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_bridge::{AppError, Bridge, BridgeConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-bridge", about = "Run prompts against a local coding agent", version, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Working directory the turns run in (defaults to the current directory).
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Print each turn outcome as a JSON object.
    #[arg(long)]
    json: bool,

    /// Prompts to run in order; read from stdin when none are given.
    prompts: Vec<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load_from_path(path)?,
        None => BridgeConfig::default(),
    };
    config.apply_env_overrides()?;
    config.load_credential().await?;

    let cwd = match args.cwd {
        Some(dir) => dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid --cwd: {err}")))?,
        None => std::env::current_dir()?,
    };

    let prompts = if args.prompts.is_empty() {
        let mut text = String::new();
        tokio::io::stdin().read_to_string(&mut text).await?;
        vec![text]
    } else {
        args.prompts
    };
    let prompts: Vec<String> = prompts
        .into_iter()
        .filter(|prompt| !prompt.trim().is_empty())
        .collect();
    if prompts.is_empty() {
        return Err(AppError::Config("no prompt given".into()));
    }
    info!(command = config.command, turns = prompts.len(), cwd = %cwd.display(), "starting");

    // ── Run turns ───────────────────────────────────────
    let bridge = Bridge::new(config);
    let tickets = prompts
        .into_iter()
        .map(|prompt| bridge.submit(prompt, cwd.clone()))
        .collect::<Result<Vec<_>>>()?;

    let mut failure = None;
    for ticket in tickets {
        match ticket.wait().await {
            Ok(outcome) if args.json => {
                let line = serde_json::to_string(&outcome)
                    .map_err(|err| AppError::Protocol(format!("cannot encode outcome: {err}")))?;
                println!("{line}");
            }
            Ok(outcome) => println!("{}", outcome.output),
            Err(err) => {
                error!(error = %err, "turn failed");
                failure.get_or_insert(err);
            }
        }
    }

    bridge.shutdown().await;
    failure.map_or(Ok(()), Err)
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
