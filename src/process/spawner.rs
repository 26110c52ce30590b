//! Agent process spawner.
//!
//! Spawns the agent executable with:
//! - piped stdin/stdout/stderr for the NDJSON transport,
//! - `kill_on_drop(true)` so dropping the exit future terminates the process,
//! - a `PATH` extended with well-known binary directories, so the executable
//!   resolves even when the bridge runs from a minimal environment (GUI
//!   launchers, service managers).

use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::process::{AgentProcess, ExitReport, Launcher};
use crate::transport::StreamEvent;
use crate::{AppError, Result};

/// Directories appended to `PATH` when missing.
#[cfg(unix)]
pub const WELL_KNOWN_BIN_DIRS: &[&str] = &[
    "/usr/local/bin",
    "/opt/homebrew/bin",
    "/usr/bin",
    "/bin",
    "/usr/sbin",
    "/sbin",
];

/// Directories appended to `PATH` when missing.
#[cfg(not(unix))]
pub const WELL_KNOWN_BIN_DIRS: &[&str] = &[];

/// Configuration for spawning the agent process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Agent executable name or path.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
}

impl From<&BridgeConfig> for SpawnConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }
}

/// Build a search path: `current` entries first, then every
/// [`WELL_KNOWN_BIN_DIRS`] entry not already present.
///
/// # Errors
///
/// Returns `AppError::Spawn` if an entry cannot be joined into a path list
/// (for example one containing the separator character).
pub fn augmented_search_path(current: Option<&OsStr>) -> Result<OsString> {
    let mut dirs: Vec<PathBuf> = current
        .map(|raw| std::env::split_paths(raw).collect())
        .unwrap_or_default();

    for dir in WELL_KNOWN_BIN_DIRS {
        let dir = PathBuf::from(dir);
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }

    std::env::join_paths(dirs)
        .map_err(|err| AppError::Spawn(format!("cannot build search path: {err}")))
}

/// [`Launcher`] that spawns a real OS process.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    config: SpawnConfig,
}

impl CommandLauncher {
    /// Create a launcher for `config`.
    #[must_use]
    pub fn new(config: SpawnConfig) -> Self {
        Self { config }
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self) -> Pin<Box<dyn Future<Output = Result<AgentProcess>> + Send + '_>> {
        Box::pin(async move { spawn_agent(&self.config) })
    }
}

/// Spawn the agent process and capture its stdio.
///
/// # Errors
///
/// - `AppError::Spawn("failed to spawn …")`: executable missing or not
///   launchable.
/// - `AppError::Spawn("failed to capture …")`: a stdio pipe is missing.
pub fn spawn_agent(config: &SpawnConfig) -> Result<AgentProcess> {
    let path = augmented_search_path(std::env::var_os("PATH").as_deref())?;

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .env("PATH", path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Spawn(format!("failed to spawn {}: {err}", config.command))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stderr".into()))?;

    let pid = child.id();
    let label = format!("{}[{}]", config.command, pid.unwrap_or_default());
    info!(label, ?pid, "agent process spawned");

    let exit = Box::pin(async move {
        match child.wait().await {
            Ok(status) => {
                let exit_code = status.code();
                let reason = exit_code.map_or_else(
                    || "process terminated by signal".to_owned(),
                    |c| format!("process exited with code {c}"),
                );
                ExitReport { exit_code, reason }
            }
            Err(err) => ExitReport {
                exit_code: None,
                reason: format!("wait error: {err}"),
            },
        }
    });

    Ok(AgentProcess {
        label,
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        stderr: Some(Box::new(stderr)),
        exit,
    })
}

/// Spawn a task that awaits process exit and emits [`StreamEvent::Exited`].
///
/// When `cancel` fires first the exit future is dropped, which kills a real
/// child process, and no event is emitted.
#[must_use]
pub fn monitor_exit(
    label: String,
    exit: crate::process::ExitFuture,
    event_tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            report = exit => {
                info!(label, reason = %report.reason, "agent process exited");
                let event = StreamEvent::Exited {
                    exit_code: report.exit_code,
                    reason: report.reason,
                };
                if event_tx.send(event).await.is_err() {
                    debug!(label, "event channel closed before Exited could be delivered");
                }
            }
            () = cancel.cancelled() => {
                info!(label, "agent process stopped by bridge");
            }
        }
    })
}
