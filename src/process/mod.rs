//! Agent process launch seam.
//!
//! The bridge never touches `tokio::process` directly; it asks a
//! [`Launcher`] for an [`AgentProcess`], which is just the three stdio
//! streams plus a future that resolves when the process exits. The
//! production [`spawner::CommandLauncher`] spawns a real executable; tests
//! supply in-memory pipes.

pub mod spawner;

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::Result;

/// Boxed writable stream (agent stdin).
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed readable stream (agent stdout/stderr).
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Future resolving when the agent process exits.
pub type ExitFuture = Pin<Box<dyn Future<Output = ExitReport> + Send>>;

/// How the agent process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, when the process was not killed by a signal.
    pub exit_code: Option<i32>,
    /// Human-readable reason.
    pub reason: String,
}

/// A running agent process as seen by the bridge.
pub struct AgentProcess {
    /// Name used in log fields.
    pub label: String,
    /// Agent stdin.
    pub stdin: BoxedWrite,
    /// Agent stdout.
    pub stdout: BoxedRead,
    /// Agent stderr, when captured.
    pub stderr: Option<BoxedRead>,
    /// Resolves on exit; dropping it must stop the process.
    pub exit: ExitFuture,
}

impl std::fmt::Debug for AgentProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentProcess")
            .field("label", &self.label)
            .field("stderr", &self.stderr.is_some())
            .finish_non_exhaustive()
    }
}

/// Starts agent processes on demand.
pub trait Launcher: Send + Sync {
    /// Start one agent process.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`](crate::AppError::Spawn) if the process
    /// cannot be started.
    fn launch(&self) -> Pin<Box<dyn Future<Output = Result<AgentProcess>> + Send + '_>>;
}
