//! Error types shared across the bridge.

use std::fmt::{Display, Formatter};

/// Shared bridge result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Bridge error enumeration covering every failure a caller can observe.
///
/// `Clone` so one failed start attempt can be delivered to every caller that
/// was coalesced onto it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Wire framing failure (oversized line, unusable payload).
    Protocol(String),
    /// The agent executable could not be launched.
    Spawn(String),
    /// The `initialize` exchange did not complete in time.
    InitializationTimeout {
        /// Agent stderr captured up to the moment the timeout fired.
        diagnostics: String,
    },
    /// Login is required but no credential is configured.
    MissingCredential,
    /// The login-completed notification did not arrive in time.
    LoginTimeout,
    /// The agent reported that login failed.
    LoginRejected(String),
    /// A request received no response within its bound.
    RpcTimeout {
        /// Method of the request that timed out.
        method: String,
    },
    /// The agent answered a request with an error payload.
    Rpc {
        /// Method of the failed request.
        method: String,
        /// Error message reported by the agent.
        message: String,
    },
    /// `thread/start` answered without a thread identifier.
    ThreadCreation(String),
    /// A turn was registered while another was still in flight.
    TurnAlreadyInProgress,
    /// No completion event arrived within the turn timeout.
    TurnTimeout {
        /// Event summaries collected before the timeout.
        events: Vec<String>,
    },
    /// The agent completed the turn with a failure status.
    TurnFailed {
        /// Failure message reported by the agent.
        message: String,
        /// Event summaries collected during the turn.
        events: Vec<String>,
    },
    /// The agent process terminated while work was outstanding.
    ProcessExited(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::InitializationTimeout { diagnostics } => {
                if diagnostics.is_empty() {
                    write!(f, "initialization timeout: no agent stderr captured")
                } else {
                    write!(f, "initialization timeout: agent stderr: {diagnostics}")
                }
            }
            Self::MissingCredential => {
                write!(f, "missing credential: login required but no api key configured")
            }
            Self::LoginTimeout => write!(f, "login timeout: no login completion received"),
            Self::LoginRejected(msg) => write!(f, "login rejected: {msg}"),
            Self::RpcTimeout { method } => write!(f, "rpc timeout: no response to {method}"),
            Self::Rpc { method, message } => write!(f, "rpc: {method} failed: {message}"),
            Self::ThreadCreation(msg) => write!(f, "thread creation: {msg}"),
            Self::TurnAlreadyInProgress => write!(f, "turn already in progress"),
            Self::TurnTimeout { events } => {
                write!(f, "turn timeout: {} event(s) received", events.len())
            }
            Self::TurnFailed { message, .. } => write!(f, "turn failed: {message}"),
            Self::ProcessExited(msg) => write!(f, "process exited: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
