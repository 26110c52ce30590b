//! Bridge configuration parsing, environment overrides, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keychain service name the login credential is stored under.
pub const KEYRING_SERVICE: &str = "agent-bridge";

/// Keychain entry holding the API key.
pub const KEYRING_CREDENTIAL_KEY: &str = "api_key";

/// Environment fallback for the API key.
pub const CREDENTIAL_ENV_VAR: &str = "OPENAI_API_KEY";

/// Guidance prepended to the first turn of every new thread.
pub const DEFAULT_SYSTEM_GUIDANCE: &str = "You are a coding agent working inside a local \
developer workspace. Stay inside the current working directory, keep answers concise, and \
list every file you create or modify at the end of your reply.";

fn default_command() -> String {
    "codex".into()
}

fn default_args() -> Vec<String> {
    vec!["app-server".into()]
}

fn default_init_timeout_ms() -> u64 {
    15_000
}

fn default_rpc_timeout_ms() -> u64 {
    30_000
}

fn default_login_timeout_ms() -> u64 {
    60_000
}

fn default_turn_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_approval_policy() -> String {
    "never".into()
}

fn default_sandbox_mode() -> String {
    "workspace-write".into()
}

fn default_system_guidance() -> String {
    DEFAULT_SYSTEM_GUIDANCE.into()
}

/// Where the one-time reference document for new threads comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedSource {
    /// Literal document text.
    Text(String),
    /// File read each time a new thread is seeded.
    File(PathBuf),
}

/// Bridge configuration parsed from `bridge.toml` and the environment.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Agent executable, resolved against the augmented search path.
    #[serde(default = "default_command")]
    pub command: String,
    /// Arguments passed to the agent executable.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Bound on the `initialize` exchange.
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    /// Bound on ordinary control requests.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Bound on the account query and on the login-completed wait.
    #[serde(default = "default_login_timeout_ms")]
    pub login_timeout_ms: u64,
    /// Bound on a whole conversation turn.
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,
    /// Approval policy passed verbatim to `thread/start`.
    #[serde(default = "default_approval_policy")]
    pub approval_policy: String,
    /// Sandbox mode passed verbatim to `thread/start`.
    #[serde(default = "default_sandbox_mode")]
    pub sandbox_mode: String,
    /// Literal reference document for new threads.
    #[serde(default)]
    pub seed_text: Option<String>,
    /// Reference document file for new threads.
    #[serde(default)]
    pub seed_file: Option<PathBuf>,
    /// Guidance always placed ahead of the reference document.
    #[serde(default = "default_system_guidance")]
    pub system_guidance: String,
    /// Emit notification summaries at `info` level.
    #[serde(default)]
    pub debug: bool,
    /// API key used when the agent requires login (populated at runtime).
    #[serde(skip)]
    pub credential: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            init_timeout_ms: default_init_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            login_timeout_ms: default_login_timeout_ms(),
            turn_timeout_ms: default_turn_timeout_ms(),
            approval_policy: default_approval_policy(),
            sandbox_mode: default_sandbox_mode(),
            seed_text: None,
            seed_file: None,
            system_guidance: default_system_guidance(),
            debug: false,
            credential: None,
        }
    }
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with the process environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if an override is malformed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Overlay `AGENT_BRIDGE_*` variables from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if an override is malformed.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Overlay settings from an arbitrary key lookup, then re-validate.
    ///
    /// Empty values are treated as unset.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a timeout is not a positive integer or
    /// the resulting configuration fails validation.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(command) = get("AGENT_BRIDGE_COMMAND") {
            self.command = command;
        }
        if let Some(args) = get("AGENT_BRIDGE_ARGS") {
            self.args = args.split_whitespace().map(str::to_owned).collect();
        }
        for (key, slot) in [
            ("AGENT_BRIDGE_INIT_TIMEOUT_MS", &mut self.init_timeout_ms),
            ("AGENT_BRIDGE_RPC_TIMEOUT_MS", &mut self.rpc_timeout_ms),
            ("AGENT_BRIDGE_LOGIN_TIMEOUT_MS", &mut self.login_timeout_ms),
            ("AGENT_BRIDGE_TURN_TIMEOUT_MS", &mut self.turn_timeout_ms),
        ] {
            if let Some(raw) = get(key) {
                *slot = raw.trim().parse().map_err(|err| {
                    AppError::Config(format!("{key} must be a number of milliseconds: {err}"))
                })?;
            }
        }
        if let Some(policy) = get("AGENT_BRIDGE_APPROVAL_POLICY") {
            self.approval_policy = policy;
        }
        if let Some(mode) = get("AGENT_BRIDGE_SANDBOX_MODE") {
            self.sandbox_mode = mode;
        }
        if let Some(text) = get("AGENT_BRIDGE_SEED_TEXT") {
            self.seed_text = Some(text);
        }
        if let Some(path) = get("AGENT_BRIDGE_SEED_FILE") {
            self.seed_file = Some(PathBuf::from(path));
        }
        if let Some(guidance) = get("AGENT_BRIDGE_SYSTEM_GUIDANCE") {
            self.system_guidance = guidance;
        }
        if let Some(flag) = get("AGENT_BRIDGE_DEBUG") {
            self.debug = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        self.validate()
    }

    /// Load the login credential from OS keychain with env-var fallback.
    ///
    /// A missing credential is not an error here; it only becomes one when
    /// the agent reports that login is required.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the keychain task panics.
    pub async fn load_credential(&mut self) -> Result<()> {
        self.credential = load_credential(KEYRING_CREDENTIAL_KEY, CREDENTIAL_ENV_VAR).await?;
        Ok(())
    }

    /// Reference document source, literal text taking precedence.
    #[must_use]
    pub fn seed_source(&self) -> Option<SeedSource> {
        if let Some(text) = &self.seed_text {
            return Some(SeedSource::Text(text.clone()));
        }
        self.seed_file.clone().map(SeedSource::File)
    }

    /// Bound on the `initialize` exchange.
    #[must_use]
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    /// Bound on ordinary control requests.
    #[must_use]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Bound on the account query and the login-completed wait.
    #[must_use]
    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    /// Bound on a whole conversation turn.
    #[must_use]
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(AppError::Config("command must not be empty".into()));
        }

        for (name, value) in [
            ("init_timeout_ms", self.init_timeout_ms),
            ("rpc_timeout_ms", self.rpc_timeout_ms),
            ("login_timeout_ms", self.login_timeout_ms),
            ("turn_timeout_ms", self.turn_timeout_ms),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!("{name} must be greater than zero")));
            }
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<Option<String>> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(Some(value)),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(keyring::Error::NoEntry) => {}
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    Ok(env::var(env_key).ok().filter(|value| !value.is_empty()))
}
