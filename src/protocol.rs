//! Typed messages exchanged with the agent process.
//!
//! Inbound lines are parsed once, at the transport boundary, into the closed
//! [`Incoming`] type. Notification methods the bridge does not know about
//! become [`ServerNotification::Other`] and never contribute turn output.
//!
//! # Known inbound notifications
//!
//! | Method                     | Maps to                                  |
//! |----------------------------|------------------------------------------|
//! | `account/login/completed`  | [`ServerNotification::LoginCompleted`]   |
//! | `turn/started`             | [`ServerNotification::TurnStarted`]      |
//! | `item/agentMessage/delta`  | [`ServerNotification::AgentMessageDelta`]|
//! | `item/completed`           | [`ServerNotification::ItemCompleted`]    |
//! | `error`                    | [`ServerNotification::Error`]            |
//! | `turn/completed`           | [`ServerNotification::TurnCompleted`]    |
//! | *(any other)*              | [`ServerNotification::Other`]            |

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{AppError, Result};

/// Identifier of an outgoing request.
pub type RequestId = u64;

/// JSON-RPC "method not found" error code.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Method names used on the wire.
pub mod methods {
    /// Capability/identity announcement.
    pub const INITIALIZE: &str = "initialize";
    /// Notification sent once `initialize` has been answered.
    pub const INITIALIZED: &str = "initialized";
    /// Account status query.
    pub const ACCOUNT_READ: &str = "account/read";
    /// Start an API-key login.
    pub const LOGIN_START: &str = "account/login/start";
    /// Login outcome notification.
    pub const LOGIN_COMPLETED: &str = "account/login/completed";
    /// Create a conversation thread.
    pub const THREAD_START: &str = "thread/start";
    /// Start a conversation turn.
    pub const TURN_START: &str = "turn/start";
    /// Turn accepted by the agent.
    pub const TURN_STARTED: &str = "turn/started";
    /// Streamed agent message text.
    pub const AGENT_MESSAGE_DELTA: &str = "item/agentMessage/delta";
    /// A finished turn item.
    pub const ITEM_COMPLETED: &str = "item/completed";
    /// Agent-side error report.
    pub const ERROR: &str = "error";
    /// Turn finished.
    pub const TURN_COMPLETED: &str = "turn/completed";
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Message written to the agent's stdin.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Request expecting a response with the same `id`.
    Request {
        /// Correlation identifier.
        id: RequestId,
        /// Method name.
        method: String,
        /// Method parameters.
        params: Value,
    },
    /// Fire-and-forget notification.
    Notification {
        /// Method name.
        method: String,
        /// Optional parameters; omitted from the wire when `None`.
        params: Option<Value>,
    },
    /// Error answer to a request the agent sent.
    ErrorResponse {
        /// The agent's request id, echoed unchanged.
        id: Value,
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable reason.
        message: String,
    },
}

impl Outgoing {
    /// Wire representation of the message.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Request { id, method, params } => json!({
                "method": method,
                "id": id,
                "params": params,
            }),
            Self::Notification { method, params } => {
                let mut msg = Map::new();
                msg.insert("method".into(), Value::String(method.clone()));
                if let Some(params) = params {
                    msg.insert("params".into(), params.clone());
                }
                Value::Object(msg)
            }
            Self::ErrorResponse { id, code, message } => json!({
                "id": id,
                "error": { "code": code, "message": message },
            }),
        }
    }
}

/// One element of a turn's ordered input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputItem {
    /// Content kind; always `text` for prompts built by the bridge.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Text payload.
    pub text: String,
}

impl InputItem {
    /// A plain text input item.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text",
            text: text.into(),
        }
    }
}

/// Parameters for `initialize`.
#[must_use]
pub fn initialize_params() -> Value {
    json!({
        "clientInfo": {
            "name": "agent-bridge",
            "title": "Agent Bridge",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// Parameters for `account/read`.
#[must_use]
pub fn account_read_params() -> Value {
    json!({ "refreshToken": false })
}

/// Parameters for `account/login/start` with an API key.
#[must_use]
pub fn login_params(api_key: &str) -> Value {
    json!({ "type": "apiKey", "apiKey": api_key })
}

/// Parameters for `thread/start`.
#[must_use]
pub fn thread_start_params(cwd: &Path, approval_policy: &str, sandbox_mode: &str) -> Value {
    json!({
        "cwd": cwd.to_string_lossy(),
        "approvalPolicy": approval_policy,
        "sandbox": sandbox_mode,
    })
}

/// Parameters for `turn/start`.
#[must_use]
pub fn turn_start_params(thread_id: &str, input: &[InputItem]) -> Value {
    json!({ "threadId": thread_id, "input": input })
}

// ── Response payloads ─────────────────────────────────────────────────────────

/// Result of `account/read`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    /// Present when an account is already signed in.
    #[serde(default)]
    pub account: Option<Value>,
    /// Whether the agent needs credentials before it can work.
    #[serde(default)]
    pub requires_openai_auth: bool,
}

impl AccountStatus {
    /// Whether a login exchange is needed.
    #[must_use]
    pub fn needs_login(&self) -> bool {
        self.requires_openai_auth && self.account.is_none()
    }
}

/// Extract the thread identifier from a `thread/start` result.
///
/// Accepts `{thread:{id}}` and the flat `{threadId}` form.
#[must_use]
pub fn thread_id_from(result: &Value) -> Option<String> {
    result
        .pointer("/thread/id")
        .or_else(|| result.get("threadId"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

/// Extract the optional turn identifier from a `turn/start` result.
#[must_use]
pub fn turn_id_from(result: &Value) -> Option<String> {
    result
        .pointer("/turn/id")
        .or_else(|| result.get("turnId"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// Parsed message read from the agent's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Successful response to a request.
    Response {
        /// Correlation identifier.
        id: RequestId,
        /// Result payload (`null` when absent).
        result: Value,
    },
    /// Error response to a request.
    Error {
        /// Correlation identifier.
        id: RequestId,
        /// Error message reported by the agent.
        message: String,
    },
    /// Unsolicited message.
    Notification(ServerNotification),
    /// Request initiated by the agent, such as an approval prompt.
    Request {
        /// The agent's request id, in whatever form it was sent.
        id: Value,
        /// Method name.
        method: String,
        /// Turn the request belongs to, if any.
        turn_id: Option<String>,
    },
}

/// Item reported by `item/completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedItem {
    /// Item type, e.g. `agentMessage`, `commandExecution`.
    pub kind: String,
    /// Item identifier.
    pub id: Option<String>,
    /// Text payload, when the item carries one.
    pub text: Option<String>,
}

impl CompletedItem {
    /// Whether the item is a message written by the agent.
    #[must_use]
    pub fn is_agent_message(&self) -> bool {
        self.kind == "agentMessage"
    }
}

/// Closed set of notifications the bridge routes.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotification {
    /// Outcome of an `account/login/start` exchange.
    LoginCompleted {
        /// Login attempt identifier.
        login_id: Option<String>,
        /// Whether login succeeded.
        success: bool,
        /// Failure description.
        error: Option<String>,
    },
    /// Turn accepted.
    TurnStarted {
        /// Owning thread.
        thread_id: Option<String>,
        /// Server-assigned turn identifier.
        turn_id: Option<String>,
    },
    /// Incremental agent message text.
    AgentMessageDelta {
        /// Owning turn.
        turn_id: Option<String>,
        /// Item the delta belongs to.
        item_id: Option<String>,
        /// Text fragment.
        delta: String,
    },
    /// A turn item finished.
    ItemCompleted {
        /// Owning turn.
        turn_id: Option<String>,
        /// The finished item.
        item: CompletedItem,
    },
    /// Error reported by the agent.
    Error {
        /// Owning turn, when reported.
        turn_id: Option<String>,
        /// Error description.
        message: String,
    },
    /// Turn finished.
    TurnCompleted {
        /// Finished turn.
        turn_id: Option<String>,
        /// Final status (`completed`, `failed`, `interrupted`).
        status: Option<String>,
        /// Failure description when the turn failed.
        error: Option<String>,
    },
    /// Any notification without a dedicated variant.
    Other {
        /// Method name.
        method: String,
        /// Turn identifier found in the params, if any.
        turn_id: Option<String>,
    },
}

impl ServerNotification {
    /// Turn identifier carried by the notification, if any.
    #[must_use]
    pub fn turn_id(&self) -> Option<&str> {
        match self {
            Self::LoginCompleted { .. } => None,
            Self::TurnStarted { turn_id, .. }
            | Self::AgentMessageDelta { turn_id, .. }
            | Self::ItemCompleted { turn_id, .. }
            | Self::Error { turn_id, .. }
            | Self::TurnCompleted { turn_id, .. }
            | Self::Other { turn_id, .. } => turn_id.as_deref(),
        }
    }

    /// One-line description for the turn event log.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::LoginCompleted { success, .. } => {
                format!("{} success={success}", methods::LOGIN_COMPLETED)
            }
            Self::TurnStarted { turn_id, .. } => format!(
                "{} turn={}",
                methods::TURN_STARTED,
                turn_id.as_deref().unwrap_or("?")
            ),
            Self::AgentMessageDelta { delta, .. } => format!(
                "{} ({} chars)",
                methods::AGENT_MESSAGE_DELTA,
                delta.chars().count()
            ),
            Self::ItemCompleted { item, .. } => {
                format!("{} type={}", methods::ITEM_COMPLETED, item.kind)
            }
            Self::Error { message, .. } => format!("{}: {message}", methods::ERROR),
            Self::TurnCompleted { status, .. } => format!(
                "{} status={}",
                methods::TURN_COMPLETED,
                status.as_deref().unwrap_or("unknown")
            ),
            Self::Other { method, .. } => method.clone(),
        }
    }
}

/// Raw envelope shared by every inbound message shape.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginCompletedParams {
    #[serde(default)]
    login_id: Option<String>,
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TurnParams {
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    turn_id: Option<String>,
    #[serde(default)]
    turn: Option<TurnRef>,
}

#[derive(Debug, Deserialize)]
struct TurnRef {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeltaParams {
    #[serde(default)]
    turn_id: Option<String>,
    #[serde(default)]
    item_id: Option<String>,
    delta: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemParams {
    #[serde(default)]
    turn_id: Option<String>,
    item: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorParams {
    #[serde(default)]
    turn_id: Option<String>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

/// Parse a single NDJSON line from the agent into an [`Incoming`] message.
///
/// # Return value
///
/// - `Ok(Some(msg))`: a response, a notification, or an agent request.
/// - `Ok(None)`: the line is empty or whitespace.
///
/// # Errors
///
/// - [`AppError::Protocol`]`("malformed json: …")`: not valid JSON.
/// - [`AppError::Protocol`]`("missing required field: …")`: a known
///   notification whose params do not match its shape.
/// - [`AppError::Protocol`]: a message with neither `method` nor a usable
///   numeric `id`.
pub fn parse_inbound_line(line: &str) -> Result<Option<Incoming>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let envelope: Envelope = serde_json::from_str(line)
        .map_err(|e| AppError::Protocol(format!("malformed json: {e}")))?;

    if let Some(method) = envelope.method {
        let params = envelope.params.unwrap_or(Value::Null);
        if let Some(id) = envelope.id {
            debug!(method, "inbound request from agent");
            return Ok(Some(Incoming::Request {
                id,
                turn_id: params_turn_id(&params),
                method,
            }));
        }
        return parse_notification(method, params).map(|n| Some(Incoming::Notification(n)));
    }

    let Some(raw_id) = envelope.id else {
        return Err(AppError::Protocol(
            "message has neither method nor id".into(),
        ));
    };
    let id = request_id_from(&raw_id)
        .ok_or_else(|| AppError::Protocol(format!("unrecognised response id: {raw_id}")))?;

    if let Some(error) = envelope.error {
        return Ok(Some(Incoming::Error {
            id,
            message: error_message(&error),
        }));
    }

    Ok(Some(Incoming::Response {
        id,
        result: envelope.result.unwrap_or(Value::Null),
    }))
}

fn parse_notification(method: String, params: Value) -> Result<ServerNotification> {
    let missing =
        |e: serde_json::Error| AppError::Protocol(format!("missing required field: {method} params: {e}"));

    let notification = match method.as_str() {
        methods::LOGIN_COMPLETED => {
            let p: LoginCompletedParams = serde_json::from_value(params).map_err(missing)?;
            ServerNotification::LoginCompleted {
                login_id: p.login_id,
                success: p.success,
                error: p.error,
            }
        }
        methods::TURN_STARTED => {
            let p: TurnParams = serde_json::from_value(params).map_err(missing)?;
            let turn_id = p.turn.and_then(|t| t.id).or(p.turn_id);
            ServerNotification::TurnStarted {
                thread_id: p.thread_id,
                turn_id,
            }
        }
        methods::AGENT_MESSAGE_DELTA => {
            let p: DeltaParams = serde_json::from_value(params).map_err(missing)?;
            ServerNotification::AgentMessageDelta {
                turn_id: p.turn_id,
                item_id: p.item_id,
                delta: p.delta,
            }
        }
        methods::ITEM_COMPLETED => {
            let p: ItemParams = serde_json::from_value(params).map_err(missing)?;
            ServerNotification::ItemCompleted {
                turn_id: p.turn_id,
                item: completed_item(&p.item),
            }
        }
        methods::ERROR => {
            let p: ErrorParams = serde_json::from_value(params).map_err(missing)?;
            let message = p
                .error
                .as_ref()
                .map(error_message)
                .or(p.message)
                .unwrap_or_else(|| "unspecified agent error".into());
            ServerNotification::Error {
                turn_id: p.turn_id,
                message,
            }
        }
        methods::TURN_COMPLETED => {
            let p: TurnParams = serde_json::from_value(params).map_err(missing)?;
            let (id, status, error) = match p.turn {
                Some(turn) => (turn.id, turn.status, turn.error.as_ref().map(error_message)),
                None => (None, None, None),
            };
            ServerNotification::TurnCompleted {
                turn_id: id.or(p.turn_id),
                status,
                error,
            }
        }
        _ => ServerNotification::Other {
            turn_id: params_turn_id(&params),
            method,
        },
    };

    Ok(notification)
}

fn params_turn_id(params: &Value) -> Option<String> {
    params
        .get("turnId")
        .or_else(|| params.pointer("/turn/id"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn completed_item(item: &Value) -> CompletedItem {
    let field = |name: &str| item.get(name).and_then(Value::as_str).map(str::to_owned);
    CompletedItem {
        kind: field("type").unwrap_or_default(),
        id: field("id"),
        text: field("text"),
    }
}

/// Numeric ids are what the bridge sends; numeric strings are tolerated.
fn request_id_from(raw: &Value) -> Option<RequestId> {
    match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Best-effort message extraction from an error payload.
fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_owned),
        other => other.to_string(),
    }
}
