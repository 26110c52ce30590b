//! Notification router and the active turn.
//!
//! Routing order for every unsolicited message:
//!
//! 1. A login-completed event is consumed by the pending login waiter, if any.
//! 2. A message tagged with the id of a turn that timed out is dropped.
//! 3. With no active turn, the message is dropped.
//! 4. A message tagged with a turn id the active turn does not own is
//!    dropped. Until the active turn's id is known, the only tagged message
//!    it accepts is `turn/started` for its own thread.
//! 5. Otherwise it is summarized into the turn's event log, text is
//!    accumulated, and a completion event finalizes the turn.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::State;
use crate::deadline::Deadline;
use crate::protocol::ServerNotification;
use crate::{AppError, Result};

/// Upper bound on event summaries kept per turn.
pub const MAX_TURN_EVENTS: usize = 500;

/// Upper bound on buffered stderr, in bytes.
pub const MAX_DIAGNOSTIC_BYTES: usize = 64 * 1024;

/// Timed-out turn ids remembered per agent process.
const MAX_ABANDONED_TURNS: usize = 64;

/// Result of a completed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnOutcome {
    /// Thread the turn ran on.
    pub thread_id: String,
    /// Server-assigned turn identifier, when reported.
    pub turn_id: Option<String>,
    /// Agent message text, in arrival order.
    pub output: String,
    /// Stderr lines and agent error reports seen during the turn.
    pub diagnostics: String,
    /// One summary per routed notification.
    pub events: Vec<String>,
}

/// The single in-flight turn.
#[derive(Debug)]
pub struct ActiveTurn {
    pub(super) seq: u64,
    pub(super) thread_id: String,
    pub(super) turn_id: Option<String>,
    output: String,
    diagnostics: String,
    events: Vec<String>,
    streamed_items: HashSet<String>,
    last_item: Option<String>,
    reply: oneshot::Sender<Result<TurnOutcome>>,
    pub(super) deadline: Option<Deadline>,
}

impl ActiveTurn {
    pub(super) fn new(
        seq: u64,
        thread_id: String,
        reply: oneshot::Sender<Result<TurnOutcome>>,
    ) -> Self {
        Self {
            seq,
            thread_id,
            turn_id: None,
            output: String::new(),
            diagnostics: String::new(),
            events: Vec::new(),
            streamed_items: HashSet::new(),
            last_item: None,
            reply,
            deadline: None,
        }
    }

    pub(super) fn fail(self, err: AppError) {
        let _ = self.reply.send(Err(err));
    }

    pub(super) fn events(&self) -> Vec<String> {
        self.events.clone()
    }

    /// Whether a message tagged with `turn_id` belongs to this turn.
    fn owns(&self, turn_id: Option<&str>, announces_self: bool) -> bool {
        match (self.turn_id.as_deref(), turn_id) {
            (_, None) => true,
            (Some(expected), Some(actual)) => expected == actual,
            (None, Some(_)) => announces_self,
        }
    }

    fn push_event(&mut self, summary: String) {
        if self.events.len() < MAX_TURN_EVENTS {
            self.events.push(summary);
        }
    }

    fn push_diagnostic(&mut self, line: &str) {
        self.diagnostics.push_str(line);
        self.diagnostics.push('\n');
    }

    /// Append agent text, separating consecutive messages with a newline.
    fn append_text(&mut self, item_id: Option<&str>, text: &str) {
        if item_id != self.last_item.as_deref() {
            if !self.output.is_empty() && !self.output.ends_with('\n') {
                self.output.push('\n');
            }
            self.last_item = item_id.map(str::to_owned);
        }
        self.output.push_str(text);
    }

    fn complete(self, status: Option<&str>, error: Option<String>) {
        let Self {
            thread_id,
            turn_id,
            output,
            diagnostics,
            events,
            reply,
            ..
        } = self;

        let outcome = if status == Some("failed") {
            Err(AppError::TurnFailed {
                message: error.unwrap_or_else(|| "agent reported a failed turn".into()),
                events,
            })
        } else {
            Ok(TurnOutcome {
                thread_id,
                turn_id,
                output,
                diagnostics,
                events,
            })
        };
        let _ = reply.send(outcome);
    }
}

/// Ids of turns that timed out while the agent may still be running them.
#[derive(Debug, Default)]
pub struct AbandonedTurns(VecDeque<String>);

impl AbandonedTurns {
    pub(super) fn insert(&mut self, turn_id: String) {
        if self.0.len() == MAX_ABANDONED_TURNS {
            self.0.pop_front();
        }
        self.0.push_back(turn_id);
    }

    fn contains(&self, turn_id: &str) -> bool {
        self.0.iter().any(|id| id == turn_id)
    }

    pub(super) fn clear(&mut self) {
        self.0.clear();
    }
}

/// Most recent agent stderr, bounded by [`MAX_DIAGNOSTIC_BYTES`].
#[derive(Debug, Default)]
pub struct DiagnosticsBuffer {
    lines: VecDeque<String>,
    bytes: usize,
}

impl DiagnosticsBuffer {
    pub(super) fn push(&mut self, line: String) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > MAX_DIAGNOSTIC_BYTES {
            match self.lines.pop_front() {
                Some(old) => self.bytes -= old.len() + 1,
                None => break,
            }
        }
    }

    pub(super) fn snapshot(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    pub(super) fn clear(&mut self) {
        self.lines.clear();
        self.bytes = 0;
    }
}

impl State {
    /// Route one unsolicited message.
    pub(super) fn route_notification(&mut self, notification: ServerNotification, verbose: bool) {
        if let ServerNotification::LoginCompleted { success, error, .. } = &notification {
            if let Some(waiter) = self.login_waiter.take() {
                let outcome = if *success {
                    Ok(())
                } else {
                    Err(AppError::LoginRejected(
                        error.clone().unwrap_or_else(|| "login failed".into()),
                    ))
                };
                waiter.finish(outcome);
                return;
            }
        }

        if let Some(stale) = notification.turn_id().filter(|id| self.abandoned.contains(id)) {
            debug!(turn_id = stale, event = %notification.summary(), "notification for a timed-out turn, ignoring");
            return;
        }

        let Some(turn) = self.active_turn.as_mut() else {
            debug!(event = %notification.summary(), "no active turn, dropping notification");
            return;
        };

        let announces_self = matches!(
            &notification,
            ServerNotification::TurnStarted { thread_id: Some(thread), .. } if *thread == turn.thread_id
        );
        if !turn.owns(notification.turn_id(), announces_self) {
            debug!(
                expected = turn.turn_id.as_deref().unwrap_or("?"),
                actual = notification.turn_id().unwrap_or("?"),
                "notification for another turn, ignoring"
            );
            return;
        }

        let summary = notification.summary();
        if verbose {
            info!(thread_id = turn.thread_id, event = %summary, "turn event");
        } else {
            debug!(thread_id = turn.thread_id, event = %summary, "turn event");
        }
        turn.push_event(summary);

        let mut finished = None;
        match notification {
            ServerNotification::TurnStarted {
                turn_id: Some(id), ..
            } if turn.turn_id.is_none() => {
                turn.turn_id = Some(id);
            }
            ServerNotification::AgentMessageDelta { item_id, delta, .. } => {
                if let Some(id) = &item_id {
                    turn.streamed_items.insert(id.clone());
                }
                turn.append_text(item_id.as_deref(), &delta);
            }
            ServerNotification::ItemCompleted { item, .. } if item.is_agent_message() => {
                let streamed = item
                    .id
                    .as_ref()
                    .is_some_and(|id| turn.streamed_items.contains(id));
                if let (false, Some(text)) = (streamed, item.text.as_deref()) {
                    turn.append_text(item.id.as_deref(), text);
                }
            }
            ServerNotification::Error { message, .. } => turn.push_diagnostic(&message),
            ServerNotification::TurnCompleted { status, error, .. } => {
                finished = Some((status, error));
            }
            _ => {}
        }

        if let Some((status, error)) = finished {
            if let Some(turn) = self.active_turn.take() {
                info!(
                    thread_id = turn.thread_id,
                    turn_id = turn.turn_id.as_deref().unwrap_or("?"),
                    status = status.as_deref().unwrap_or("unknown"),
                    "turn completed"
                );
                turn.complete(status.as_deref(), error);
            }
        }
    }

    /// Note a request from the agent that the bridge answers with an error.
    pub(super) fn decline_agent_request(&mut self, method: &str, turn_id: Option<&str>) {
        warn!(method, turn_id = turn_id.unwrap_or("?"), "declining request from agent");
        if turn_id.is_some_and(|id| self.abandoned.contains(id)) {
            return;
        }
        if let Some(turn) = self.active_turn.as_mut().filter(|t| t.owns(turn_id, false)) {
            turn.push_event(format!("{method} (declined)"));
            turn.push_diagnostic(&format!("agent request {method} declined: not supported"));
        }
    }

    /// Keep one stderr line for diagnostics.
    pub(super) fn record_stderr(&mut self, line: String) {
        if let Some(turn) = self.active_turn.as_mut() {
            turn.push_diagnostic(&line);
        }
        self.diagnostics.push(line);
    }
}
