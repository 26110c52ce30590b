//! Transport framer: newline-delimited JSON over the agent's stdio.
//!
//! - `reader`: stdout and stderr tasks emitting [`StreamEvent`]s.
//! - `writer`: stdin task serialising outbound messages.
//!
//! Inbound lines are capped at [`MAX_LINE_BYTES`] so an unterminated or
//! oversized message from a misbehaving agent cannot grow the read buffer
//! without bound.

pub mod reader;
pub mod writer;

use crate::protocol::Incoming;

/// Maximum inbound line length: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Everything the agent process can tell the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A parsed stdout message.
    Message(Incoming),
    /// One stderr line.
    Stderr(String),
    /// Stdout closed or failed.
    Closed {
        /// Human-readable reason.
        reason: String,
    },
    /// The process exited.
    Exited {
        /// Exit code, when the process was not killed by a signal.
        exit_code: Option<i32>,
        /// Human-readable reason.
        reason: String,
    },
}
