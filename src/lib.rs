#![forbid(unsafe_code)]

//! `agent-bridge`: client for a long-running coding-agent subprocess.
//!
//! The agent speaks newline-delimited JSON-RPC over its stdio. A [`Bridge`]
//! spawns it on demand, initialises and logs it in, maps working
//! directories to conversation threads, and runs prompts as turns one at a
//! time in submission order.

pub mod bridge;
pub mod config;
pub mod deadline;
pub mod errors;
pub mod process;
pub mod protocol;
pub mod transport;

pub use bridge::{Bridge, BridgeStatus, TurnOutcome, TurnTicket};
pub use config::BridgeConfig;
pub use errors::{AppError, Result};
