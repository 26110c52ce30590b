//! Working-directory to thread mapping and one-time thread seeding.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use super::{Connection, Shared};
use crate::config::SeedSource;
use crate::protocol::{methods, thread_id_from, thread_start_params, InputItem};
use crate::{AppError, Result};

/// Thread bindings and seeded threads for the current agent process.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    bindings: HashMap<String, String>,
    seeded: HashSet<String>,
}

impl ThreadRegistry {
    /// Thread bound to `cwd`, if any.
    #[must_use]
    pub fn get(&self, cwd: &str) -> Option<&str> {
        self.bindings.get(cwd).map(String::as_str)
    }

    /// Bind `cwd` to `thread_id`.
    pub fn bind(&mut self, cwd: String, thread_id: String) {
        self.bindings.insert(cwd, thread_id);
    }

    /// Whether `thread_id` already received its seed block.
    #[must_use]
    pub fn is_seeded(&self, thread_id: &str) -> bool {
        self.seeded.contains(thread_id)
    }

    /// Record that `thread_id` received its seed block.
    pub fn mark_seeded(&mut self, thread_id: &str) {
        self.seeded.insert(thread_id.to_owned());
    }

    /// Forget every binding and seed marker.
    pub fn clear(&mut self) {
        self.bindings.clear();
        self.seeded.clear();
    }
}

impl Shared {
    /// Thread for `cwd`, created on first use.
    ///
    /// # Errors
    ///
    /// Request failures, or [`AppError::ThreadCreation`] when the response
    /// carries no thread id.
    pub(super) async fn thread_for(self: &Arc<Self>, conn: &Connection, cwd: &Path) -> Result<String> {
        let key = cwd.to_string_lossy().into_owned();
        if let Some(existing) = self.state.lock().await.threads.get(&key) {
            return Ok(existing.to_owned());
        }

        let params = thread_start_params(cwd, &self.config.approval_policy, &self.config.sandbox_mode);
        let result = self
            .request(conn, methods::THREAD_START, params, self.config.rpc_timeout())
            .await?;
        let thread_id = thread_id_from(&result).ok_or_else(|| {
            AppError::ThreadCreation(format!("thread/start returned no thread id: {result}"))
        })?;

        let mut state = self.state.lock().await;
        if state.is_current(conn.generation) {
            state.threads.bind(key.clone(), thread_id.clone());
        }
        info!(cwd = key, thread_id, "thread created");
        Ok(thread_id)
    }
}

/// Input items for one turn: the seed block first when the thread has not
/// been seeded yet, then the prompt.
pub async fn build_turn_input(
    guidance: &str,
    seed: Option<&SeedSource>,
    prompt: &str,
    seeded: bool,
) -> Vec<InputItem> {
    let mut input = Vec::with_capacity(2);
    if !seeded {
        let mut block = guidance.to_owned();
        if let Some(document) = read_seed(seed).await {
            if !document.trim().is_empty() {
                block.push_str("\n\n");
                block.push_str(&document);
            }
        }
        input.push(InputItem::text(block));
    }
    input.push(InputItem::text(prompt));
    input
}

async fn read_seed(seed: Option<&SeedSource>) -> Option<String> {
    match seed? {
        SeedSource::Text(text) => Some(text.clone()),
        SeedSource::File(path) => match tokio::fs::read_to_string(path).await {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "seed file unreadable, seeding without it");
                None
            }
        },
    }
}
