//! FIFO turn scheduler.
//!
//! Callers enqueue [`TurnJob`]s on an unbounded channel; one worker task
//! runs them strictly one after another. A job finishes when its turn
//! completes, fails, or times out, and its outcome never affects the jobs
//! queued behind it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::router::{ActiveTurn, TurnOutcome};
use super::threads::build_turn_input;
use super::Shared;
use crate::deadline::Deadline;
use crate::protocol::{methods, turn_id_from, turn_start_params};
use crate::{AppError, Result};

/// One queued turn.
#[derive(Debug)]
pub struct TurnJob {
    pub(super) prompt: String,
    pub(super) cwd: PathBuf,
    pub(super) reply: oneshot::Sender<Result<TurnOutcome>>,
}

/// Handle to a submitted turn.
#[derive(Debug)]
pub struct TurnTicket {
    rx: oneshot::Receiver<Result<TurnOutcome>>,
}

impl TurnTicket {
    pub(super) fn channel() -> (oneshot::Sender<Result<TurnOutcome>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Wait for the turn's outcome.
    ///
    /// # Errors
    ///
    /// The turn's own failure, or [`AppError::ProcessExited`] when the bridge
    /// shut down before the turn ran.
    pub async fn wait(self) -> Result<TurnOutcome> {
        self.rx
            .await
            .map_err(|_| AppError::ProcessExited("bridge shut down before the turn ran".into()))?
    }
}

/// Spawn the worker that drains `queue` in order.
pub(super) fn spawn_worker(
    shared: Arc<Shared>,
    mut queue: mpsc::UnboundedReceiver<TurnJob>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let job = tokio::select! {
                biased;
                () = shared.shutdown.cancelled() => break,
                job = queue.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            let TurnJob { prompt, cwd, reply } = job;
            if reply.is_closed() {
                debug!(cwd = %cwd.display(), "turn abandoned by caller, skipping");
                continue;
            }
            let outcome = shared.execute_turn(&prompt, &cwd).await;
            if let Err(err) = &outcome {
                warn!(cwd = %cwd.display(), error = %err, "turn failed");
            }
            let _ = reply.send(outcome);
        }
        debug!("turn worker stopped");
    })
}

impl Shared {
    async fn execute_turn(self: &Arc<Self>, prompt: &str, cwd: &Path) -> Result<TurnOutcome> {
        let conn = self.ensure_started().await?;
        let thread_id = self.thread_for(&conn, cwd).await?;

        let seeded = self.state.lock().await.threads.is_seeded(&thread_id);
        let seed = self.config.seed_source();
        let input =
            build_turn_input(&self.config.system_guidance, seed.as_ref(), prompt, seeded).await;

        let (reply, completion) = oneshot::channel();
        let seq = {
            let mut state = self.state.lock().await;
            if state.active_turn.is_some() {
                return Err(AppError::TurnAlreadyInProgress);
            }
            state.turn_seq += 1;
            let seq = state.turn_seq;
            state.active_turn = Some(ActiveTurn::new(seq, thread_id.clone(), reply));
            seq
        };

        let params = turn_start_params(&thread_id, &input);
        let started = self
            .request(&conn, methods::TURN_START, params, self.config.rpc_timeout())
            .await;

        {
            let mut state = self.state.lock().await;
            match started {
                Ok(result) => {
                    if !seeded && state.is_current(conn.generation) {
                        state.threads.mark_seeded(&thread_id);
                    }
                    if let Some(turn) = state.active_turn.as_mut().filter(|t| t.seq == seq) {
                        if turn.turn_id.is_none() {
                            turn.turn_id = turn_id_from(&result);
                        }
                        let shared = Arc::downgrade(self);
                        turn.deadline = Some(Deadline::arm(self.config.turn_timeout(), async move {
                            if let Some(shared) = shared.upgrade() {
                                shared.expire_turn(seq).await;
                            }
                        }));
                        info!(
                            thread_id,
                            turn_id = turn.turn_id.as_deref().unwrap_or("?"),
                            seeded = !seeded,
                            "turn started"
                        );
                    }
                }
                Err(err) => {
                    if state.active_turn.as_ref().is_some_and(|t| t.seq == seq) {
                        state.active_turn = None;
                    }
                    return Err(err);
                }
            }
        }

        completion
            .await
            .map_err(|_| AppError::ProcessExited("turn abandoned".into()))?
    }

    async fn expire_turn(&self, seq: u64) {
        let mut state = self.state.lock().await;
        if !state.active_turn.as_ref().is_some_and(|t| t.seq == seq) {
            return;
        }
        if let Some(turn) = state.active_turn.take() {
            let events = turn.events();
            warn!(
                thread_id = turn.thread_id,
                turn_id = turn.turn_id.as_deref().unwrap_or("?"),
                events = events.len(),
                "turn did not complete in time"
            );
            if let Some(turn_id) = turn.turn_id.clone() {
                state.abandoned.insert(turn_id);
            }
            turn.fail(AppError::TurnTimeout { events });
        }
    }
}
