//! The agent bridge.
//!
//! One [`Bridge`] owns at most one agent process and every table that
//! describes the conversation with it: pending requests, the active turn,
//! the login waiter, thread bindings, and seeded threads. All of it lives in
//! a single [`State`] behind one mutex. The only writers are
//!
//! - the per-process dispatch task, which applies stdout/stderr/exit events
//!   in stream order,
//! - deadline expiries, and
//! - the start path and the turn worker, which only register or withdraw
//!   their own waiters.
//!
//! Lifecycle: `Stopped → Starting → Ready → Stopped` (on exit). A start
//! attempt runs in its own task and is shared by every caller that arrives
//! while it runs; callers only wait for its result. When the
//! process exits, [`State::reset`] rejects every waiter with
//! [`AppError::ProcessExited`] and forgets all threads, so the next call
//! spawns, initialises, and logs in again from scratch.

mod correlator;
mod login;
mod router;
mod scheduler;
mod threads;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::process::spawner::{self, CommandLauncher, SpawnConfig};
use crate::process::{AgentProcess, Launcher};
use crate::protocol::{
    initialize_params, methods, Incoming, Outgoing, RequestId, METHOD_NOT_FOUND,
};
use crate::transport::{reader, writer, StreamEvent};
use crate::{AppError, Result};

use correlator::PendingRequest;
use login::LoginWaiter;
use router::{AbandonedTurns, ActiveTurn, DiagnosticsBuffer};
use scheduler::TurnJob;
use threads::ThreadRegistry;

pub use router::TurnOutcome;
pub use scheduler::TurnTicket;
pub use threads::build_turn_input;

/// Capacity of the outbound message channel.
const OUTBOUND_CAPACITY: usize = 64;

/// Capacity of the inbound event channel.
const EVENT_CAPACITY: usize = 256;

/// Observable lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    /// No agent process.
    Stopped,
    /// Spawn, initialisation, or login in progress.
    Starting,
    /// Agent ready, no turn in flight.
    Ready,
    /// Agent ready, a turn in flight.
    Busy,
}

/// Start-attempt bookkeeping.
#[derive(Debug)]
enum Phase {
    Stopped,
    /// Callers waiting on the attempt currently running.
    Starting(Vec<oneshot::Sender<Result<Connection>>>),
    Ready,
}

/// Handle to the current agent process's outbound side.
#[derive(Debug, Clone)]
struct Connection {
    generation: u64,
    outbound: mpsc::Sender<serde_json::Value>,
    cancel: CancellationToken,
}

/// Everything the bridge knows about the current agent process.
#[derive(Debug)]
struct State {
    phase: Phase,
    connection: Option<Connection>,
    next_id: RequestId,
    pending: HashMap<RequestId, PendingRequest>,
    active_turn: Option<ActiveTurn>,
    abandoned: AbandonedTurns,
    login_waiter: Option<LoginWaiter>,
    threads: ThreadRegistry,
    diagnostics: DiagnosticsBuffer,
    turn_seq: u64,
}

impl State {
    fn new() -> Self {
        Self {
            phase: Phase::Stopped,
            connection: None,
            next_id: 0,
            pending: HashMap::new(),
            active_turn: None,
            abandoned: AbandonedTurns::default(),
            login_waiter: None,
            threads: ThreadRegistry::default(),
            diagnostics: DiagnosticsBuffer::default(),
            turn_seq: 0,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|conn| conn.generation == generation)
    }

    fn status(&self) -> BridgeStatus {
        match self.phase {
            Phase::Stopped => BridgeStatus::Stopped,
            Phase::Starting(_) => BridgeStatus::Starting,
            Phase::Ready if self.active_turn.is_some() => BridgeStatus::Busy,
            Phase::Ready => BridgeStatus::Ready,
        }
    }

    /// Drop the current process and reject everything that was waiting on it.
    fn reset(&mut self, reason: &str) {
        if let Some(conn) = self.connection.take() {
            conn.cancel.cancel();
        }
        if matches!(self.phase, Phase::Ready) {
            self.phase = Phase::Stopped;
        }

        let exited = || AppError::ProcessExited(reason.to_owned());
        let pending = self.pending.len();
        for (_, request) in self.pending.drain() {
            request.fail(exited());
        }
        let had_turn = self.active_turn.is_some();
        if let Some(turn) = self.active_turn.take() {
            turn.fail(exited());
        }
        if let Some(waiter) = self.login_waiter.take() {
            waiter.finish(Err(exited()));
        }
        self.threads.clear();
        self.abandoned.clear();

        info!(reason, pending, had_turn, "bridge state reset");
    }
}

/// Shared core referenced by the public handle, the worker, and the
/// dispatch and deadline tasks.
struct Shared {
    config: BridgeConfig,
    launcher: Arc<dyn Launcher>,
    state: Mutex<State>,
    generations: AtomicU64,
    shutdown: CancellationToken,
}

/// Client of one long-running agent process.
///
/// Must be created inside a tokio runtime: construction spawns the turn
/// worker. Dropping the bridge stops the agent process.
pub struct Bridge {
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<TurnJob>,
    worker: JoinHandle<()>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("command", &self.shared.config.command)
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Bridge that spawns `config.command` with `config.args`.
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        let launcher = CommandLauncher::new(SpawnConfig::from(&config));
        Self::with_launcher(config, Arc::new(launcher))
    }

    /// Bridge that obtains agent processes from `launcher`.
    #[must_use]
    pub fn with_launcher(config: BridgeConfig, launcher: Arc<dyn Launcher>) -> Self {
        let shared = Arc::new(Shared {
            config,
            launcher,
            state: Mutex::new(State::new()),
            generations: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });
        let (jobs, queue) = mpsc::unbounded_channel();
        let worker = scheduler::spawn_worker(Arc::clone(&shared), queue);
        Self {
            shared,
            jobs,
            worker,
        }
    }

    /// Make sure the agent is running, initialised, and logged in.
    ///
    /// Concurrent callers share one attempt and all observe its outcome.
    /// Dropping the returned future does not cancel the attempt.
    ///
    /// # Errors
    ///
    /// Any start failure: [`AppError::Spawn`],
    /// [`AppError::InitializationTimeout`], a login error, or
    /// [`AppError::ProcessExited`].
    pub async fn ensure_started(&self) -> Result<()> {
        self.shared.ensure_started().await.map(|_| ())
    }

    /// Queue a turn. Its position in the FIFO queue is fixed by this call.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ProcessExited`] if the bridge has shut down.
    pub fn submit(&self, prompt: impl Into<String>, cwd: impl Into<PathBuf>) -> Result<TurnTicket> {
        let (reply, ticket) = TurnTicket::channel();
        let job = TurnJob {
            prompt: prompt.into(),
            cwd: cwd.into(),
            reply,
        };
        self.jobs
            .send(job)
            .map_err(|_| AppError::ProcessExited("bridge has shut down".into()))?;
        Ok(ticket)
    }

    /// Run one turn for `cwd` and wait for its completion.
    ///
    /// # Errors
    ///
    /// Start failures, [`AppError::ThreadCreation`], request failures,
    /// [`AppError::TurnTimeout`], [`AppError::TurnFailed`], or
    /// [`AppError::ProcessExited`].
    pub async fn run_turn(
        &self,
        prompt: impl Into<String>,
        cwd: impl Into<PathBuf>,
    ) -> Result<TurnOutcome> {
        self.submit(prompt, cwd)?.wait().await
    }

    /// Current lifecycle phase.
    pub async fn status(&self) -> BridgeStatus {
        self.shared.state.lock().await.status()
    }

    /// Stop the worker and the agent process. Queued and in-flight turns fail
    /// with [`AppError::ProcessExited`].
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.state.lock().await.reset("bridge shut down");
        self.worker.abort();
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl Shared {
    async fn ensure_started(self: &Arc<Self>) -> Result<Connection> {
        let outcome = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if matches!(state.phase, Phase::Ready) {
                if let Some(conn) = state.connection.clone() {
                    return Ok(conn);
                }
                state.phase = Phase::Stopped;
            }
            let (tx, rx) = oneshot::channel();
            if let Phase::Starting(waiters) = &mut state.phase {
                debug!("joining start attempt already in progress");
                waiters.push(tx);
            } else {
                state.phase = Phase::Starting(vec![tx]);
                tokio::spawn(Arc::clone(self).run_start_attempt());
            }
            rx
        };

        outcome
            .await
            .map_err(|_| AppError::ProcessExited("start attempt abandoned".into()))?
    }

    /// Drive one start attempt and settle every caller waiting on it.
    async fn run_start_attempt(self: Arc<Self>) {
        let attempt = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(AppError::ProcessExited("bridge has shut down".into())),
            attempt = self.start() => attempt,
        };

        let mut state = self.state.lock().await;
        let waiters = match std::mem::replace(&mut state.phase, Phase::Stopped) {
            Phase::Starting(waiters) => waiters,
            _ => Vec::new(),
        };
        let outcome = match attempt {
            Ok(conn) if state.is_current(conn.generation) => {
                state.phase = Phase::Ready;
                Ok(conn)
            }
            Ok(_) => Err(AppError::ProcessExited(
                "agent exited during startup".into(),
            )),
            Err(err) => {
                state.reset("start attempt failed");
                Err(err)
            }
        };
        drop(state);

        if let Err(err) = &outcome {
            error!(error = %err, waiters = waiters.len(), "agent start failed");
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Spawn, initialise, and log in.
    async fn start(self: &Arc<Self>) -> Result<Connection> {
        if self.shutdown.is_cancelled() {
            return Err(AppError::ProcessExited("bridge has shut down".into()));
        }
        let process = self.launcher.launch().await?;
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = self.attach(process, generation).await;

        if let Err(err) = self
            .request(
                &conn,
                methods::INITIALIZE,
                initialize_params(),
                self.config.init_timeout(),
            )
            .await
        {
            return Err(match err {
                AppError::RpcTimeout { .. } => AppError::InitializationTimeout {
                    diagnostics: self.state.lock().await.diagnostics.snapshot(),
                },
                other => other,
            });
        }
        self.notify(&conn, methods::INITIALIZED, None).await?;

        self.login(&conn).await?;

        info!(generation, "agent ready");
        Ok(conn)
    }

    /// Wire a fresh process into the bridge and make it current.
    async fn attach(self: &Arc<Self>, process: AgentProcess, generation: u64) -> Connection {
        let AgentProcess {
            label,
            stdin,
            stdout,
            stderr,
            exit,
        } = process;
        let cancel = self.shutdown.child_token();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

        let conn = Connection {
            generation,
            outbound,
            cancel: cancel.clone(),
        };
        {
            // Current before any task runs, so no early event is taken as stale.
            let mut state = self.state.lock().await;
            state.diagnostics.clear();
            state.connection = Some(conn.clone());
        }

        let writer_label = label.clone();
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) =
                writer::run_writer(writer_label.clone(), stdin, outbound_rx, writer_cancel).await
            {
                warn!(label = writer_label, error = %err, "writer stopped");
            }
        });
        tokio::spawn(reader::run_reader(
            label.clone(),
            stdout,
            event_tx.clone(),
            cancel.clone(),
        ));
        if let Some(stderr) = stderr {
            tokio::spawn(reader::run_stderr_reader(
                label.clone(),
                stderr,
                event_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(spawner::monitor_exit(
            label.clone(),
            exit,
            event_tx,
            cancel.clone(),
        ));
        tokio::spawn(dispatch(
            Arc::downgrade(self),
            label,
            generation,
            event_rx,
            cancel,
        ));

        conn
    }
}

/// Apply one process's events to the bridge state, in stream order.
async fn dispatch(
    shared: Weak<Shared>,
    label: String,
    generation: u64,
    mut events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let mut state = shared.state.lock().await;
        if !state.is_current(generation) {
            debug!(label, generation, "dropping event from a previous agent process");
            continue;
        }

        let mut decline = None;
        match event {
            StreamEvent::Message(Incoming::Response { id, result }) => {
                state.resolve_request(id, Ok(result));
            }
            StreamEvent::Message(Incoming::Error { id, message }) => {
                state.reject_request(id, message);
            }
            StreamEvent::Message(Incoming::Notification(notification)) => {
                state.route_notification(notification, shared.config.debug);
            }
            StreamEvent::Message(Incoming::Request { id, method, turn_id }) => {
                state.decline_agent_request(&method, turn_id.as_deref());
                decline = Some(Outgoing::ErrorResponse {
                    id,
                    code: METHOD_NOT_FOUND,
                    message: format!("{method} is not supported by this client"),
                });
            }
            StreamEvent::Stderr(line) => state.record_stderr(line),
            StreamEvent::Closed { reason } | StreamEvent::Exited { reason, .. } => {
                warn!(label, generation, reason, "agent process gone");
                state.reset(&reason);
                break;
            }
        }

        if let Some(reply) = decline {
            let outbound = state.connection.as_ref().map(|conn| conn.outbound.clone());
            drop(state);
            if let Some(outbound) = outbound {
                if outbound.send(reply.to_value()).await.is_err() {
                    debug!(label, "agent stdin closed before a declined request was answered");
                }
            }
        }
    }
    debug!(label, generation, "dispatch loop finished");
}
