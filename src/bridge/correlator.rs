//! Request correlator.
//!
//! Every outgoing request gets the next integer id and an entry in the
//! pending table holding its reply channel and a [`Deadline`]. The dispatch
//! task resolves entries when a response with the same id arrives; the
//! deadline rejects them with [`AppError::RpcTimeout`] otherwise. Either path
//! removes the entry, which also disarms the other.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{Connection, Shared, State};
use crate::deadline::Deadline;
use crate::protocol::{Outgoing, RequestId};
use crate::{AppError, Result};

/// A request waiting for its response.
#[derive(Debug)]
pub struct PendingRequest {
    method: String,
    reply: oneshot::Sender<Result<Value>>,
    _deadline: Deadline,
}

impl PendingRequest {
    pub(super) fn fail(self, err: AppError) {
        let _ = self.reply.send(Err(err));
    }
}

impl State {
    /// Complete the pending request `id`.
    pub(super) fn resolve_request(&mut self, id: RequestId, outcome: Result<Value>) {
        match self.pending.remove(&id) {
            Some(request) => {
                debug!(id, method = request.method, "rpc: response received");
                let _ = request.reply.send(outcome);
            }
            None => debug!(id, "rpc: response for unknown or expired request"),
        }
    }

    /// Fail the pending request `id` with the agent's error message.
    pub(super) fn reject_request(&mut self, id: RequestId, message: String) {
        let Some(request) = self.pending.get(&id) else {
            debug!(id, "rpc: error for unknown or expired request");
            return;
        };
        let err = AppError::Rpc {
            method: request.method.clone(),
            message,
        };
        warn!(id, error = %err, "rpc: request failed");
        self.resolve_request(id, Err(err));
    }
}

impl Shared {
    /// Send `method` and wait up to `timeout` for its response.
    pub(super) async fn request(
        self: &Arc<Self>,
        conn: &Connection,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let (reply, response) = oneshot::channel();

        let id = {
            let mut state = self.state.lock().await;
            state.next_id += 1;
            let id = state.next_id;

            let shared = Arc::downgrade(self);
            let deadline = Deadline::arm(timeout, async move {
                if let Some(shared) = shared.upgrade() {
                    shared.expire_request(id).await;
                }
            });
            state.pending.insert(
                id,
                PendingRequest {
                    method: method.to_owned(),
                    reply,
                    _deadline: deadline,
                },
            );
            id
        };

        let message = Outgoing::Request {
            id,
            method: method.to_owned(),
            params,
        };
        debug!(id, method, "rpc: sending request");
        if conn.outbound.send(message.to_value()).await.is_err() {
            self.state.lock().await.pending.remove(&id);
            return Err(AppError::ProcessExited("agent stdin is closed".into()));
        }

        response
            .await
            .map_err(|_| AppError::ProcessExited(format!("{method} abandoned")))?
    }

    /// Send a notification; no response is expected.
    pub(super) async fn notify(
        &self,
        conn: &Connection,
        method: &str,
        params: Option<Value>,
    ) -> Result<()> {
        let message = Outgoing::Notification {
            method: method.to_owned(),
            params,
        };
        debug!(method, "rpc: sending notification");
        conn.outbound
            .send(message.to_value())
            .await
            .map_err(|_| AppError::ProcessExited("agent stdin is closed".into()))
    }

    async fn expire_request(&self, id: RequestId) {
        let Some(request) = self.state.lock().await.pending.remove(&id) else {
            return;
        };
        warn!(id, method = request.method, "rpc: request timed out");
        let method = request.method.clone();
        request.fail(AppError::RpcTimeout { method });
    }
}
