//! Account check and API-key login.
//!
//! Runs once per agent process, right after `initialized`. When the agent
//! reports that it needs credentials and no account is signed in, the bridge
//! sends `account/login/start` with the configured API key and then waits for
//! the matching `account/login/completed` notification.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{info, warn};

use super::{Connection, Shared};
use crate::deadline::Deadline;
use crate::protocol::{account_read_params, login_params, methods, AccountStatus};
use crate::{AppError, Result};

/// The single outstanding login attempt.
#[derive(Debug)]
pub struct LoginWaiter {
    reply: oneshot::Sender<Result<()>>,
    _deadline: Deadline,
}

impl LoginWaiter {
    pub(super) fn finish(self, outcome: Result<()>) {
        let _ = self.reply.send(outcome);
    }
}

impl Shared {
    /// Log the agent in if it asks for credentials.
    ///
    /// # Errors
    ///
    /// - [`AppError::MissingCredential`] when login is needed and no key is configured.
    /// - [`AppError::LoginTimeout`] when no completion arrives in time.
    /// - [`AppError::LoginRejected`] when the agent reports failure.
    pub(super) async fn login(self: &Arc<Self>, conn: &Connection) -> Result<()> {
        let result = self
            .request(
                conn,
                methods::ACCOUNT_READ,
                account_read_params(),
                self.config.login_timeout(),
            )
            .await?;
        let status: AccountStatus = if result.is_null() {
            AccountStatus::default()
        } else {
            serde_json::from_value(result)
                .map_err(|err| AppError::Protocol(format!("invalid account status: {err}")))?
        };

        if !status.needs_login() {
            info!(signed_in = status.account.is_some(), "agent login not required");
            return Ok(());
        }

        let Some(api_key) = self.config.credential.as_deref() else {
            return Err(AppError::MissingCredential);
        };

        let (reply, completed) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            if state.login_waiter.is_some() {
                return Err(AppError::LoginRejected(
                    "another login attempt is outstanding".into(),
                ));
            }
            let shared = Arc::downgrade(self);
            let deadline = Deadline::arm(self.config.login_timeout(), async move {
                if let Some(shared) = shared.upgrade() {
                    shared.expire_login().await;
                }
            });
            state.login_waiter = Some(LoginWaiter {
                reply,
                _deadline: deadline,
            });
        }

        info!("agent requires login, sending api key");
        if let Err(err) = self
            .request(
                conn,
                methods::LOGIN_START,
                login_params(api_key),
                self.config.rpc_timeout(),
            )
            .await
        {
            self.state.lock().await.login_waiter = None;
            return Err(err);
        }

        completed
            .await
            .map_err(|_| AppError::ProcessExited("login abandoned".into()))??;
        info!("agent login completed");
        Ok(())
    }

    async fn expire_login(&self) {
        if let Some(waiter) = self.state.lock().await.login_waiter.take() {
            warn!("login completion did not arrive in time");
            waiter.finish(Err(AppError::LoginTimeout));
        }
    }
}
