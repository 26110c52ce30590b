//! Cancellable deadlines.
//!
//! Every waiter the bridge keeps (pending request, active turn, login) carries
//! a [`Deadline`]. Arming one spawns a timer task that runs an expiry future
//! unless the deadline is dropped first, so removing a waiter from its table
//! is enough to disarm its timer.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Handle to an armed timer.
#[derive(Debug)]
pub struct Deadline {
    token: CancellationToken,
}

impl Deadline {
    /// Arm a timer that runs `on_expire` after `after`, unless cancelled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<F>(after: Duration, on_expire: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = child.cancelled() => {}
                () = tokio::time::sleep(after) => on_expire.await,
            }
        });
        Self { token }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
