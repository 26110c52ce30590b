//! Outbound stream task.
//!
//! Receives JSON messages from an [`mpsc`] channel, serialises each to a
//! compact single-line string, and writes it to the agent's stdin followed by
//! `\n`.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Stdin writer task.
///
/// Exits cleanly when `cancel` fires or every sender of `msg_rx` is dropped.
///
/// # Errors
///
/// - [`AppError::Protocol`]`("failed to serialise outbound message: …")`.
/// - [`AppError::Io`]`("write failed: …")` when the agent's stdin is gone.
pub async fn run_writer<W>(
    label: String,
    stdin: W,
    mut msg_rx: mpsc::Receiver<serde_json::Value>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut stdin = stdin;

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(label, "writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                let Some(value) = msg else {
                    debug!(label, "writer: message channel closed, stopping");
                    break;
                };

                let mut bytes = serde_json::to_vec(&value).map_err(|e| {
                    AppError::Protocol(format!("failed to serialise outbound message: {e}"))
                })?;
                bytes.push(b'\n');

                let written = async {
                    stdin.write_all(&bytes).await?;
                    stdin.flush().await
                }
                .await;

                written.map_err(|e| {
                    warn!(label, error = %e, "writer: write to stdin failed");
                    AppError::Io(format!("write failed: {e}"))
                })?;
            }
        }
    }

    Ok(())
}
