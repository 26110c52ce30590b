//! Inbound stream tasks.
//!
//! [`run_reader`] frames the agent's stdout into lines of at most
//! [`MAX_LINE_BYTES`], parses each with [`parse_inbound_line`], and forwards
//! the result as a [`StreamEvent`]. [`run_stderr_reader`] forwards the
//! agent's stderr line by line for diagnostics.
//!
//! Malformed, oversized, and shape-mismatched lines are logged and dropped;
//! they never stop the reader.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::parse_inbound_line;
use crate::transport::{StreamEvent, MAX_LINE_BYTES};

/// One step of a line-framed stream.
enum Frame {
    Line(String),
    /// Oversized line, discarded up to its newline.
    Skipped,
    Failed(std::io::Error),
    Eof,
}

/// Line framer that survives oversized lines.
///
/// After a decode error `FramedRead` yields `None` once and then resumes
/// reading; that `None` is not end of stream.
struct Lines<R> {
    framed: FramedRead<R, LinesCodec>,
    recovering: bool,
}

impl<R: AsyncRead + Unpin> Lines<R> {
    fn new(inner: R) -> Self {
        Self {
            framed: FramedRead::new(inner, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            recovering: false,
        }
    }

    async fn next(&mut self) -> Frame {
        loop {
            match self.framed.next().await {
                Some(Ok(line)) => return Frame::Line(line),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    self.recovering = true;
                    return Frame::Skipped;
                }
                Some(Err(LinesCodecError::Io(err))) => return Frame::Failed(err),
                None if self.recovering => self.recovering = false,
                None => return Frame::Eof,
            }
        }
    }
}

/// Stdout reader task.
///
/// On EOF or an unrecoverable I/O error, sends [`StreamEvent::Closed`] before
/// returning. Exits silently when `cancel` fires or `event_tx` is closed.
pub async fn run_reader<R>(
    label: String,
    stdout: R,
    event_tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut lines = Lines::new(stdout);

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(label, "reader: cancellation received, stopping");
                break;
            }

            frame = lines.next() => match frame {
                Frame::Eof => {
                    debug!(label, "reader: EOF detected");
                    send_closed(&event_tx, &label, "stream closed").await;
                    break;
                }
                Frame::Skipped => {
                    warn!(label, limit = MAX_LINE_BYTES, "reader: line too long, skipping");
                }
                Frame::Failed(err) => {
                    warn!(label, error = %err, "reader: IO error, stopping");
                    send_closed(&event_tx, &label, &format!("stream error: {err}")).await;
                    break;
                }
                Frame::Line(line) => match parse_inbound_line(&line) {
                    Ok(Some(message)) => {
                        if event_tx.send(StreamEvent::Message(message)).await.is_err() {
                            debug!(label, "reader: event channel closed, stopping");
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(label, error = %e, raw_line = %line, "reader: dropping unparsable line");
                    }
                },
            },
        }
    }
}

/// Stderr reader task. Each line is forwarded as [`StreamEvent::Stderr`].
///
/// Stderr closing is not a lifecycle signal; the task simply ends.
pub async fn run_stderr_reader<R>(
    label: String,
    stderr: R,
    event_tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut lines = Lines::new(stderr);

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            frame = lines.next() => match frame {
                Frame::Eof => break,
                Frame::Skipped => {}
                Frame::Failed(err) => {
                    debug!(label, error = %err, "stderr reader: IO error, stopping");
                    break;
                }
                Frame::Line(line) => {
                    debug!(label, line = %line, "agent stderr");
                    if event_tx.send(StreamEvent::Stderr(line)).await.is_err() {
                        break;
                    }
                }
            },
        }
    }
}

async fn send_closed(event_tx: &mpsc::Sender<StreamEvent>, label: &str, reason: &str) {
    let event = StreamEvent::Closed {
        reason: reason.to_owned(),
    };
    if event_tx.send(event).await.is_err() {
        debug!(label, "reader: event channel closed before Closed could be delivered");
    }
}
