//! Command/response exchange over a single connection.
//!
//! # Architecture
//!
//! ```text
//! exchange ─► dial ─► spawn I/O task ──────────────────────────────┐
//!                     │ write header ─► write chunks ─► read to EOF │ ─► Bytes
//!                     └─────────────────────────────────────────────┘
//! supervisor: select! { I/O task done, Interrupt fired }
//!             on interrupt: abort task, wait for it, return Cancelled
//! ```
//!
//! The connection is owned by the I/O task and is closed when that task
//! ends, whichever way it ends. Interrupting a call never leaves the task
//! (or its socket) running in the background.

use std::future::Future;
use std::io::IoSlice;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{ClamdError, Result, TransportStage};
use crate::options::{Options, DEFAULT_IO_TIMEOUT, DEFAULT_MAX_RESPONSE_SIZE};
use crate::protocol::Command;
use crate::transport::Connector;

/// Read buffer growth step.
const READ_CHUNK: usize = 16 * 1024;

/// Most slices handed to a single vectored write.
const MAX_IOVECS: usize = 64;

/// Run `fut` for at most `limit`; `None` if it ran out.
///
/// A zero `limit` waits indefinitely.
pub(crate) async fn bounded<F: Future>(limit: Duration, fut: F) -> Option<F::Output> {
    if limit.is_zero() {
        Some(fut.await)
    } else {
        timeout(limit, fut).await.ok()
    }
}

/// Cancellation signal for a call: a token, an optional deadline, or both.
///
/// Cloning shares the token, so cancelling any clone cancels them all.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Interrupt {
    /// An interrupt that only fires when cancelled explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire when `token` is cancelled.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Also fire at `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Also fire once `after` has elapsed from now.
    pub fn with_timeout(self, after: Duration) -> Self {
        self.with_deadline(Instant::now() + after)
    }

    /// Underlying token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel the call.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the token is cancelled or the deadline has passed.
    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Completes once the interrupt fires.
    pub async fn fired(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

/// Per-exchange I/O limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeConfig {
    /// Bound on each write call; zero for none.
    pub write_timeout: Duration,
    /// Idle bound between reads; zero reads until EOF.
    pub read_timeout: Duration,
    /// Responses larger than this fail with `Protocol`.
    pub max_response_size: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            write_timeout: DEFAULT_IO_TIMEOUT,
            read_timeout: DEFAULT_IO_TIMEOUT,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        }
    }
}

impl From<&Options> for ExchangeConfig {
    fn from(opts: &Options) -> Self {
        Self {
            write_timeout: opts.write_timeout,
            read_timeout: opts.read_timeout,
            max_response_size: opts.max_response_size,
        }
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run one command over a fresh connection and return the raw response.
///
/// Dial errors are returned as-is; this function never retries.
///
/// # Errors
///
/// - `Transport` on dial, write or read failure
/// - `Cancelled` if `interrupt` fires first; any partial response is discarded
/// - `Protocol` if the response exceeds `config.max_response_size`
pub async fn exchange<C: Connector>(
    cmd: &Command,
    connector: &C,
    config: &ExchangeConfig,
    interrupt: &Interrupt,
) -> Result<Bytes> {
    if interrupt.is_fired() {
        return Err(ClamdError::Cancelled);
    }

    let stream = tokio::select! {
        biased;
        _ = interrupt.fired() => {
            tracing::debug!("{} cancelled while dialing", cmd.kind());
            return Err(ClamdError::Cancelled);
        }
        conn = connector.connect() => conn?,
    };

    let mut task = AbortOnDrop(tokio::spawn(run(stream, cmd.clone(), *config)));

    tokio::select! {
        biased;
        _ = interrupt.fired() => {
            task.0.abort();
            // Wait for the task to unwind so the connection is closed on return.
            let _ = (&mut task.0).await;
            tracing::debug!("{} cancelled, connection closed", cmd.kind());
            Err(ClamdError::Cancelled)
        }
        joined = &mut task.0 => match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(ClamdError::Cancelled),
        },
    }
}

/// I/O half: owns the stream for its whole lifetime.
async fn run<S>(mut stream: S, cmd: Command, config: ExchangeConfig) -> Result<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = match write_command(&mut stream, &cmd, config.write_timeout).await {
        Ok(()) => read_response(&mut stream, &config).await,
        Err(e) => Err(e),
    };

    if result.is_ok() {
        let _ = bounded(config.write_timeout, stream.shutdown()).await;
    }
    drop(stream);

    result
}

/// Write the header then every chunk, in order.
async fn write_command<W>(writer: &mut W, cmd: &Command, write_timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let segments: Vec<Bytes> = cmd.segments().collect();

    write_segments(writer, &segments, write_timeout).await?;

    match bounded(write_timeout, writer.flush()).await {
        Some(Ok(())) => {}
        Some(Err(e)) => return Err(ClamdError::transport(TransportStage::Write, e)),
        None => return Err(ClamdError::timed_out(TransportStage::Write)),
    }

    tracing::trace!(
        "Wrote {} ({} bytes, {} chunks)",
        cmd.kind(),
        cmd.wire_len(),
        cmd.body().len()
    );
    Ok(())
}

/// Scatter/gather write of all segments, resuming after partial writes.
///
/// `index` is the first segment not yet fully written and `offset` how much
/// of it already went out, so each call only looks at what is left.
async fn write_segments<W>(
    writer: &mut W,
    segments: &[Bytes],
    write_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut index = 0;
    let mut offset = 0;

    while index < segments.len() {
        let slices = remaining_slices(&segments[index..], offset);

        let n = match bounded(write_timeout, writer.write_vectored(&slices)).await {
            Some(Ok(0)) => {
                return Err(ClamdError::transport(
                    TransportStage::Write,
                    std::io::Error::new(std::io::ErrorKind::WriteZero, "write_vectored returned 0"),
                ))
            }
            Some(Ok(n)) => n,
            Some(Err(e)) => return Err(ClamdError::transport(TransportStage::Write, e)),
            None => return Err(ClamdError::timed_out(TransportStage::Write)),
        };

        (index, offset) = advance(segments, index, offset + n);
    }

    Ok(())
}

/// Up to [`MAX_IOVECS`] slices, the first one skipping `offset` bytes.
fn remaining_slices(segments: &[Bytes], offset: usize) -> Vec<IoSlice<'_>> {
    segments
        .iter()
        .take(MAX_IOVECS)
        .enumerate()
        .map(|(i, segment)| {
            if i == 0 {
                IoSlice::new(&segment[offset..])
            } else {
                IoSlice::new(segment)
            }
        })
        .collect()
}

/// Move the write cursor forward by `written` bytes from `index`.
fn advance(segments: &[Bytes], mut index: usize, mut written: usize) -> (usize, usize) {
    while index < segments.len() && written >= segments[index].len() {
        written -= segments[index].len();
        index += 1;
    }
    (index, written)
}

/// Read until the peer closes, or until it goes idle after sending data.
async fn read_response<R>(reader: &mut R, config: &ExchangeConfig) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        buf.reserve(READ_CHUNK);

        match bounded(config.read_timeout, reader.read_buf(&mut buf)).await {
            Some(Ok(0)) => break,
            Some(Ok(_)) => {
                if buf.len() > config.max_response_size {
                    return Err(ClamdError::Protocol(format!(
                        "Response exceeds maximum of {} bytes",
                        config.max_response_size
                    )));
                }
            }
            Some(Err(e)) => return Err(ClamdError::transport(TransportStage::Read, e)),
            None if buf.is_empty() => return Err(ClamdError::timed_out(TransportStage::Read)),
            None => {
                tracing::debug!(
                    "Peer idle for {:?}, ending response at {} bytes",
                    config.read_timeout,
                    buf.len()
                );
                break;
            }
        }
    }

    Ok(buf.freeze())
}
