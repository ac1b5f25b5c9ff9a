//! Bidirectional byte relay with idle-cycle detection.
//!
//! A single `select!` waits on both sides at once. Every cycle is bounded by
//! `cycle_wait`. A cycle that expires with no bytes moved counts as idle, and
//! `max_idle_cycles` consecutive idle cycles end the relay.
//!
//! Within a direction, bytes are forwarded in read order and every read is
//! flushed in full (`write_all`) before the next wait. A forwarding write
//! still observes the close signal, and one that cannot drain within the
//! idle budget (`cycle_wait * max_idle_cycles`) ends the relay as idle.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::trace;

use super::headers::DEFAULT_MAX_REQUEST_BYTES;
use crate::error::TunnelError;

/// Default per-cycle wait.
pub const DEFAULT_CYCLE_WAIT: Duration = Duration::from_secs(3);

/// Default idle cycles before the relay gives up (3 minutes at the default wait).
pub const DEFAULT_MAX_IDLE_CYCLES: u32 = 60;

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Read buffer size per direction.
    pub buffer_size: usize,
    /// Upper bound of a single wait.
    pub cycle_wait: Duration,
    /// Consecutive idle cycles tolerated.
    pub max_idle_cycles: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_MAX_REQUEST_BYTES,
            cycle_wait: DEFAULT_CYCLE_WAIT,
            max_idle_cycles: DEFAULT_MAX_IDLE_CYCLES,
        }
    }
}

impl RelayConfig {
    /// Total idle time tolerated.
    pub fn idle_timeout(&self) -> Duration {
        self.cycle_wait * self.max_idle_cycles
    }
}

/// Why the relay stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// Client sent EOF.
    ClientClosed,
    /// Backend sent EOF.
    BackendClosed,
    /// Socket failure or idle timeout.
    Failed(TunnelError),
    /// Force-closed through the session's close signal.
    Shutdown,
}

impl RelayEnd {
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayEnd::ClientClosed => "client_closed",
            RelayEnd::BackendClosed => "backend_closed",
            RelayEnd::Failed(e) => e.reason_code(),
            RelayEnd::Shutdown => "shutdown",
        }
    }
}

/// Outcome of a relay run.
#[derive(Debug)]
pub struct RelayReport {
    /// Bytes forwarded client -> backend.
    pub bytes_to_backend: u64,
    /// Bytes forwarded backend -> client.
    pub bytes_to_client: u64,
    /// Idle cycles counted at the moment the relay stopped.
    pub idle_cycles: u32,
    pub end: RelayEnd,
}

impl RelayReport {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_to_backend + self.bytes_to_client
    }
}

/// Relay bytes between `client` and `backend` until EOF, error, idle timeout
/// or a close signal.
///
/// The close signal fires when the watched value becomes `true` or the sender
/// is dropped.
pub async fn relay<C, B>(
    client: &mut C,
    backend: &mut B,
    config: &RelayConfig,
    close: &mut watch::Receiver<bool>,
) -> RelayReport
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let size = config.buffer_size.max(1);
    let stall_limit = config.idle_timeout();
    let mut client_buf = vec![0u8; size];
    let mut backend_buf = vec![0u8; size];

    let mut bytes_to_backend = 0u64;
    let mut bytes_to_client = 0u64;
    let mut idle_cycles = 0u32;

    let already_closed = *close.borrow();
    let end = if already_closed {
        RelayEnd::Shutdown
    } else {
        loop {
            tokio::select! {
                read = client.read(&mut client_buf) => match read {
                    Ok(0) => break RelayEnd::ClientClosed,
                    Ok(n) => {
                        match forward(backend, &client_buf[..n], stall_limit, close).await {
                            Forwarded::Done => {}
                            Forwarded::Failed(e) => {
                                break RelayEnd::Failed(TunnelError::BackendReadError(e))
                            }
                            Forwarded::Stalled => break stalled(config),
                            Forwarded::Closed => break RelayEnd::Shutdown,
                        }
                        bytes_to_backend += n as u64;
                        idle_cycles = 0;
                        trace!(bytes = n, "client -> backend");
                    }
                    Err(e) => break RelayEnd::Failed(TunnelError::ClientReadError(e)),
                },
                read = backend.read(&mut backend_buf) => match read {
                    Ok(0) => break RelayEnd::BackendClosed,
                    Ok(n) => {
                        match forward(client, &backend_buf[..n], stall_limit, close).await {
                            Forwarded::Done => {}
                            Forwarded::Failed(e) => {
                                break RelayEnd::Failed(TunnelError::ClientReadError(e))
                            }
                            Forwarded::Stalled => break stalled(config),
                            Forwarded::Closed => break RelayEnd::Shutdown,
                        }
                        bytes_to_client += n as u64;
                        idle_cycles = 0;
                        trace!(bytes = n, "backend -> client");
                    }
                    Err(e) => break RelayEnd::Failed(TunnelError::BackendReadError(e)),
                },
                changed = close.changed() => {
                    let closed = changed.is_err() || *close.borrow();
                    if closed {
                        break RelayEnd::Shutdown;
                    }
                }
                _ = tokio::time::sleep(config.cycle_wait) => {
                    idle_cycles += 1;
                    if idle_cycles >= config.max_idle_cycles {
                        break RelayEnd::Failed(TunnelError::IdleTimeout {
                            cycles: idle_cycles,
                        });
                    }
                }
            }
        }
    };

    RelayReport {
        bytes_to_backend,
        bytes_to_client,
        idle_cycles,
        end,
    }
}

enum Forwarded {
    Done,
    Failed(io::Error),
    /// The peer did not drain the chunk within the idle budget.
    Stalled,
    Closed,
}

/// Write one chunk in full, unless the close signal fires or the peer stops
/// draining for `stall_limit`.
async fn forward<W: AsyncWrite + Unpin>(
    dst: &mut W,
    data: &[u8],
    stall_limit: Duration,
    close: &mut watch::Receiver<bool>,
) -> Forwarded {
    tokio::select! {
        written = tokio::time::timeout(stall_limit, dst.write_all(data)) => match written {
            Ok(Ok(())) => Forwarded::Done,
            Ok(Err(e)) => Forwarded::Failed(e),
            Err(_) => Forwarded::Stalled,
        },
        _ = close_signalled(close) => Forwarded::Closed,
    }
}

fn stalled(config: &RelayConfig) -> RelayEnd {
    trace!(limit_ms = config.idle_timeout().as_millis() as u64, "Write stalled");
    RelayEnd::Failed(TunnelError::IdleTimeout {
        cycles: config.max_idle_cycles,
    })
}

async fn close_signalled(close: &mut watch::Receiver<bool>) {
    // A dropped sender also counts as a close request.
    let _ = close.wait_for(|closed| *closed).await;
}

/// Shut down the write side of a stream, ignoring sockets that are already gone.
pub async fn close_quietly<S: AsyncWrite + Unpin>(stream: &mut S) {
    if let Err(e) = stream.shutdown().await {
        if e.kind() != io::ErrorKind::NotConnected {
            trace!(error = %e, "Shutdown error");
        }
    }
}
