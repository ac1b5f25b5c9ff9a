//! Per-connection state machine.
//!
//! ```text
//! AwaitingRequest -> Resolving -> Authenticating -> Connecting -> Tunneling -> Closed
//!                        |              |               |
//!                        +--------------+---------------+------> Failed
//! ```
//!
//! A session owns the client socket from acceptance and the backend socket
//! once connected. Whatever happens, it ends by closing both sockets once,
//! deregistering from the registry, and returning a `SessionSummary`.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::auth::Authenticator;
use super::headers::{
    discard_fragment, read_request, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_REQUEST_BYTES,
};
use super::registry::{Registration, Registry, SessionId};
use super::relay::{close_quietly, relay, RelayConfig, RelayEnd, RelayReport};
use super::resolver::{TargetResolver, TargetSpec};
use crate::error::TunnelError;

/// Fixed upgrade response sent before tunneling.
///
/// The byte layout (blank line before `Content-Length`) is what deployed
/// clients expect and is kept verbatim. The length is meaningless.
pub const SWITCHING_PROTOCOLS_RESPONSE: &[u8] =
    b"HTTP/1.1 101 Switching Protocols\r\n\r\nContent-Length: 104857600000\r\n\r\n";

/// Default deadline for resolving and connecting to a backend.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingRequest,
    Resolving,
    Authenticating,
    Connecting,
    Tunneling,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::AwaitingRequest => "awaiting_request",
            SessionState::Resolving => "resolving",
            SessionState::Authenticating => "authenticating",
            SessionState::Connecting => "connecting",
            SessionState::Tunneling => "tunneling",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Everything a session needs besides its sockets. Shared read-only.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub resolver: TargetResolver,
    pub authenticator: Authenticator,
    pub relay: RelayConfig,
    /// Upper bound of the initial client read.
    pub max_request_bytes: usize,
    /// Deadline for the initial read and the `X-Split` discard read.
    pub handshake_timeout: Duration,
    /// Deadline for resolving and connecting to the backend.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resolver: TargetResolver::new(Default::default()),
            authenticator: Authenticator::default(),
            relay: RelayConfig::default(),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Handshake failed before tunneling.
    Rejected(TunnelError),
    /// Relay ran and stopped for the given reason.
    Relayed(RelayEnd),
}

impl SessionOutcome {
    pub fn reason_code(&self) -> &'static str {
        match self {
            SessionOutcome::Rejected(e) => e.reason_code(),
            SessionOutcome::Relayed(end) => end.reason_code(),
        }
    }
}

/// Final record of a session, for logging and tests.
#[derive(Debug)]
pub struct SessionSummary {
    pub id: SessionId,
    pub client: SocketAddr,
    pub target: Option<String>,
    pub state: SessionState,
    pub outcome: SessionOutcome,
    pub opened_at: DateTime<Utc>,
    pub duration: Duration,
    pub bytes_to_backend: u64,
    pub bytes_to_client: u64,
}

/// One accepted client connection.
pub struct Session {
    id: SessionId,
    state: SessionState,
    client: Option<TcpStream>,
    backend: Option<TcpStream>,
    client_addr: SocketAddr,
    target: Option<String>,
    created_at: Instant,
    opened_at: DateTime<Utc>,
    close_rx: watch::Receiver<bool>,
    config: Arc<SessionConfig>,
    registry: Arc<Registry>,
}

impl Session {
    /// Wrap an accepted stream that has already been registered.
    pub fn new(
        client: TcpStream,
        client_addr: SocketAddr,
        registration: Registration,
        config: Arc<SessionConfig>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            id: registration.id,
            state: SessionState::AwaitingRequest,
            client: Some(client),
            backend: None,
            client_addr,
            target: None,
            created_at: Instant::now(),
            opened_at: Utc::now(),
            close_rx: registration.close_rx,
            config,
            registry,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_closed(&self) -> bool {
        self.client.is_none()
    }

    pub fn backend_closed(&self) -> bool {
        self.backend.is_none()
    }

    /// Drive the session to completion.
    pub async fn run(mut self) -> SessionSummary {
        let mut close_rx = self.close_rx.clone();

        let handshake = tokio::select! {
            result = self.handshake() => result,
            _ = close_requested(&mut close_rx) => Err(TunnelError::Shutdown),
        };

        let (outcome, bytes_to_backend, bytes_to_client) = match handshake {
            Ok(()) => {
                let report = self.tunnel().await;
                self.log_relay_end(&report);
                (
                    SessionOutcome::Relayed(report.end),
                    report.bytes_to_backend,
                    report.bytes_to_client,
                )
            }
            Err(e) => {
                self.reject(&e).await;
                self.transition(SessionState::Failed);
                (SessionOutcome::Rejected(e), 0, 0)
            }
        };

        self.close().await;
        self.registry.record_bytes(bytes_to_backend, bytes_to_client);
        let duration = self
            .registry
            .deregister(self.id)
            .unwrap_or_else(|| self.created_at.elapsed());

        info!(
            dest = self.target.as_deref().unwrap_or("-"),
            state = %self.state,
            reason = outcome.reason_code(),
            bytes_to_backend,
            bytes_to_client,
            duration_secs = duration.as_secs_f64(),
            "Session closed"
        );

        SessionSummary {
            id: self.id,
            client: self.client_addr,
            target: self.target.take(),
            state: self.state,
            outcome,
            opened_at: self.opened_at,
            duration,
            bytes_to_backend,
            bytes_to_client,
        }
    }

    /// Close both sockets. Safe to call more than once.
    ///
    /// A session that already failed stays `Failed`; anything else becomes
    /// `Closed`.
    pub async fn close(&mut self) {
        if let Some(mut client) = self.client.take() {
            close_quietly(&mut client).await;
        }
        if let Some(mut backend) = self.backend.take() {
            close_quietly(&mut backend).await;
        }
        if self.state != SessionState::Failed {
            self.transition(SessionState::Closed);
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Session state");
            self.state = next;
        }
    }

    fn client_mut(&mut self) -> Result<&mut TcpStream, TunnelError> {
        self.client
            .as_mut()
            .ok_or_else(|| TunnelError::ClientReadError(io::ErrorKind::NotConnected.into()))
    }

    async fn handshake(&mut self) -> Result<(), TunnelError> {
        let max_bytes = self.config.max_request_bytes;
        let deadline = self.config.handshake_timeout;

        let client = self.client_mut()?;
        let head = read_request(client, max_bytes, deadline)
            .await
            .map_err(TunnelError::ClientReadError)?;

        self.transition(SessionState::Resolving);
        let resolution = self.config.resolver.resolve(&head)?;
        self.registry.set_target(self.id, &resolution.target);
        self.target = Some(resolution.target.clone());

        if head.split_requested() {
            let client = self.client_mut()?;
            let discarded = discard_fragment(client, max_bytes, deadline)
                .await
                .map_err(TunnelError::ClientReadError)?;
            debug!(bytes = discarded, "Split fragment discarded");
        }

        self.transition(SessionState::Authenticating);
        if let Err(e) = self.config.authenticator.check(&head) {
            warn!(dest = %resolution.target, "Wrong password");
            return Err(e);
        }

        self.transition(SessionState::Connecting);
        let backend = self.connect(&resolution.target).await?;
        self.backend = Some(backend);

        let client = self.client_mut()?;
        client
            .write_all(SWITCHING_PROTOCOLS_RESPONSE)
            .await
            .map_err(TunnelError::ClientReadError)?;

        self.transition(SessionState::Tunneling);
        info!(
            dest = %resolution.target,
            source = %resolution.source,
            "Tunnel established"
        );
        Ok(())
    }

    async fn connect(&self, target: &str) -> Result<TcpStream, TunnelError> {
        let to_unreachable = |source: io::Error| TunnelError::TargetUnreachable {
            target: target.to_string(),
            source,
        };

        let spec = TargetSpec::parse(target).map_err(to_unreachable)?;
        let attempt = async {
            let addrs = spec.lookup().await?;
            TcpStream::connect(&addrs[..]).await
        };

        match timeout(self.config.connect_timeout, attempt).await {
            Ok(Ok(stream)) => {
                debug!(
                    backend_addr = ?stream.peer_addr().ok(),
                    "Connected to backend"
                );
                Ok(stream)
            }
            Ok(Err(e)) => {
                warn!(dest = %spec, error = %e, "Backend connection failed");
                Err(to_unreachable(e))
            }
            Err(_) => {
                warn!(dest = %spec, "Backend connect timeout");
                Err(to_unreachable(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timeout",
                )))
            }
        }
    }

    async fn tunnel(&mut self) -> RelayReport {
        match (self.client.as_mut(), self.backend.as_mut()) {
            (Some(client), Some(backend)) => {
                relay(client, backend, &self.config.relay, &mut self.close_rx).await
            }
            _ => RelayReport {
                bytes_to_backend: 0,
                bytes_to_client: 0,
                idle_cycles: 0,
                end: RelayEnd::Failed(TunnelError::ClientReadError(
                    io::ErrorKind::NotConnected.into(),
                )),
            },
        }
    }

    /// Send the error's response, if it has one. Best effort: the client may
    /// already be gone.
    async fn reject(&mut self, error: &TunnelError) {
        debug!(reason = error.reason_code(), error = %error, "Handshake failed");

        let Some(response) = error.rejection_response() else {
            return;
        };
        if let Some(client) = self.client.as_mut() {
            if let Err(e) = client.write_all(response).await {
                debug!(error = %e, "Failed to send rejection");
            }
        }
    }

    fn log_relay_end(&self, report: &RelayReport) {
        match &report.end {
            RelayEnd::Failed(TunnelError::IdleTimeout { cycles }) => {
                info!(cycles, "Idle timeout");
            }
            RelayEnd::Failed(e) => {
                debug!(error = %e, "Relay error");
            }
            _ => {}
        }
    }
}

async fn close_requested(rx: &mut watch::Receiver<bool>) {
    // A dropped sender also counts as a close request.
    let _ = rx.wait_for(|closed| *closed).await;
}
