//! Error types for tunnel sessions.

use std::io;

use thiserror::Error;

/// Response sent when the shared secret check fails.
pub const WRONG_PASS_RESPONSE: &[u8] = b"HTTP/1.1 400 WrongPass!\r\n\r\n";

/// Response sent when no target could be resolved.
pub const NO_TARGET_HOST_RESPONSE: &[u8] = b"HTTP/1.1 400 NoTargetHost!\r\n\r\n";

/// Response sent when the backend connection could not be established.
pub const TUNNEL_ERROR_RESPONSE: &[u8] = b"HTTP/1.1 500 TunnelError\r\n\r\n";

/// Session errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Resolution yielded no target.
    #[error("no target host")]
    NoTargetHost,

    /// Shared secret missing or mismatched.
    #[error("wrong password")]
    WrongPass,

    /// Backend connect failed (resolution, refusal, timeout or malformed target).
    #[error("target {target} unreachable: {source}")]
    TargetUnreachable {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Client socket failed during handshake or relay.
    #[error("client read error: {0}")]
    ClientReadError(#[source] io::Error),

    /// Backend socket failed during relay.
    #[error("backend read error: {0}")]
    BackendReadError(#[source] io::Error),

    /// No bytes moved for the configured number of cycles.
    #[error("idle timeout after {cycles} cycles")]
    IdleTimeout { cycles: u32 },

    /// Session force-closed by listener shutdown.
    #[error("session closed by shutdown")]
    Shutdown,
}

impl TunnelError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            TunnelError::NoTargetHost => "no_target_host",
            TunnelError::WrongPass => "wrong_pass",
            TunnelError::TargetUnreachable { .. } => "target_unreachable",
            TunnelError::ClientReadError(_) => "client_read_error",
            TunnelError::BackendReadError(_) => "backend_read_error",
            TunnelError::IdleTimeout { .. } => "idle_timeout",
            TunnelError::Shutdown => "shutdown",
        }
    }

    /// Bytes to send to the client before closing, if this error has a
    /// client-visible response.
    ///
    /// Only handshake-phase errors are reported. Relay-phase failures end in
    /// an abrupt close.
    pub fn rejection_response(&self) -> Option<&'static [u8]> {
        match self {
            TunnelError::NoTargetHost => Some(NO_TARGET_HOST_RESPONSE),
            TunnelError::WrongPass => Some(WRONG_PASS_RESPONSE),
            TunnelError::TargetUnreachable { .. } => Some(TUNNEL_ERROR_RESPONSE),
            _ => None,
        }
    }
}
