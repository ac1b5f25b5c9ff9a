//! Target resolution from the sniffed request head.
//!
//! Precedence, applied to the single initial read:
//! 1. `X-Real-Host`, verbatim
//! 2. WebSocket upgrade: `Host`, unless it names the reserved port, in which
//!    case the default target
//! 3. `Host`
//! 4. the configured default target
//!
//! An empty result after all fallbacks is `NoTargetHost`.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::net::lookup_host;
use tracing::debug;

use super::headers::RequestHead;
use crate::error::TunnelError;

/// Port assumed when a target carries none.
pub const DEFAULT_TARGET_PORT: u16 = 22;

/// Default backend when the request names none.
pub const DEFAULT_TARGET: &str = "127.0.0.1:22";

/// Where a resolved target came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSource {
    /// `X-Real-Host` header.
    RealHost,
    /// `Host` header of a WebSocket upgrade.
    WebSocketHost,
    /// `Host` header of a plain request.
    Host,
    /// Configured default.
    Default,
}

impl fmt::Display for TargetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetSource::RealHost => "x-real-host",
            TargetSource::WebSocketHost => "websocket-host",
            TargetSource::Host => "host",
            TargetSource::Default => "default",
        };
        f.write_str(s)
    }
}

/// Configuration for target resolution.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Fallback `host:port`. May be empty, in which case unresolved requests
    /// fail with `NoTargetHost`.
    pub default_target: String,
    /// A WebSocket `Host` ending in `:<reserved_port>` points at the tunnel
    /// itself and is ignored.
    pub reserved_port: Option<u16>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_target: DEFAULT_TARGET.to_string(),
            reserved_port: None,
        }
    }
}

/// Resolved target, still in its textual `host[:port]` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub target: String,
    pub source: TargetSource,
}

/// Decides the backend for a session.
#[derive(Debug, Clone)]
pub struct TargetResolver {
    config: ResolverConfig,
    reserved_suffix: Option<String>,
}

impl TargetResolver {
    pub fn new(config: ResolverConfig) -> Self {
        let reserved_suffix = config.reserved_port.map(|p| format!(":{}", p));
        Self {
            config,
            reserved_suffix,
        }
    }

    /// Apply the resolution precedence to a request head.
    pub fn resolve(&self, head: &RequestHead) -> Result<Resolution, TunnelError> {
        let (raw, source) = self.select(head);
        let target = String::from_utf8_lossy(raw).into_owned();

        if target.is_empty() {
            return Err(TunnelError::NoTargetHost);
        }

        debug!(
            dest = %target,
            source = %source,
            connection = %String::from_utf8_lossy(head.connection()),
            "Target resolved"
        );

        Ok(Resolution { target, source })
    }

    fn select<'a>(&'a self, head: &'a RequestHead) -> (&'a [u8], TargetSource) {
        let real_host = head.real_host();
        if !real_host.is_empty() {
            return (real_host, TargetSource::RealHost);
        }

        let host = head.host();
        let default = self.config.default_target.as_bytes();

        if head.is_websocket_upgrade() {
            if !host.is_empty() && !self.is_reserved(host) {
                return (host, TargetSource::WebSocketHost);
            }
            return (default, TargetSource::Default);
        }

        if !host.is_empty() {
            return (host, TargetSource::Host);
        }

        (default, TargetSource::Default)
    }

    fn is_reserved(&self, host: &[u8]) -> bool {
        self.reserved_suffix
            .as_deref()
            .is_some_and(|suffix| host.ends_with(suffix.as_bytes()))
    }
}

/// A backend `(host, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetSpec {
    pub host: String,
    pub port: u16,
}

impl TargetSpec {
    /// Parse `host[:port]`.
    ///
    /// The split is on the first colon, except for bracketed IPv6 literals
    /// (`[::1]:22`). A missing port means 22.
    pub fn parse(target: &str) -> io::Result<Self> {
        let target = target.trim();

        let (host, port) = if let Some(rest) = target.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| invalid_target(target, "unterminated IPv6 literal"))?;
            let port = match after.strip_prefix(':') {
                Some(port) => Some(port),
                None if after.is_empty() => None,
                None => return Err(invalid_target(target, "junk after IPv6 literal")),
            };
            (host, port)
        } else {
            match target.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (target, None),
            }
        };

        if host.is_empty() {
            return Err(invalid_target(target, "empty host"));
        }

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| invalid_target(target, "invalid port"))?,
            None => DEFAULT_TARGET_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Resolve the host through the system resolver.
    pub async fn lookup(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = lookup_host((self.host.as_str(), self.port))
            .await?
            .collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {}", self.host),
            ));
        }
        Ok(addrs)
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn invalid_target(target: &str, reason: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid target '{}': {}", target, reason),
    )
}
