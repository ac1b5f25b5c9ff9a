//! SSH-over-HTTP tunnel core.
//!
//! This module provides:
//! - TCP listener management
//! - Request-head sniffing and target resolution
//! - Shared-secret authentication
//! - Per-connection sessions with a bidirectional relay
//! - A session registry with accounting and force-close
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Session -> read head -> Resolver -> Authenticator
//!                          |                                    |
//!                       Registry                     connect + 101 response
//!                                                               |
//!                                                      Relay <-> Backend
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig, Registry};
//!
//! let registry = Arc::new(Registry::new());
//! let config = ListenerConfig::new("0.0.0.0:8098".parse()?);
//! let listener = Arc::new(Listener::bind(config, registry).await?);
//! listener.run().await?;
//! ```

mod auth;
mod headers;
mod listener;
mod registry;
mod relay;
mod resolver;
mod session;

pub use auth::Authenticator;
pub use headers::{
    discard_fragment, read_request, scan_header, RequestHead, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_MAX_REQUEST_BYTES,
};
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use registry::{
    ConnectionEvent, EventKind, Registration, Registry, RegistryStats, SessionId,
    DEFAULT_EVENT_LOG_CAPACITY,
};
pub use relay::{
    relay, RelayConfig, RelayEnd, RelayReport, DEFAULT_CYCLE_WAIT, DEFAULT_MAX_IDLE_CYCLES,
};
pub use resolver::{
    Resolution, ResolverConfig, TargetResolver, TargetSource, TargetSpec, DEFAULT_TARGET,
    DEFAULT_TARGET_PORT,
};
pub use session::{
    Session, SessionConfig, SessionOutcome, SessionState, SessionSummary, DEFAULT_CONNECT_TIMEOUT,
    SWITCHING_PROTOCOLS_RESPONSE,
};
