//! sshws tunnel
//!
//! A TCP tunnel that looks like an HTTP upgrade to middleboxes. A client
//! opens a connection, sends a request head naming its backend, and after a
//! fixed `101 Switching Protocols` reply the connection becomes a raw byte
//! pipe to that backend (typically an SSH server).

pub mod config;
pub mod error;
pub mod proxy;
pub mod reporter;

pub use error::TunnelError;
pub use proxy::{
    Authenticator, ConnectionEvent, EventKind, Listener, ListenerConfig, ListenerStats,
    Registry, RegistryStats, RelayConfig, ResolverConfig, Session, SessionConfig, SessionId,
    SessionState, TargetResolver, TargetSpec,
};
