//! Tunnel configuration.
//!
//! Settings come from command-line flags with environment fallbacks and are
//! fixed for the life of the process.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};

use crate::proxy::{
    Authenticator, ListenerConfig, RelayConfig, ResolverConfig, SessionConfig, TargetResolver,
    TargetSpec, DEFAULT_CONNECT_TIMEOUT, DEFAULT_EVENT_LOG_CAPACITY, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_REQUEST_BYTES, DEFAULT_TARGET,
};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8098;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// sshws - SSH over an HTTP-looking TCP tunnel.
#[derive(Debug, Parser)]
#[command(name = "sshws")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on.
    #[arg(short = 'b', long = "bind", env = "SSHWS_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Port to listen on.
    #[arg(short = 'p', long, env = "SSHWS_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Backend used when the request names none (`host[:port]`, empty to require one).
    #[arg(long, env = "SSHWS_DEFAULT_TARGET", default_value = DEFAULT_TARGET)]
    pub default_target: String,

    /// Shared secret expected in `X-Pass`. Empty disables the check.
    #[arg(long, env = "SSHWS_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,

    /// Read buffer size in bytes, also the cap on the initial request read.
    #[arg(long, env = "SSHWS_BUFFER_SIZE", default_value_t = DEFAULT_MAX_REQUEST_BYTES)]
    pub buffer_size: usize,

    /// Consecutive idle cycles before a tunnel is closed.
    #[arg(long, env = "SSHWS_IDLE_CYCLES", default_value_t = 60)]
    pub idle_cycles: u32,

    /// Length of one relay wait cycle, in milliseconds.
    #[arg(long, env = "SSHWS_CYCLE_WAIT_MS", default_value_t = 3000)]
    pub cycle_wait_ms: u64,

    /// Deadline for the client's request head, in milliseconds.
    #[arg(long, env = "SSHWS_HANDSHAKE_TIMEOUT_MS", default_value_t = DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64)]
    pub handshake_timeout_ms: u64,

    /// Deadline for reaching the backend, in milliseconds.
    #[arg(long, env = "SSHWS_CONNECT_TIMEOUT_MS", default_value_t = DEFAULT_CONNECT_TIMEOUT.as_millis() as u64)]
    pub connect_timeout_ms: u64,

    /// WebSocket `Host` values ending in this port are ignored. Defaults to
    /// the listening port.
    #[arg(long, env = "SSHWS_RESERVED_PORT")]
    pub reserved_port: Option<u16>,

    /// Maximum concurrent sessions.
    #[arg(long, env = "SSHWS_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Number of recent connection events kept in memory.
    #[arg(long, env = "SSHWS_EVENT_LOG_CAPACITY", default_value_t = DEFAULT_EVENT_LOG_CAPACITY)]
    pub event_log_capacity: usize,

    /// Seconds between stats reports. 0 disables the reporter.
    #[arg(long, env = "SSHWS_STATS_INTERVAL_SECS", default_value_t = 10)]
    pub stats_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, env = "SSHWS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "SSHWS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Validated tunnel configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener and per-session settings.
    pub listener: ListenerConfig,

    /// Fallback target, kept for the startup log.
    pub default_target: String,

    /// Capacity of the registry's recent-event log.
    pub event_log_capacity: usize,

    /// Stats reporter period, `None` when disabled.
    pub stats_interval: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,
}

impl Config {
    /// Validate parsed flags into a configuration.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let ip: IpAddr = cli
            .bind
            .trim()
            .parse()
            .with_context(|| format!("Invalid bind address '{}'.", cli.bind))?;
        let bind_addr = SocketAddr::new(ip, cli.port);

        let default_target = cli.default_target.trim().to_string();
        if !default_target.is_empty() {
            TargetSpec::parse(&default_target).with_context(|| {
                format!("SSHWS_DEFAULT_TARGET '{}' is not host[:port].", default_target)
            })?;
        }

        if cli.buffer_size == 0 {
            bail!("SSHWS_BUFFER_SIZE must be at least 1.");
        }
        if cli.idle_cycles == 0 {
            bail!("SSHWS_IDLE_CYCLES must be at least 1.");
        }
        if cli.cycle_wait_ms == 0 {
            bail!("SSHWS_CYCLE_WAIT_MS must be at least 1.");
        }
        if cli.max_connections == 0 {
            bail!("SSHWS_MAX_CONNECTIONS must be at least 1.");
        }

        // Port 0 binds an ephemeral port, which no client can name.
        let reserved_port = cli.reserved_port.or((cli.port != 0).then_some(cli.port));

        let session = SessionConfig {
            resolver: TargetResolver::new(ResolverConfig {
                default_target: default_target.clone(),
                reserved_port,
            }),
            authenticator: Authenticator::new(cli.password),
            relay: RelayConfig {
                buffer_size: cli.buffer_size,
                cycle_wait: Duration::from_millis(cli.cycle_wait_ms),
                max_idle_cycles: cli.idle_cycles,
            },
            max_request_bytes: cli.buffer_size,
            handshake_timeout: Duration::from_millis(cli.handshake_timeout_ms.max(1)),
            connect_timeout: Duration::from_millis(cli.connect_timeout_ms.max(1)),
        };

        let listener = ListenerConfig {
            bind_addr,
            max_connections: cli.max_connections,
            session,
        };

        let stats_interval =
            (cli.stats_interval_secs > 0).then(|| Duration::from_secs(cli.stats_interval_secs));

        Ok(Self {
            listener,
            default_target,
            event_log_capacity: cli.event_log_capacity,
            stats_interval,
            log_level: cli.log_level,
            log_format: cli.log_format,
        })
    }

    /// Parse and validate from an argument list.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args).context("Invalid command line.")?;
        Self::from_cli(cli)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.listener.bind_addr
    }

    pub fn password_protected(&self) -> bool {
        self.listener.session.authenticator.is_enabled()
    }
}
