//! sshws
//!
//! SSH over an HTTP-looking TCP tunnel.
//!
//! This service:
//! - Accepts TCP connections on one listening address
//! - Picks a backend from the client's request head
//! - Optionally checks a shared secret
//! - Relays bytes until either side closes or the tunnel goes idle

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sshws_tunnel::config::{Cli, Config, LogFormat};
use sshws_tunnel::{reporter, Listener, Registry};

/// How long stop waits for sessions to unwind.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_cli(Cli::parse())?;

    init_tracing(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting sshws tunnel");
    info!(
        bind_addr = %config.bind_addr(),
        default_target = %config.default_target,
        password_protected = config.password_protected(),
        max_connections = config.listener.max_connections,
        "Configuration loaded"
    );

    let registry = Arc::new(Registry::with_event_capacity(config.event_log_capacity));

    let listener = match Listener::bind(config.listener.clone(), Arc::clone(&registry)).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(bind_addr = %config.bind_addr(), error = %e, "Failed to bind listener");
            return Err(e).with_context(|| format!("Failed to bind {}", config.bind_addr()));
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(interval) = config.stats_interval {
        tokio::spawn(reporter::run_stats_loop(
            Arc::clone(&registry),
            interval,
            shutdown_rx,
        ));
    }

    let mut accept_loop = tokio::spawn(Arc::clone(&listener).run());

    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Interrupt received, stopping"),
            Err(e) => error!(error = %e, "Failed to listen for interrupt, stopping"),
        },
        joined = &mut accept_loop => match joined {
            Ok(Ok(())) => warn!("Accept loop exited"),
            Ok(Err(e)) => error!(error = %e, "Listener error"),
            Err(e) => error!(error = %e, "Accept loop task failed"),
        },
    }

    let _ = shutdown_tx.send(true);
    listener.stop();

    if !listener.wait_idle(SHUTDOWN_GRACE).await {
        warn!(remaining = registry.active(), "Sessions still open at exit");
    }

    let stats = reporter::report(&registry);
    info!(total = stats.total_connections, "Tunnel stopped");

    Ok(())
}

fn init_tracing(config: &Config) {
    // Prefer RUST_LOG, fall back to SSHWS_LOG_LEVEL
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
