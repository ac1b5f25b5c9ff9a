//! Periodic stats reporting.
//!
//! Logs a registry snapshot and the most recent connection events on a fixed
//! interval until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::proxy::{Registry, RegistryStats};

/// Recent events included in each report.
pub const RECENT_EVENTS_SHOWN: usize = 5;

/// Run the stats loop until `shutdown` turns `true` or its sender is dropped.
pub async fn run_stats_loop(
    registry: Arc<Registry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "Starting stats reporter");

    let mut interval_timer = tokio::time::interval(interval);
    interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval_timer.tick().await;

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                report(&registry);
            }
            changed = shutdown.changed() => {
                let stop = changed.is_err() || *shutdown.borrow();
                if stop {
                    info!("Stats reporter shutting down");
                    break;
                }
            }
        }
    }
}

/// Log one report and return the snapshot it was built from.
pub fn report(registry: &Registry) -> RegistryStats {
    let stats = registry.snapshot();

    info!(
        active = stats.active_connections,
        total = stats.total_connections,
        connections_per_minute = format_args!("{:.2}", stats.connections_per_minute),
        uptime_secs = stats.uptime_secs as u64,
        bytes_to_backend = stats.bytes_to_backend,
        bytes_to_client = stats.bytes_to_client,
        listening_port = ?stats.listening_port,
        "Tunnel stats"
    );

    for event in registry.recent_events(RECENT_EVENTS_SHOWN) {
        info!(
            at = %event.timestamp.format("%H:%M:%S"),
            kind = ?event.kind,
            session = %event.session,
            client = %event.client,
            dest = %event.target,
            duration_secs = ?event.duration_secs,
            "Recent connection"
        );
    }

    stats
}
