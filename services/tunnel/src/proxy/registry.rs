//! Registry of live sessions and connection statistics.
//!
//! The registry is the only state shared between sessions. A single mutex
//! guards the session map, the counters and the recent-event log. It is
//! never held across an `.await`.
//!
//! Each registered session gets its own close signal (`watch` channel).
//! `close_all` seals the registry and fires every signal.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

/// Default number of events retained in the recent-event log.
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 100;

/// Target label used before a session has resolved one.
pub const UNKNOWN_TARGET: &str = "Unknown";

/// Identity of a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

/// Kind of a connection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    New,
    Close,
}

/// One entry of the recent-event log.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    pub timestamp: DateTime<Utc>,
    pub session: SessionId,
    pub client: String,
    pub target: String,
    pub kind: EventKind,
    /// Session lifetime in seconds, `Close` events only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

/// Point-in-time statistics for the management layer.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: f64,
    pub connections_per_minute: f64,
    pub bytes_to_backend: u64,
    pub bytes_to_client: u64,
    /// Port the listener is bound to, once known.
    pub listening_port: Option<u16>,
}

/// Handed to a session on registration.
#[derive(Debug)]
pub struct Registration {
    pub id: SessionId,
    /// Fires when the registry force-closes this session.
    pub close_rx: watch::Receiver<bool>,
}

struct SessionEntry {
    client: String,
    target: Option<String>,
    created_at: Instant,
    close_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionEntry>,
    next_id: u64,
    total: u64,
    events: VecDeque<ConnectionEvent>,
    sealed: bool,
    bytes_to_backend: u64,
    bytes_to_client: u64,
    listening_port: Option<u16>,
}

impl Inner {
    fn push_event(&mut self, event: ConnectionEvent, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.events.len() >= capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Tracks live sessions and aggregate counters.
pub struct Registry {
    inner: Mutex<Inner>,
    event_capacity: usize,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Registry {
    /// Create a registry with the default event-log capacity.
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_LOG_CAPACITY)
    }

    /// Create a registry retaining at most `event_capacity` events.
    pub fn with_event_capacity(event_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            event_capacity,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Mutations have no fallible step, so a poisoned lock is still consistent.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new session for `client`.
    ///
    /// Returns `None` once the registry has been sealed by `close_all`.
    pub fn register(&self, client: SocketAddr) -> Option<Registration> {
        let mut inner = self.lock();
        if inner.sealed {
            return None;
        }

        inner.next_id += 1;
        inner.total += 1;
        let id = SessionId(inner.next_id);
        let client = client.to_string();
        let (close_tx, close_rx) = watch::channel(false);

        inner.sessions.insert(
            id,
            SessionEntry {
                client: client.clone(),
                target: None,
                created_at: Instant::now(),
                close_tx,
            },
        );
        inner.push_event(
            ConnectionEvent {
                timestamp: Utc::now(),
                session: id,
                client,
                target: UNKNOWN_TARGET.to_string(),
                kind: EventKind::New,
                duration_secs: None,
            },
            self.event_capacity,
        );

        Some(Registration { id, close_rx })
    }

    /// Record the resolved target of a live session.
    pub fn set_target(&self, id: SessionId, target: &str) {
        if let Some(entry) = self.lock().sessions.get_mut(&id) {
            entry.target = Some(target.to_string());
        }
    }

    /// Remove a session and log its `Close` event.
    ///
    /// Returns the session's lifetime, or `None` if it was not registered
    /// (including a second deregistration).
    pub fn deregister(&self, id: SessionId) -> Option<Duration> {
        let mut inner = self.lock();
        let entry = inner.sessions.remove(&id)?;
        let duration = entry.created_at.elapsed();

        inner.push_event(
            ConnectionEvent {
                timestamp: Utc::now(),
                session: id,
                client: entry.client,
                target: entry
                    .target
                    .unwrap_or_else(|| UNKNOWN_TARGET.to_string()),
                kind: EventKind::Close,
                duration_secs: Some(duration.as_secs_f64()),
            },
            self.event_capacity,
        );

        Some(duration)
    }

    /// Add relayed byte counts to the aggregate totals.
    pub fn record_bytes(&self, to_backend: u64, to_client: u64) {
        let mut inner = self.lock();
        inner.bytes_to_backend += to_backend;
        inner.bytes_to_client += to_client;
    }

    /// Currently registered sessions.
    pub fn active(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Sessions ever registered.
    pub fn total(&self) -> u64 {
        self.lock().total
    }

    /// `(active, total)` read under one lock.
    pub fn counts(&self) -> (usize, u64) {
        let inner = self.lock();
        (inner.sessions.len(), inner.total)
    }

    /// Whether `id` is currently registered.
    #[cfg(test)]
    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().sessions.contains_key(&id)
    }

    /// Record the port the listener bound, for the stats snapshot.
    pub fn set_listening_port(&self, port: u16) {
        self.lock().listening_port = Some(port);
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Snapshot of all counters.
    pub fn snapshot(&self) -> RegistryStats {
        let inner = self.lock();
        let uptime = self.started.elapsed().as_secs_f64();
        let connections_per_minute = if uptime > 0.0 {
            inner.total as f64 / (uptime / 60.0)
        } else {
            0.0
        };

        RegistryStats {
            active_connections: inner.sessions.len(),
            total_connections: inner.total,
            started_at: self.started_at,
            uptime_secs: uptime,
            connections_per_minute,
            bytes_to_backend: inner.bytes_to_backend,
            bytes_to_client: inner.bytes_to_client,
            listening_port: inner.listening_port,
        }
    }

    /// The most recent `count` events, oldest first.
    pub fn recent_events(&self, count: usize) -> Vec<ConnectionEvent> {
        let inner = self.lock();
        let skip = inner.events.len().saturating_sub(count);
        inner.events.iter().skip(skip).cloned().collect()
    }

    /// Seal the registry and signal every live session to close.
    ///
    /// Returns the number of sessions signalled. Sessions deregister
    /// themselves as they unwind.
    pub fn close_all(&self) -> usize {
        let mut inner = self.lock();
        inner.sealed = true;

        let mut signalled = 0;
        for entry in inner.sessions.values() {
            // Receivers already dropped means the session is unwinding anyway.
            let _ = entry.close_tx.send(true);
            signalled += 1;
        }

        debug!(sessions = signalled, "Close signalled to all sessions");
        signalled
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
