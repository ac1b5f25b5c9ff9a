//! TCP listener and session spawning.
//!
//! The listener binds one address, accepts connections, registers each with
//! the session registry and runs it as its own task:
//! - a slow or hung session never blocks later accepts
//! - concurrent sessions are capped by a semaphore
//! - `stop()` ends the accept loop and force-closes every live session

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::registry::Registry;
use super::session::{Session, SessionConfig};

/// Default maximum concurrent sessions per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Back-off after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent sessions.
    pub max_connections: usize,
    /// Settings handed to every session.
    pub session: SessionConfig,
}

impl ListenerConfig {
    /// Create a new listener configuration with default session settings.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            session: SessionConfig::default(),
        }
    }
}

/// Accept-level statistics. Session-level counts live in the registry.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Connections accepted and handed to a session.
    pub connections_accepted: AtomicU64,
    /// Connections dropped because the session limit was reached.
    pub connections_rejected: AtomicU64,
    /// Failed `accept` calls.
    pub accept_errors: AtomicU64,
}

/// The tunnel's TCP listener.
pub struct Listener {
    listener: TcpListener,
    max_connections: usize,
    session_config: Arc<SessionConfig>,
    registry: Arc<Registry>,
    conn_semaphore: Arc<Semaphore>,
    running: watch::Sender<bool>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the configured address.
    ///
    /// Bind failure is returned to the caller and never retried.
    pub async fn bind(config: ListenerConfig, registry: Arc<Registry>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let max_connections = config
            .max_connections
            .clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize));
        registry.set_listening_port(local_addr.port());

        info!(
            bind_addr = %local_addr,
            max_connections,
            idle_timeout_secs = config.session.relay.idle_timeout().as_secs(),
            auth_enabled = config.session.authenticator.is_enabled(),
            "Listener bound"
        );

        let (running, _) = watch::channel(true);

        Ok(Self {
            listener,
            max_connections,
            session_config: Arc::new(config.session),
            registry,
            conn_semaphore: Arc::new(Semaphore::new(max_connections)),
            running,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// The registry this listener feeds.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Stop accepting and force-close every live session.
    ///
    /// Returns the number of sessions signalled.
    pub fn stop(&self) -> usize {
        self.running.send_replace(false);
        let signalled = self.registry.close_all();
        info!(sessions = signalled, "Listener stopping");
        signalled
    }

    /// Wait until every session has released its slot, up to `deadline`.
    ///
    /// Returns `true` if the listener drained in time.
    pub async fn wait_idle(&self, deadline: Duration) -> bool {
        let permits = u32::try_from(self.max_connections).unwrap_or(u32::MAX);
        matches!(
            tokio::time::timeout(deadline, self.conn_semaphore.acquire_many(permits)).await,
            Ok(Ok(_))
        )
    }

    /// Run the accept loop until `stop()` is called.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        let mut running = self.running.subscribe();

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = stopped(&mut running) => break,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    let Some(registration) = self.registry.register(peer_addr) else {
                        debug!(peer_addr = %peer_addr, "Registry closed, dropping connection");
                        continue;
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "Failed to set TCP_NODELAY");
                    }

                    let span = tracing::info_span!(
                        "session",
                        id = %registration.id,
                        peer = %peer_addr
                    );
                    info!(parent: &span, "New connection");

                    let session = Session::new(
                        stream,
                        peer_addr,
                        registration,
                        Arc::clone(&self.session_config),
                        Arc::clone(&self.registry),
                    );

                    tokio::spawn(
                        async move {
                            session.run().await;
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        info!(bind_addr = %local_addr, "Listener stopped");
        Ok(())
    }
}

async fn stopped(running: &mut watch::Receiver<bool>) {
    let _ = running.wait_for(|running| !*running).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new("0.0.0.0:8098".parse().unwrap());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(!config.session.authenticator.is_enabled());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = first.local_addr().unwrap();

        let result = Listener::bind(ListenerConfig::new(taken), Arc::new(Registry::new())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bind_records_listening_port() {
        let registry = Arc::new(Registry::new());
        assert_eq!(registry.snapshot().listening_port, None);

        let listener = Listener::bind(
            ListenerConfig::new("127.0.0.1:0".parse().unwrap()),
            Arc::clone(&registry),
        )
        .await
        .unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(registry.snapshot().listening_port, Some(port));
    }

    #[tokio::test]
    async fn test_stop_ends_accept_loop() {
        let listener = Arc::new(
            Listener::bind(
                ListenerConfig::new("127.0.0.1:0".parse().unwrap()),
                Arc::new(Registry::new()),
            )
            .await
            .unwrap(),
        );
        let handle = tokio::spawn(Arc::clone(&listener).run());

        listener.stop();
        assert!(!listener.is_running());
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("accept loop should stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_max_connections_rejects_excess() {
        let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        config.max_connections = 1;
        let listener = Arc::new(Listener::bind(config, Arc::new(Registry::new())).await.unwrap());
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&listener).run());

        // Holds the only slot: no request sent yet.
        let _first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(1), second.read(&mut buf))
            .await
            .expect("rejected connection should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(listener.stats().connections_rejected.load(Ordering::Relaxed), 1);
        assert_eq!(listener.registry().active(), 1);

        listener.stop();
    }
}
