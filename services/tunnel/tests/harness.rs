//! Test harness for tunnel integration tests.
//!
//! Provides helpers to spawn TCP backends and tunnel listeners, and to drive
//! the client side of the handshake.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use sshws_tunnel::proxy::SWITCHING_PROTOCOLS_RESPONSE;
use sshws_tunnel::{Listener, ListenerConfig, Registry, SessionConfig};

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    /// Accepted streams that have seen EOF or an error.
    pub closed: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);
        let closed_clone = Arc::clone(&closed);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                let closed = Arc::clone(&closed_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                    closed.fetch_add(1, Ordering::Relaxed);
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            closed,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn closed_count(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    /// Wait until `expected` accepted streams have been closed by the tunnel.
    pub async fn wait_closed(&self, expected: u64, deadline: Duration) -> bool {
        let poll = async {
            while self.closed_count() < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(deadline, poll).await.is_ok()
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Accepts connections and counts them without ever reading.
#[allow(dead_code)]
pub struct CountingBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl CountingBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let conn_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                held.push(stream);
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for CountingBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[allow(dead_code)]
pub struct TunnelHandle {
    pub listen_addr: SocketAddr,
    pub listener: Arc<Listener>,
    pub registry: Arc<Registry>,
}

#[allow(dead_code)]
impl TunnelHandle {
    /// Spawn a tunnel on an ephemeral loopback port with default settings.
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_with(|_| {}).await
    }

    /// Spawn a tunnel after letting the caller adjust its session settings.
    pub async fn spawn_with(configure: impl FnOnce(&mut SessionConfig)) -> io::Result<Self> {
        let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        configure(&mut config.session);

        let registry = Arc::new(Registry::new());
        let listener = Listener::bind(config, Arc::clone(&registry)).await?;
        let listen_addr = listener.local_addr()?;
        let listener = Arc::new(listener);

        let runner = Arc::clone(&listener);
        tokio::spawn(async move {
            let _ = runner.run().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(Self {
            listen_addr,
            listener,
            registry,
        })
    }

    /// Wait until no session is registered, up to `deadline`.
    pub async fn wait_drained(&self, deadline: Duration) -> bool {
        let poll = async {
            while self.registry.active() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(deadline, poll).await.is_ok()
    }
}

/// Open a client connection and send `head`.
#[allow(dead_code)]
pub async fn send_request(addr: SocketAddr, head: &str) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;
    Ok(stream)
}

/// Read until EOF (or `deadline`) and return what arrived.
#[allow(dead_code)]
pub async fn read_to_close(stream: &mut TcpStream, deadline: Duration) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = tokio::time::timeout(deadline, stream.read_to_end(&mut out)).await;
    out
}

/// Read exactly the upgrade response and check it.
#[allow(dead_code)]
pub async fn expect_upgrade(stream: &mut TcpStream) -> io::Result<()> {
    let mut buf = vec![0u8; SWITCHING_PROTOCOLS_RESPONSE.len()];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no upgrade response"))??;
    if buf != SWITCHING_PROTOCOLS_RESPONSE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected response: {:?}", String::from_utf8_lossy(&buf)),
        ));
    }
    Ok(())
}

/// A loopback port with nothing listening on it.
#[allow(dead_code)]
pub async fn dead_port() -> u16 {
    let temp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = temp_listener.local_addr().unwrap().port();
    drop(temp_listener);
    port
}
