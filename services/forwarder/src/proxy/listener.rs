//! TCP listener and connection handling.
//!
//! A listener owns one bound socket and forwards every accepted connection
//! to a single upstream target. Each connection runs as its own task, so
//! stopping the listener closes the socket without touching connections that
//! were already accepted.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::pipe::PipeStats;
use super::session::{run_session, SessionLimits};
use super::transport::{bind_listener, Connector, Target};
use crate::error::ForwardError;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default number of relay reads serviced before a connection yields.
pub const DEFAULT_MAX_MESSAGES_PER_READ: u32 = 16;

/// Default cap on bytes held per connection while the upstream connects.
pub const DEFAULT_MAX_PENDING_BYTES: usize = 64 * 1024;

/// Default logger identity for connections.
pub const DEFAULT_LOGGER: &str = "portway";

/// Tunables applied to every connection accepted on a listener.
///
/// Compared by value: two configs with the same fields are the same config.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientConfig {
    /// Relay reads serviced per connection before yielding the worker.
    pub max_messages_per_read: u32,
    /// Logger identity attached to connection spans.
    pub logger: String,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Bytes buffered per connection before the upstream connects. Inbound
    /// reads pause at this size.
    pub max_pending_bytes: usize,
}

impl ClientConfig {
    /// Create a client configuration with the given logger identity.
    pub fn new(logger: impl Into<String>) -> Self {
        Self {
            logger: logger.into(),
            ..Self::default()
        }
    }

    /// Limits handed to each session accepted under this config.
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_messages_per_read: self.max_messages_per_read,
            max_pending_bytes: self.max_pending_bytes,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_messages_per_read: DEFAULT_MAX_MESSAGES_PER_READ,
            logger: DEFAULT_LOGGER.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Upstream connect successes.
    pub upstream_connected: AtomicU64,
    /// Upstream connect failures.
    pub upstream_failed: AtomicU64,
    /// Relay installation failures.
    pub glue_failed: AtomicU64,
    /// Bytes relayed to upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed from upstream.
    pub bytes_from_upstream: AtomicU64,
}

impl ListenerStats {
    fn record_pipe(&self, pipe: &PipeStats) {
        self.upstream_connected.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_upstream
            .fetch_add(pipe.to_upstream, Ordering::Relaxed);
        self.bytes_from_upstream
            .fetch_add(pipe.to_inbound, Ordering::Relaxed);
    }

    fn record_failure(&self, error: &ForwardError) {
        match error {
            ForwardError::Connect { .. } => {
                self.upstream_failed.fetch_add(1, Ordering::Relaxed);
            }
            ForwardError::Glue(_) => {
                self.upstream_connected.fetch_add(1, Ordering::Relaxed);
                self.glue_failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// A bound TCP listener forwarding to one target.
pub struct Listener {
    /// The TCP listener.
    listener: TcpListener,
    /// Upstream target.
    target: Target,
    /// Per-connection tunables.
    config: ClientConfig,
    /// Opens upstream connections.
    connector: Arc<dyn Connector>,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a new listener.
    pub async fn bind(
        address: &str,
        port: u16,
        backlog: u32,
        target: Target,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> io::Result<Self> {
        let listener = bind_listener(address, port, backlog).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            target = %target,
            logger = %config.logger,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            target,
            config,
            connector,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `shutdown` fires (or its sender is dropped).
    ///
    /// The socket is closed when this returns.
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let local_addr = self.listener.local_addr().ok();
        debug!(bind_addr = ?local_addr, "Listener started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(bind_addr = ?local_addr, "Listener stopped");
                    return;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.spawn_connection(stream, peer_addr),
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        // Brief sleep to avoid tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let permit = match self.conn_semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                return;
            }
        };

        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats
            .connections_active
            .fetch_add(1, Ordering::Relaxed);

        let target = self.target.clone();
        let connector = Arc::clone(&self.connector);
        let stats = Arc::clone(&self.stats);
        let limits = self.config.session_limits();
        let span = tracing::info_span!(
            "connection",
            listener = %self.config.logger,
            peer = %peer_addr,
            target = %self.target,
        );

        tokio::spawn(
            async move {
                match run_session(stream, target, connector, limits).await {
                    Ok(pipe) => {
                        stats.record_pipe(&pipe);
                        debug!(
                            bytes_to_upstream = pipe.to_upstream,
                            bytes_from_upstream = pipe.to_inbound,
                            closed_by = %pipe.closed_by,
                            errored = pipe.errored,
                            "Connection closed"
                        );
                    }
                    Err(e) => {
                        stats.record_failure(&e);
                        debug!(reason = e.reason_code(), error = %e, "Connection failed");
                    }
                }

                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                drop(permit);
            }
            .instrument(span),
        );
    }
}
