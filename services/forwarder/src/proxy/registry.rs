//! Registry of active listeners.
//!
//! The registry is the single owner of the `(address, port) -> listener`
//! map. Every mutation (listen, stop, update) runs under one async mutex,
//! held across the bind or close it performs, so mutations never interleave
//! and a replaced listener has released its socket before its successor
//! binds.
//!
//! Readers never take that lock. After each mutation the registry publishes
//! an immutable snapshot through `ArcSwap`, and lookups read the snapshot.
//! Established connections are not tracked here; stopping a listener leaves
//! them running.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use portway_reconcile::UpdateOutcome;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::listener::{ClientConfig, Listener, ListenerStats};
use super::transport::{Connector, TcpConnector, Target, DEFAULT_BACKLOG};
use crate::error::RegistryError;

/// Identifies one listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerKey {
    /// Bind address as given by the caller.
    pub address: String,
    /// Bind port.
    pub port: u16,
}

impl ListenerKey {
    /// Create a new key.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Read-only view of an active listener.
#[derive(Debug, Clone)]
pub struct ListenerInfo {
    /// Address and port the listener was registered under.
    pub key: ListenerKey,
    /// Upstream every accepted connection is forwarded to.
    pub target: Target,
    /// Tunables for accepted connections.
    pub config: ClientConfig,
    /// Address the socket actually bound (resolves port 0).
    pub local_addr: SocketAddr,
    pub stats: Arc<ListenerStats>,
}

/// Server-wide listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen backlog for every bound socket.
    pub backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// A live listener owned by the registry.
struct ListenerEntry {
    info: ListenerInfo,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ListenerEntry {
    /// Signal the accept loop and wait until the socket is released.
    async fn close(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            warn!(listener = %self.info.key, error = %e, "Listener task ended abnormally");
        }
    }
}

type Snapshot = HashMap<ListenerKey, ListenerInfo>;

/// Registry of active listeners.
pub struct ListenerRegistry {
    server: ServerConfig,
    connector: Arc<dyn Connector>,
    /// Live entries. Only touched while holding the lock.
    entries: Mutex<HashMap<ListenerKey, ListenerEntry>>,
    /// Published view of `entries` for lock-free reads.
    snapshot: ArcSwap<Snapshot>,
}

impl ListenerRegistry {
    /// Create a registry.
    pub fn new(server: ServerConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            server,
            connector,
            entries: Mutex::new(HashMap::new()),
            snapshot: ArcSwap::from_pointee(Snapshot::new()),
        }
    }

    /// Start listening on `address:port`, forwarding to `target`.
    ///
    /// Fails with `AlreadyListening` if the key is taken; the existing
    /// listener is left untouched.
    pub async fn listen(
        &self,
        address: &str,
        port: u16,
        target: Target,
        config: ClientConfig,
    ) -> Result<(), RegistryError> {
        let key = ListenerKey::new(address, port);
        let mut entries = self.entries.lock().await;

        if entries.contains_key(&key) {
            return Err(RegistryError::AlreadyListening {
                address: key.address,
                port,
            });
        }

        self.start_locked(&mut entries, key, target, config, false)
            .await
    }

    /// Stop the listener on `address:port`.
    ///
    /// Returns whether a listener was present.
    pub async fn stop_listening(&self, address: &str, port: u16) -> bool {
        let key = ListenerKey::new(address, port);
        let mut entries = self.entries.lock().await;
        self.stop_locked(&mut entries, &key).await
    }

    /// Make `address:port` forward to `target` with `config`.
    ///
    /// A listener with identical target and config is left alone. Anything
    /// else is stopped and rebound. If the rebind fails the key is left
    /// without a listener and the error reports it (`listener_lost`).
    pub async fn update(
        &self,
        address: &str,
        port: u16,
        target: Target,
        config: ClientConfig,
    ) -> Result<UpdateOutcome, RegistryError> {
        let key = ListenerKey::new(address, port);
        let mut entries = self.entries.lock().await;

        let outcome = match entries.get(&key) {
            Some(entry) if entry.info.target == target && entry.info.config == config => {
                debug!(listener = %key, "Listener unchanged");
                return Ok(UpdateOutcome::Unchanged);
            }
            Some(_) => UpdateOutcome::Replaced,
            None => UpdateOutcome::New,
        };

        let replaced = outcome == UpdateOutcome::Replaced;
        if replaced {
            self.stop_locked(&mut entries, &key).await;
        }
        if let Err(e) = self
            .start_locked(&mut entries, key.clone(), target, config, replaced)
            .await
        {
            if e.listener_lost() {
                warn!(listener = %key, error = %e, "Replacement bind failed; listener removed");
            }
            return Err(e);
        }

        Ok(outcome)
    }

    /// Stop every listener. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let drained: Vec<ListenerEntry> = entries.drain().map(|(_, entry)| entry).collect();
        self.publish(&entries);

        let count = drained.len();
        for entry in drained {
            entry.close().await;
        }

        info!(count, "All listeners stopped");
        count
    }

    /// Look up an active listener.
    pub fn get(&self, address: &str, port: u16) -> Option<ListenerInfo> {
        self.snapshot
            .load()
            .get(&ListenerKey::new(address, port))
            .cloned()
    }

    /// Ports with an active listener on `address`.
    pub fn ports(&self, address: &str) -> BTreeSet<u16> {
        self.snapshot
            .load()
            .keys()
            .filter(|key| key.address == address)
            .map(|key| key.port)
            .collect()
    }

    /// All active listener keys.
    pub fn keys(&self) -> Vec<ListenerKey> {
        let mut keys: Vec<_> = self.snapshot.load().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Bound address of the listener on `address:port`.
    pub fn local_addr(&self, address: &str, port: u16) -> Option<SocketAddr> {
        self.get(address, port).map(|info| info.local_addr)
    }

    /// Statistics of the listener on `address:port`.
    pub fn stats(&self, address: &str, port: u16) -> Option<Arc<ListenerStats>> {
        self.get(address, port).map(|info| info.stats)
    }

    /// Number of active listeners.
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    /// Check whether no listener is active.
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    async fn start_locked(
        &self,
        entries: &mut HashMap<ListenerKey, ListenerEntry>,
        key: ListenerKey,
        target: Target,
        config: ClientConfig,
        replaced: bool,
    ) -> Result<(), RegistryError> {
        let bind_error = |source| RegistryError::Bind {
            address: key.address.clone(),
            port: key.port,
            replaced,
            source,
        };

        let listener = Listener::bind(
            &key.address,
            key.port,
            self.server.backlog,
            target.clone(),
            config.clone(),
            Arc::clone(&self.connector),
        )
        .await
        .map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let info = ListenerInfo {
            key: key.clone(),
            target,
            config,
            local_addr,
            stats: listener.stats(),
        };

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(listener.run(shutdown_rx));

        info!(
            listener = %key,
            bind_addr = %local_addr,
            target = %info.target,
            "Listening"
        );

        entries.insert(
            key,
            ListenerEntry {
                info,
                shutdown,
                task,
            },
        );
        self.publish(entries);
        Ok(())
    }

    async fn stop_locked(
        &self,
        entries: &mut HashMap<ListenerKey, ListenerEntry>,
        key: &ListenerKey,
    ) -> bool {
        // Unpublish first so nothing new is attributed to this listener.
        let Some(entry) = entries.remove(key) else {
            debug!(listener = %key, "No listener to stop");
            return false;
        };
        self.publish(entries);

        entry.close().await;
        info!(listener = %key, "Stopped listening");
        true
    }

    fn publish(&self, entries: &HashMap<ListenerKey, ListenerEntry>) {
        let snapshot: Snapshot = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.info.clone()))
            .collect();
        self.snapshot.store(Arc::new(snapshot));
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new(ServerConfig::default(), Arc::new(TcpConnector::new()))
    }
}

/// Shared registry reference.
pub type SharedListenerRegistry = Arc<ListenerRegistry>;
