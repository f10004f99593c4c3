//! Raw TCP forwarding.
//!
//! This module provides:
//! - Listener registry keyed by (address, port)
//! - Port-set reconciliation for hot reconfiguration
//! - Per-connection sessions that buffer until upstream connects
//! - The bidirectional relay (pipe) between client and upstream
//!
//! ## Architecture
//!
//! ```text
//! Reconciler -> Registry -> Listener -> Session --(connect)--> Upstream
//!                                          |
//!                                          +-- glue --> Pipe (client <-> upstream)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{ClientConfig, ListenerRegistry, Target};
//!
//! let registry = ListenerRegistry::default();
//! registry
//!     .listen("0.0.0.0", 4321, Target::new("example.com", 443), ClientConfig::default())
//!     .await?;
//! ```

mod listener;
mod pipe;
mod reconciler;
mod registry;
mod session;
mod transport;

pub use listener::{
    ClientConfig, Listener, ListenerStats, DEFAULT_LOGGER, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_MESSAGES_PER_READ, DEFAULT_MAX_PENDING_BYTES,
};
pub use pipe::{Pipe, PipeStats, Side, RELAY_BUFFER_SIZE};
pub use reconciler::ConfigMapper;
pub use registry::{
    ListenerInfo, ListenerKey, ListenerRegistry, ServerConfig, SharedListenerRegistry,
};
pub use session::{
    run_session, ConnectResolution, Inbound, Session, SessionLimits, SessionState,
};
pub use transport::{
    bind_listener, BoxConnection, Connection, Connector, InvalidTarget, Target, TcpConnector,
    DEFAULT_BACKLOG, DEFAULT_BIND_ADDRESS,
};
