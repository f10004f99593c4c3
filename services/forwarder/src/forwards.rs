//! Forward table: which ports to listen on and where each one forwards.
//!
//! The table is read either from a TOML file or from an inline list.
//!
//! ```toml
//! bind_address = "0.0.0.0"
//!
//! [defaults]
//! max_messages_per_read = 16
//!
//! [[forward]]
//! port = 4321
//! target = "example.com:443"
//!
//! [[forward]]
//! port = 1234
//! target = "internal:80"
//! logger = "internal"
//! ```
//!
//! Inline form: `4321=example.com:443,1234=internal:80,8080`.
//!
//! A forward without a target goes to the same port on
//! [`DEFAULT_TARGET_HOST`].

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use portway_reconcile::Fingerprint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proxy::{ClientConfig, InvalidTarget, Target};

/// Upstream host for forwards that do not name a target.
pub const DEFAULT_TARGET_HOST: &str = "127.0.0.1";

/// Errors loading a forward table.
#[derive(Debug, Error)]
pub enum TableError {
    /// The file could not be read.
    #[error("failed to read forward table {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The document is not valid TOML for a forward table.
    #[error("invalid forward table: {0}")]
    Parse(#[from] toml::de::Error),

    /// An inline entry is malformed.
    #[error("invalid forward entry {0:?}: expected port[=host:port]")]
    InvalidEntry(String),

    /// Port 0 cannot be forwarded.
    #[error("invalid port 0 in forward table")]
    InvalidPort,

    /// The same port appears twice.
    #[error("port {0} is forwarded more than once")]
    DuplicatePort(u16),

    /// A target is not of the form host:port.
    #[error("port {port}: {source}")]
    InvalidTarget {
        port: u16,
        #[source]
        source: InvalidTarget,
    },
}

impl TableError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            TableError::Read { .. } => "table_read_failed",
            TableError::Parse(_) => "table_parse_failed",
            TableError::InvalidEntry(_) => "invalid_entry",
            TableError::InvalidPort => "invalid_port",
            TableError::DuplicatePort(_) => "duplicate_port",
            TableError::InvalidTarget { .. } => "invalid_target",
        }
    }
}

/// Optional client tunables, layered over a base [`ClientConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tunables {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_messages_per_read: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending_bytes: Option<usize>,
}

impl Tunables {
    /// Apply the set fields on top of `base`.
    pub fn apply(&self, base: &ClientConfig) -> ClientConfig {
        ClientConfig {
            max_messages_per_read: self
                .max_messages_per_read
                .unwrap_or(base.max_messages_per_read),
            logger: self.logger.clone().unwrap_or_else(|| base.logger.clone()),
            max_connections: self.max_connections.unwrap_or(base.max_connections),
            max_pending_bytes: self.max_pending_bytes.unwrap_or(base.max_pending_bytes),
        }
    }
}

/// On-disk shape of the table.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TableDocument {
    #[serde(default)]
    bind_address: Option<String>,
    #[serde(default)]
    defaults: Tunables,
    #[serde(default, rename = "forward")]
    forwards: Vec<ForwardDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ForwardDocument {
    port: u16,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    max_messages_per_read: Option<u32>,
    #[serde(default)]
    logger: Option<String>,
    #[serde(default)]
    max_connections: Option<usize>,
    #[serde(default)]
    max_pending_bytes: Option<usize>,
}

/// A single validated forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub target: Target,
    pub overrides: Tunables,
}

/// A validated forward table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardTable {
    bind_address: Option<String>,
    defaults: Tunables,
    forwards: BTreeMap<u16, Forward>,
}

impl ForwardTable {
    /// Load a table from a TOML file.
    pub fn load(path: &Path) -> Result<Self, TableError> {
        let content = fs::read_to_string(path).map_err(|source| TableError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse a table from a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, TableError> {
        let document: TableDocument = toml::from_str(content)?;

        let mut table = Self {
            bind_address: document.bind_address,
            defaults: document.defaults,
            forwards: BTreeMap::new(),
        };

        for entry in document.forwards {
            let overrides = Tunables {
                max_messages_per_read: entry.max_messages_per_read,
                logger: entry.logger,
                max_connections: entry.max_connections,
                max_pending_bytes: entry.max_pending_bytes,
            };
            table.insert(entry.port, entry.target.as_deref(), overrides)?;
        }

        Ok(table)
    }

    /// Parse an inline table: `port[=host:port]` entries separated by commas.
    pub fn from_inline(list: &str) -> Result<Self, TableError> {
        let mut table = Self::default();

        for raw in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (port, target) = match raw.split_once('=') {
                Some((port, target)) => (port.trim(), Some(target.trim())),
                None => (raw, None),
            };
            let port: u16 = port
                .parse()
                .map_err(|_| TableError::InvalidEntry(raw.to_string()))?;
            table.insert(port, target, Tunables::default())?;
        }

        Ok(table)
    }

    fn insert(
        &mut self,
        port: u16,
        target: Option<&str>,
        overrides: Tunables,
    ) -> Result<(), TableError> {
        if port == 0 {
            return Err(TableError::InvalidPort);
        }
        if self.forwards.contains_key(&port) {
            return Err(TableError::DuplicatePort(port));
        }

        let target = match target {
            Some(raw) => raw
                .parse()
                .map_err(|source| TableError::InvalidTarget { port, source })?,
            None => Target::new(DEFAULT_TARGET_HOST, port),
        };

        self.forwards.insert(port, Forward { target, overrides });
        Ok(())
    }

    /// Bind address named by the table, if any.
    pub fn bind_address(&self) -> Option<&str> {
        self.bind_address.as_deref()
    }

    /// Ports to listen on.
    pub fn ports(&self) -> BTreeSet<u16> {
        self.forwards.keys().copied().collect()
    }

    /// Number of forwards.
    pub fn len(&self) -> usize {
        self.forwards.len()
    }

    /// Check whether the table forwards nothing.
    pub fn is_empty(&self) -> bool {
        self.forwards.is_empty()
    }

    /// Look up the forward for `port`.
    pub fn get(&self, port: u16) -> Option<&Forward> {
        self.forwards.get(&port)
    }

    /// Upstream target for `port`.
    pub fn target(&self, port: u16) -> Target {
        self.forwards
            .get(&port)
            .map(|forward| forward.target.clone())
            .unwrap_or_else(|| Target::new(DEFAULT_TARGET_HOST, port))
    }

    /// Effective client config for `port`: base, then table defaults, then
    /// the forward's own overrides.
    pub fn client_config(&self, port: u16, base: &ClientConfig) -> ClientConfig {
        let config = self.defaults.apply(base);
        match self.forwards.get(&port) {
            Some(forward) => forward.overrides.apply(&config),
            None => config,
        }
    }

    /// Canonical fingerprint of the table's effective content.
    ///
    /// Formatting, comments and entry order do not affect it.
    pub fn fingerprint(&self) -> Fingerprint {
        let forwards: Vec<serde_json::Value> = self
            .forwards
            .iter()
            .map(|(port, forward)| {
                serde_json::json!({
                    "port": port,
                    "target": forward.target.to_string(),
                    "overrides": forward.overrides,
                })
            })
            .collect();

        Fingerprint::from_json(&serde_json::json!({
            "bind_address": self.bind_address,
            "defaults": self.defaults,
            "forwards": forwards,
        }))
    }
}
