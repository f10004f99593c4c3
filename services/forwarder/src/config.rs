//! Forwarder configuration (env-driven).

use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};

use crate::forwards::ForwardTable;
use crate::proxy::{
    ClientConfig, DEFAULT_BACKLOG, DEFAULT_BIND_ADDRESS, DEFAULT_LOGGER, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_MESSAGES_PER_READ, DEFAULT_MAX_PENDING_BYTES,
};

/// Where the forward table comes from.
#[derive(Debug, Clone)]
pub enum ForwardSource {
    /// TOML file, polled for changes.
    File(PathBuf),
    /// Inline table, applied once.
    Inline(ForwardTable),
}

/// Forwarder configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Runtime worker threads.
    pub workers: usize,

    /// Listen backlog for every listener.
    pub backlog: u32,

    /// Address listeners bind to unless the table names one.
    pub bind_address: String,

    /// Forward table source.
    pub forwards: ForwardSource,

    /// How often the forward table file is checked.
    pub reload_interval: Duration,

    /// Upstream connect timeout. None waits for the OS.
    pub connect_timeout: Option<Duration>,

    /// Base tunables for every listener.
    pub client: ClientConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("PORTWAY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let workers: usize = parse_var("PORTWAY_WORKERS", "an integer")?
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1);

        let backlog: u32 =
            parse_var("PORTWAY_BACKLOG", "an integer")?.unwrap_or(DEFAULT_BACKLOG);

        let bind_address = std::env::var("PORTWAY_BIND_ADDRESS")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());

        let forwards = match (
            std::env::var("PORTWAY_FORWARDS_FILE").ok(),
            std::env::var("PORTWAY_FORWARDS").ok(),
        ) {
            (Some(path), _) => ForwardSource::File(PathBuf::from(path)),
            (None, Some(inline)) => ForwardSource::Inline(
                ForwardTable::from_inline(&inline).context("PORTWAY_FORWARDS is invalid.")?,
            ),
            (None, None) => bail!("No forwards configured. Set PORTWAY_FORWARDS_FILE or PORTWAY_FORWARDS."),
        };

        let reload_interval_ms: u64 =
            parse_var("PORTWAY_RELOAD_INTERVAL_MS", "an integer (milliseconds)")?.unwrap_or(1000);
        let reload_interval = Duration::from_millis(reload_interval_ms.max(50));

        let connect_timeout =
            parse_var::<u64>("PORTWAY_CONNECT_TIMEOUT_MS", "an integer (milliseconds)")?
                .map(Duration::from_millis);

        let client = ClientConfig {
            max_messages_per_read: parse_var("PORTWAY_MAX_MESSAGES_PER_READ", "an integer")?
                .unwrap_or(DEFAULT_MAX_MESSAGES_PER_READ)
                .max(1),
            logger: DEFAULT_LOGGER.to_string(),
            max_connections: parse_var("PORTWAY_MAX_CONNECTIONS", "an integer")?
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            max_pending_bytes: parse_var("PORTWAY_MAX_PENDING_BYTES", "an integer (bytes)")?
                .unwrap_or(DEFAULT_MAX_PENDING_BYTES),
        };

        Ok(Self {
            log_level,
            workers,
            backlog,
            bind_address,
            forwards,
            reload_interval,
            connect_timeout,
            client,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, expected: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(name)
        .ok()
        .map(|v| v.parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be {expected}."))
}
