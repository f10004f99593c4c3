//! Forward table hot reload.
//!
//! The reloader applies a [`ForwardTable`] to the registry whenever its
//! fingerprint differs from the last applied one. A table that fails to load
//! or apply leaves the last good revision in place and is retried on the
//! next poll.

use std::path::Path;
use std::time::Duration;

use portway_reconcile::{PortSetReport, Revision};
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::forwards::ForwardTable;
use crate::proxy::{ClientConfig, SharedListenerRegistry};

/// Applies forward tables to a listener registry.
pub struct Reloader {
    registry: SharedListenerRegistry,
    /// Address used when the table does not name one.
    default_address: String,
    /// Base client config the table layers over.
    base: ClientConfig,
    revision: Revision,
    /// Address of the last applied table.
    applied_address: Option<String>,
}

impl Reloader {
    /// Create a reloader with no applied revision.
    pub fn new(
        registry: SharedListenerRegistry,
        default_address: impl Into<String>,
        base: ClientConfig,
    ) -> Self {
        Self {
            registry,
            default_address: default_address.into(),
            base,
            revision: Revision::new(),
            applied_address: None,
        }
    }

    /// The last successfully applied revision.
    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    /// Apply `table` unless it is already the current revision.
    ///
    /// Returns `None` when nothing changed.
    pub async fn apply(
        &mut self,
        table: &ForwardTable,
    ) -> Result<Option<PortSetReport>, RegistryError> {
        let fingerprint = table.fingerprint();
        if self.revision.is_current(&fingerprint) {
            debug!(fingerprint = %fingerprint, "Forward table unchanged");
            return Ok(None);
        }

        let address = table
            .bind_address()
            .unwrap_or(&self.default_address)
            .to_string();

        // Moving to a new address drops everything on the old one.
        if let Some(previous) = self.applied_address.as_deref() {
            if previous != address {
                let ports = self.registry.ports(previous);
                let stopped = self.registry.stop_listening_ports(previous, ports).await;
                info!(
                    from = previous,
                    to = %address,
                    stopped = stopped.len(),
                    "Bind address changed"
                );
            }
        }

        let mapper = |port: u16, base: &ClientConfig| table.client_config(port, base);
        let report = self
            .registry
            .apply_port_set(
                &address,
                table.ports(),
                |port| table.target(port),
                &self.base,
                Some(&mapper),
            )
            .await?;

        self.applied_address = Some(address);
        self.revision.advance(fingerprint);

        info!(
            generation = self.revision.generation,
            fingerprint = ?self.revision.fingerprint.as_ref().map(|f| f.as_str()),
            changed = report.changed_count(),
            "Forward table applied"
        );

        Ok(Some(report))
    }

    /// Poll `path` every `interval` and apply changes until cancelled.
    pub async fn watch(&mut self, path: &Path, interval: Duration) {
        info!(
            path = %path.display(),
            interval_ms = interval.as_millis() as u64,
            "Watching forward table"
        );

        loop {
            tokio::time::sleep(interval).await;
            self.poll(path).await;
        }
    }

    /// Load `path` once and apply it if it changed.
    pub async fn poll(&mut self, path: &Path) {
        let table = match ForwardTable::load(path) {
            Ok(table) => table,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    reason = e.reason_code(),
                    error = %e,
                    "Failed to load forward table; keeping last applied"
                );
                return;
            }
        };

        if let Err(e) = self.apply(&table).await {
            warn!(
                path = %path.display(),
                reason = e.reason_code(),
                error = %e,
                "Failed to apply forward table; will retry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ListenerRegistry;
    use std::collections::BTreeSet;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    const LOCALHOST: &str = "127.0.0.1";

    fn free_ports(n: usize) -> Vec<u16> {
        let held: Vec<_> = (0..n)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        held.iter().map(|l| l.local_addr().unwrap().port()).collect()
    }

    fn inline(ports: &[u16]) -> ForwardTable {
        let list: Vec<String> = ports.iter().map(|p| format!("{p}=internal:80")).collect();
        ForwardTable::from_inline(&list.join(",")).unwrap()
    }

    fn reloader() -> (SharedListenerRegistry, Reloader) {
        let registry = Arc::new(ListenerRegistry::default());
        let reloader = Reloader::new(Arc::clone(&registry), LOCALHOST, ClientConfig::default());
        (registry, reloader)
    }

    #[tokio::test]
    async fn test_apply_advances_revision_once() {
        let (registry, mut reloader) = reloader();
        let ports = free_ports(2);
        let table = inline(&ports);

        let report = reloader.apply(&table).await.unwrap().unwrap();
        assert_eq!(report.new.len(), 2);
        assert_eq!(reloader.revision().generation, 1);

        assert!(reloader.apply(&table).await.unwrap().is_none());
        assert_eq!(reloader.revision().generation, 1);

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_failed_apply_keeps_revision() {
        let (registry, mut reloader) = reloader();
        let ports = free_ports(1);
        reloader.apply(&inline(&ports)).await.unwrap();

        // Occupy a port so the next table cannot bind it.
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let err = reloader.apply(&inline(&[ports[0], taken])).await.unwrap_err();
        assert_eq!(err.reason_code(), "bind_failed");
        assert_eq!(reloader.revision().generation, 1);
        // Nothing is removed on a failed pass.
        assert!(registry.ports(LOCALHOST).contains(&ports[0]));

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_bind_address_change_moves_listeners() {
        let (registry, mut reloader) = reloader();
        let port = free_ports(1)[0];

        reloader.apply(&inline(&[port])).await.unwrap();
        assert_eq!(registry.ports(LOCALHOST), BTreeSet::from([port]));

        let moved = ForwardTable::from_toml(&format!(
            "bind_address = \"0.0.0.0\"\n[[forward]]\nport = {port}\ntarget = \"internal:80\"\n"
        ))
        .unwrap();
        reloader.apply(&moved).await.unwrap();

        assert!(registry.ports(LOCALHOST).is_empty());
        assert_eq!(registry.ports("0.0.0.0"), BTreeSet::from([port]));

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_poll_ignores_invalid_file() {
        let (registry, mut reloader) = reloader();
        let port = free_ports(1)[0];

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[[forward]]\nport = {port}\ntarget = \"internal:80\"\n").unwrap();
        reloader.poll(file.path()).await;
        assert_eq!(reloader.revision().generation, 1);

        let mut broken = NamedTempFile::new().unwrap();
        write!(broken, "[[forward]]\nport = \"not a port\"\n").unwrap();
        reloader.poll(broken.path()).await;

        assert_eq!(reloader.revision().generation, 1);
        assert_eq!(registry.ports(LOCALHOST), BTreeSet::from([port]));

        registry.stop_all().await;
    }
}
