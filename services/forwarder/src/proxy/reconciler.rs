//! Bulk listener operations and port-set reconciliation.
//!
//! `apply_port_set` converges the listeners on one address to exactly a
//! desired set of ports: every desired port is updated first, then every
//! listener on that address outside the set is stopped. Running it twice
//! with the same inputs changes nothing the second time.

use std::collections::BTreeSet;

use portway_reconcile::{stale_ports, PortSetReport};
use tracing::info;

use super::listener::ClientConfig;
use super::registry::ListenerRegistry;
use super::transport::Target;
use crate::error::RegistryError;

/// Per-port override of the base client configuration.
pub type ConfigMapper<'a> = &'a (dyn Fn(u16, &ClientConfig) -> ClientConfig + Send + Sync);

impl ListenerRegistry {
    /// Update every port in `ports` on `address`.
    ///
    /// Listeners on ports not named are left alone. Stops at the first
    /// failing port; ports before it keep their new state.
    pub async fn update_ports<P, R>(
        &self,
        address: &str,
        ports: P,
        resolve_target: R,
        config: &ClientConfig,
        mapper: Option<ConfigMapper<'_>>,
    ) -> Result<PortSetReport, RegistryError>
    where
        P: IntoIterator<Item = u16>,
        R: Fn(u16) -> Target,
    {
        let ports: BTreeSet<u16> = ports.into_iter().collect();
        let mut report = PortSetReport::new();

        for port in ports {
            let target = resolve_target(port);
            let effective = match mapper {
                Some(map) => map(port, config),
                None => config.clone(),
            };

            let outcome = self.update(address, port, target, effective).await?;
            report.record(port, outcome)?;
        }

        Ok(report)
    }

    /// Stop the listeners on `ports` at `address`.
    ///
    /// Returns the ports that actually had a listener.
    pub async fn stop_listening_ports<P>(&self, address: &str, ports: P) -> BTreeSet<u16>
    where
        P: IntoIterator<Item = u16>,
    {
        let mut stopped = BTreeSet::new();
        for port in ports {
            if self.stop_listening(address, port).await {
                stopped.insert(port);
            }
        }
        stopped
    }

    /// Make the listeners on `address` exactly `desired_ports`.
    pub async fn apply_port_set<P, R>(
        &self,
        address: &str,
        desired_ports: P,
        resolve_target: R,
        config: &ClientConfig,
        mapper: Option<ConfigMapper<'_>>,
    ) -> Result<PortSetReport, RegistryError>
    where
        P: IntoIterator<Item = u16>,
        R: Fn(u16) -> Target,
    {
        let desired: BTreeSet<u16> = desired_ports.into_iter().collect();

        let mut report = self
            .update_ports(address, desired.iter().copied(), resolve_target, config, mapper)
            .await?;

        // Removals are computed only after every desired port is in place.
        let stale = stale_ports(self.ports(address), desired.iter().copied());
        for port in self.stop_listening_ports(address, stale).await {
            report.record_removed(port)?;
        }

        info!(
            address,
            new = ?report.new,
            replaced = ?report.replaced,
            removed = ?report.removed,
            unchanged = report.unchanged.len(),
            "Port set applied"
        );

        Ok(report)
    }
}
