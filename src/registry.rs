//! Static service registry: logical service name to ordered backend addresses.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Identifies one backend of one service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BackendKey {
    pub service: String,
    pub address: String,
}

impl BackendKey {
    pub fn new(service: impl Into<String>, address: impl Into<String>) -> Self {
        Self { service: service.into(), address: address.into() }
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service, self.address)
    }
}

/// Immutable after construction. Registration order is preserved per service and
/// is the tie-break order for load balancing.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, Vec<String>>,
}

impl ServiceRegistry {
    /// Build from configuration. Blank and duplicate addresses are dropped with a warning.
    pub fn new(services: &BTreeMap<String, Vec<String>>) -> Self {
        let mut cleaned = BTreeMap::new();
        for (name, addresses) in services {
            let mut kept: Vec<String> = Vec::with_capacity(addresses.len());
            for address in addresses {
                let address = address.trim().trim_end_matches('/');
                if address.is_empty() {
                    warn!(target: "tollgate::registry", service = %name, "blank backend address skipped");
                    continue;
                }
                if kept.iter().any(|a| a == address) {
                    warn!(target: "tollgate::registry", service = %name, address, "duplicate backend address skipped");
                    continue;
                }
                kept.push(address.to_string());
            }
            cleaned.insert(name.clone(), kept);
        }
        Self { services: cleaned }
    }

    /// Backends of a service in registration order; empty if unknown.
    pub fn backends(&self, service: &str) -> &[String] {
        self.services.get(service).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Every registered backend, grouped by service in name order.
    pub fn keys(&self) -> impl Iterator<Item = BackendKey> + '_ {
        self.services.iter().flat_map(|(service, addresses)| {
            addresses.iter().map(move |address| BackendKey::new(service.clone(), address.clone()))
        })
    }

    pub fn backend_count(&self) -> usize {
        self.services.values().map(Vec::len).sum()
    }
}
