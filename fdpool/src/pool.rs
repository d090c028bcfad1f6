use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::conn::Connection;
use crate::node::SockType;
use crate::portmap::PortMap;
use crate::service::Service;
use crate::strategy::Strategy;

/// Defaults applied when a service is conjured up lazily (no static config,
/// only service discovery) by [`Pool::new_conn`].
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_FAIL_COST: u32 = 100;
pub const DEFAULT_TEMPFAIL_COST: u32 = 0;

/// Registry of named services, each balancing its own node set. One `Pool`
/// is normally shared (behind an `Arc`) by every part of a process that
/// needs outbound connections to internal backends.
pub struct Pool {
    services: RwLock<AHashMap<String, Arc<Service>>>,
    portmap: PortMap,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(AHashMap::new()),
            portmap: PortMap::default(),
        }
    }

    pub fn with_portmap(portmap: PortMap) -> Self {
        Self {
            services: RwLock::new(AHashMap::new()),
            portmap,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) {
        self.services.write().remove(name);
    }

    /// Registers a fully-specified service (static config path). Returns the
    /// existing service unchanged if one is already registered under `name`.
    #[allow(clippy::too_many_arguments)]
    pub fn get_or_create(
        &self,
        name: &str,
        socktype: SockType,
        retries: u32,
        failcost: u32,
        softfailcost: u32,
        strategy: Strategy,
        timeout_ms: u64,
    ) -> Arc<Service> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let mut services = self.services.write();
        services
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Service::new(
                    name.to_string(),
                    socktype,
                    retries,
                    failcost,
                    softfailcost,
                    strategy,
                    timeout_ms,
                ))
            })
            .clone()
    }

    /// Opens a new logical connection handle against `service`. If the
    /// service isn't registered yet, a random-pick service with default
    /// costs and timeout is conjured up on the spot -- the intended path for
    /// services whose node set only ever arrives via service discovery.
    pub fn new_conn(&self, service: &str, port_key: &str, remote_addr: Option<&str>) -> Connection {
        let resolved_key = self.portmap.lookup(port_key).to_string();
        let svc = self.get_or_create(
            service,
            SockType::Stream,
            1,
            DEFAULT_FAIL_COST,
            DEFAULT_TEMPFAIL_COST,
            Strategy::RandomCycle,
            DEFAULT_TIMEOUT_MS,
        );
        Connection::new(svc, &resolved_key, remote_addr)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent() {
        let pool = Pool::new();
        let a = pool.get_or_create("svc", SockType::Stream, 1, 100, 0, Strategy::Sequential, 5000);
        let b = pool.get_or_create("svc", SockType::Dgram, 9, 1, 1, Strategy::RandomCycle, 9999);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.socktype, SockType::Stream); // first registration wins
    }

    #[test]
    fn new_conn_resolves_port_key_through_portmap() {
        let pool = Pool::new();
        let conn = pool.new_conn("svc", "80", None);
        assert_eq!(conn.socktype(), SockType::Stream);
        // "80" maps to "http_port" by default; service gets conjured lazily.
        assert!(pool.get("svc").is_some());
    }
}
