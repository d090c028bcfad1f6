use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::FdPoolError;
use crate::node::{PooledFd, ServiceNode, SockType};
use crate::strategy::{ConnCursor, ConnStatus, Strategy, WeightTable};

/// Snapshot of one port for the `/stats` debug surface, mirroring the
/// original's port iterator.
pub struct PortInfo {
    pub node_key: Option<String>,
    pub peer: String,
    pub port_key: String,
    pub socktype: SockType,
    pub idle_count: usize,
}

struct Inner {
    nodes: Vec<ServiceNode>,
    table: WeightTable,
}

/// A named backend: a weighted, hot-swappable node set plus the connect
/// defaults (socket type, timeout) every connection against it shares.
///
/// `nodes` and `table` are swapped together under one lock by
/// [`Service::update_hosts`] and bump `generation`, so in-flight
/// [`crate::conn::Connection`]s notice and restart their iteration rather
/// than dereference a node that's since been dropped.
pub struct Service {
    pub name: String,
    pub socktype: SockType,
    pub timeout_ms: u64,
    pub cycle_last: std::sync::atomic::AtomicBool,
    generation: AtomicU64,
    inner: RwLock<Inner>,
}

impl Service {
    pub fn new(
        name: String,
        socktype: SockType,
        retries: u32,
        failcost: u32,
        softfailcost: u32,
        strategy: Strategy,
        timeout_ms: u64,
    ) -> Self {
        let timeout_ms = if timeout_ms != 0 && timeout_ms < 1000 {
            log::info!("fdpool: ignoring timeout {timeout_ms}ms < 1000 for service {name}");
            0
        } else {
            timeout_ms
        };
        Self {
            name,
            socktype,
            timeout_ms: if timeout_ms == 0 { 5000 } else { timeout_ms },
            cycle_last: std::sync::atomic::AtomicBool::new(false),
            generation: AtomicU64::new(1),
            inner: RwLock::new(Inner {
                nodes: Vec::new(),
                table: WeightTable::new(&[], retries, failcost, softfailcost, strategy),
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn retries(&self) -> u32 {
        self.inner.read().table.retries
    }

    /// Updates the balancing parameters in place, without touching the node
    /// set. Picked up immediately by in-flight cursors, and preserved across
    /// the next [`Service::update_hosts`] since that rebuilds the table from
    /// whatever is currently stored here.
    pub fn set_config(&self, retries: u32, failcost: u32, softfailcost: u32) {
        let mut inner = self.inner.write();
        inner.table.retries = retries;
        inner.table.failcost = failcost;
        inner.table.softfailcost = softfailcost;
    }

    /// Atomically replaces the node set, rebuilding the weight table from
    /// each node's configured cost. Returns the number of nodes installed,
    /// or an error if `nodes` is empty (in which case nothing changes).
    pub fn update_hosts(&self, nodes: Vec<ServiceNode>) -> Result<usize, FdPoolError> {
        if nodes.is_empty() {
            return Err(FdPoolError::EmptyConfig);
        }
        let costs: Vec<u32> = nodes.iter().map(|n| n.node.cost).collect();
        let n = nodes.len();

        let mut inner = self.inner.write();
        let table = WeightTable::new(
            &costs,
            inner.table.retries,
            inner.table.failcost,
            inner.table.softfailcost,
            inner.table.strategy,
        );
        inner.nodes = nodes;
        inner.table = table;
        drop(inner);

        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(n)
    }

    pub(crate) fn new_cursor(&self, hash: u32) -> ConnCursor {
        let inner = self.inner.read();
        inner.table.new_conn(hash)
    }

    pub(crate) fn advance_cursor(&self, cursor: &mut ConnCursor, status: ConnStatus) -> Option<usize> {
        let mut inner = self.inner.write();
        cursor.next(&mut inner.table, status)
    }

    pub(crate) fn mark_cursor_done(&self, cursor: &ConnCursor) {
        let mut inner = self.inner.write();
        cursor.done(&mut inner.table);
    }

    pub(crate) fn node_key(&self, idx: usize) -> Option<String> {
        self.inner.read().nodes.get(idx).and_then(|n| n.key.clone())
    }

    pub(crate) fn find_untried_port(
        &self,
        node_idx: usize,
        port_key: &str,
        tried: &HashSet<usize>,
    ) -> Option<usize> {
        let inner = self.inner.read();
        let node = &inner.nodes.get(node_idx)?.node;
        node.ports
            .iter()
            .enumerate()
            .find(|(i, p)| p.port_key == port_key && !tried.contains(i))
            .map(|(i, _)| i)
    }

    pub(crate) fn with_port<R>(&self, node_idx: usize, port_idx: usize, f: impl FnOnce(&crate::node::Port) -> R) -> R {
        let inner = self.inner.read();
        let port = &inner.nodes[node_idx].node.ports[port_idx];
        f(port)
    }

    pub(crate) fn put_idle(&self, node_idx: usize, port_idx: usize, fd: PooledFd) {
        let inner = self.inner.read();
        if let Some(sn) = inner.nodes.get(node_idx) {
            if let Some(port) = sn.node.ports.get(port_idx) {
                port.put_idle(fd, self.cycle_last.load(Ordering::Relaxed));
            }
        }
    }

    /// Debug snapshot of every port across every node, with its currently
    /// idle (unused) connection count.
    pub fn iter_ports(&self) -> Vec<PortInfo> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for sn in &inner.nodes {
            for port in &sn.node.ports {
                out.push(PortInfo {
                    node_key: sn.key.clone(),
                    peer: port.peer_str.clone(),
                    port_key: port.port_key.clone(),
                    socktype: sn.node.socktype,
                    idle_count: port.idle_count(),
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, Peer, Port};
    use std::net::SocketAddr;

    fn addr(port: u16) -> Peer {
        Peer::Tcp(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn update_hosts_bumps_generation_and_rejects_empty() {
        let svc = Service::new("svc".into(), SockType::Stream, 1, 100, 0, Strategy::Sequential, 5000);
        let gen0 = svc.generation();

        let node = Node::new(SockType::Stream, 1, vec![Port::new("port", addr(100))]);
        svc.update_hosts(vec![ServiceNode { key: None, node }]).unwrap();
        assert_eq!(svc.generation(), gen0 + 1);
        assert_eq!(svc.node_count(), 1);

        assert!(matches!(svc.update_hosts(vec![]), Err(FdPoolError::EmptyConfig)));
        assert_eq!(svc.generation(), gen0 + 1); // unchanged on rejection
    }

    #[test]
    fn short_timeout_falls_back_to_default() {
        let svc = Service::new("svc".into(), SockType::Stream, 1, 100, 0, Strategy::Sequential, 500);
        assert_eq!(svc.timeout_ms, 5000);
    }

    #[test]
    fn find_untried_port_skips_already_tried_indices() {
        let svc = Service::new("svc".into(), SockType::Stream, 1, 100, 0, Strategy::Sequential, 5000);
        let node = Node::new(
            SockType::Stream,
            1,
            vec![Port::new("port", addr(1)), Port::new("port", addr(2))],
        );
        svc.update_hosts(vec![ServiceNode { key: None, node }]).unwrap();

        let mut tried = HashSet::new();
        let first = svc.find_untried_port(0, "port", &tried).unwrap();
        tried.insert(first);
        let second = svc.find_untried_port(0, "port", &tried).unwrap();
        assert_ne!(first, second);
        tried.insert(second);
        assert!(svc.find_untried_port(0, "port", &tried).is_none());
    }
}
