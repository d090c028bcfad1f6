use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UnixStream};

use crate::error::FdPoolError;
use crate::node::{Peer, PooledFd, SockType};
use crate::service::Service;
use crate::strategy::ConnStatus;

/// A socket handed back from [`Connection::get`]. Either freshly connected
/// or lifted from a service's idle cache after passing a liveness probe.
pub struct PooledHandle {
    pub stream: PooledFd,
    pub peer: String,
    pub port_key: String,
    pub reused: bool,
    node_idx: usize,
    port_idx: usize,
}

/// One caller's view into a [`Service`]'s node set: tracks where in the
/// node/port iteration it currently sits and hands out sockets one at a
/// time via repeated [`Connection::get`] calls as retries happen.
///
/// Mirrors a `fd_pool_conn`: cheap to create, meant to live for the
/// lifetime of one logical upstream request (reused across its retries).
pub struct Connection {
    service: Arc<Service>,
    hash: u32,
    port_keys: Vec<String>,
    node_filter: Option<String>,
    nonblock: bool,
    async_mode: bool,
    silent: bool,
    generation: u64,
    cursor: Option<crate::strategy::ConnCursor>,
    cur_node: Option<usize>,
    cur_port: Option<usize>,
    tried_ports: HashSet<usize>,
    active: AtomicBool,
}

impl Connection {
    pub(crate) fn new(service: Arc<Service>, port_key: &str, remote_addr: Option<&str>) -> Self {
        let hash = remote_addr.map(crate::strategy::hash::hash_string).unwrap_or(0);
        Self {
            service,
            hash,
            port_keys: port_key.split(',').map(|s| s.to_string()).collect(),
            node_filter: None,
            nonblock: false,
            async_mode: false,
            silent: false,
            generation: 0,
            cursor: None,
            cur_node: None,
            cur_port: None,
            tried_ports: HashSet::new(),
            active: AtomicBool::new(false),
        }
    }

    pub fn set_port_key(&mut self, port_key: &str) {
        self.port_keys = port_key.split(',').map(|s| s.to_string()).collect();
        self.cur_port = None;
        self.tried_ports.clear();
    }

    pub fn set_node_key(&mut self, key: impl Into<String>) {
        self.node_filter = Some(key.into());
    }

    pub fn set_nonblock(&mut self, nb: bool) {
        self.nonblock = nb;
    }

    pub fn set_async(&mut self, async_mode: bool) {
        self.async_mode = async_mode;
    }

    pub fn set_silent(&mut self) {
        self.silent = true;
    }

    pub fn timeout_ms(&self) -> u64 {
        self.service.timeout_ms
    }

    pub fn socktype(&self) -> SockType {
        self.service.socktype
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Returns the next usable socket, retrying across the service's node
    /// set until one connects or the balancing strategy's retry budget is
    /// exhausted. `status` explains why a previous attempt on this same
    /// logical connection didn't pan out.
    pub async fn get(&mut self, status: ConnStatus) -> Result<PooledHandle, FdPoolError> {
        self.active.store(false, Ordering::Relaxed);

        let current_gen = self.service.generation();
        if status == ConnStatus::Start || self.generation < current_gen || self.cursor.is_none() {
            self.generation = current_gen;
            self.cur_node = None;
            self.cur_port = None;
            self.tried_ports.clear();
            self.cursor = Some(self.service.new_cursor(self.hash));
        }

        let mut status = status;

        loop {
            if self.cur_node.is_none() {
                if !self.move_node(&mut status) {
                    return Err(FdPoolError::Exhausted);
                }
            } else if self.cur_port.is_none() && !self.move_port() {
                self.cur_node = None;
                status = ConnStatus::Fail;
                continue;
            }

            let (node_idx, port_idx) = match (self.cur_node, self.cur_port) {
                (Some(n), Some(p)) => (n, p),
                _ => {
                    status = ConnStatus::Fail;
                    continue;
                }
            };

            let (peer, port_key, peer_enum, reused_fd) = self.service.with_port(node_idx, port_idx, |port| {
                let idle = port.take_idle();
                (port.peer_str.clone(), port.port_key.clone(), port.peer.clone(), idle)
            });

            if let Some(fd) = reused_fd {
                if fd.is_alive() {
                    self.active.store(true, Ordering::Relaxed);
                    return Ok(PooledHandle {
                        stream: fd,
                        peer,
                        port_key,
                        reused: true,
                        node_idx,
                        port_idx,
                    });
                }
                // Stale: drop it and fall through to a fresh connect on the same port.
            }

            status = ConnStatus::Fail;

            match self.connect(&peer_enum).await {
                Ok(stream) => {
                    self.active.store(true, Ordering::Relaxed);
                    return Ok(PooledHandle {
                        stream,
                        peer,
                        port_key,
                        reused: false,
                        node_idx,
                        port_idx,
                    });
                }
                Err(_e) => {
                    self.tried_ports.insert(port_idx);
                    self.cur_port = None;
                }
            }
        }
    }

    async fn connect(&self, peer: &Peer) -> Result<PooledFd, FdPoolError> {
        let timeout = Duration::from_millis(self.service.timeout_ms);
        match peer {
            Peer::Tcp(addr) => {
                let fut = TcpStream::connect(addr as &SocketAddr);
                let stream = if self.async_mode {
                    fut.await?
                } else {
                    tokio::time::timeout(timeout, fut)
                        .await
                        .map_err(|_| FdPoolError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)))??
                };
                stream.set_nodelay(true).ok();
                Ok(PooledFd::Tcp(stream))
            }
            Peer::Unix(path) => {
                let fut = UnixStream::connect(path);
                let stream = if self.async_mode {
                    fut.await?
                } else {
                    tokio::time::timeout(timeout, fut)
                        .await
                        .map_err(|_| FdPoolError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)))??
                };
                Ok(PooledFd::Unix(stream))
            }
        }
    }

    /// Picks the next node from the balancing strategy, skipping any that
    /// don't match a configured node-key filter. Only the first pick of a
    /// call carries the caller's real status; filtered-out re-picks always
    /// report `Start`, mirroring the original's behavior of flipping the
    /// status right after consulting it once.
    fn move_node(&mut self, status: &mut ConnStatus) -> bool {
        loop {
            let idx = match self.service.advance_cursor(self.cursor.as_mut().unwrap(), *status) {
                Some(i) => i,
                None => return false,
            };
            *status = ConnStatus::Start;

            if let Some(filter) = &self.node_filter {
                if self.service.node_key(idx).as_deref() != Some(filter.as_str()) {
                    continue;
                }
            }

            self.cur_node = Some(idx);
            self.cur_port = None;
            self.tried_ports.clear();
            if self.move_port() {
                return true;
            }
            self.cur_node = None;
        }
    }

    /// Walks this connection's port-key fallback list against the current
    /// node's ports, skipping ports already tried for this node.
    fn move_port(&mut self) -> bool {
        let node_idx = self.cur_node.expect("move_port called without a node");
        for key in &self.port_keys {
            if let Some(idx) = self.service.find_untried_port(node_idx, key, &self.tried_ports) {
                self.cur_port = Some(idx);
                return true;
            }
        }
        false
    }

    /// Call once the logical operation this connection was used for has
    /// succeeded, clearing any temp-fail penalty recorded against the node
    /// it ultimately landed on.
    pub fn mark_done(&self) {
        if let Some(cursor) = &self.cursor {
            self.service.mark_cursor_done(cursor);
        }
    }

    /// Hands a socket back for reuse by a future caller.
    pub fn put(&self, handle: PooledHandle) {
        self.active.store(false, Ordering::Relaxed);
        if self.generation != self.service.generation() {
            // Stale generation: the node/port this came from may no longer
            // exist. Just let the socket drop and close.
            return;
        }
        if !handle.stream.within_fd_limit() {
            if !self.silent {
                log::debug!("fdpool: not caching fd near the process rlimit");
            }
            return;
        }
        self.service
            .put_idle(handle.node_idx, handle.port_idx, handle.stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, Port};
    use crate::strategy::Strategy;

    fn make_service() -> Arc<Service> {
        let svc = Service::new(
            "test".into(),
            SockType::Stream,
            1,
            100,
            0,
            Strategy::Sequential,
            5000,
        );
        let node = Node::new(
            SockType::Stream,
            1,
            vec![Port::new("port", Peer::Tcp(SocketAddr::from(([127, 0, 0, 1], 1))))],
        );
        svc.update_hosts(vec![crate::node::ServiceNode { key: None, node }])
            .unwrap();
        Arc::new(svc)
    }

    #[tokio::test]
    async fn get_returns_exhausted_when_nothing_listens() {
        let svc = make_service();
        let mut conn = Connection::new(svc, "port", None);
        let res = conn.get(ConnStatus::Start).await;
        assert!(matches!(res, Err(FdPoolError::Io(_))) || res.is_err());
    }
}
