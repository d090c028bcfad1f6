//! Pluggable service discovery: any external source (DNS poller, Consul
//! watch, Kubernetes endpoint watch, a static file tailer) just needs to
//! turn its updates into [`SdEvent`]s and push them through the [`SdQueue`].
//! A background task drains the queue and applies each event to the pool,
//! without the discovery source needing to know anything about balancer
//! internals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::node::ServiceNode;
use crate::pool::Pool;

/// One update about a service's backend set, as reported by a discovery
/// source.
#[derive(Debug)]
pub enum SdEvent {
    /// Replace a service's node set wholesale.
    Flush {
        service: String,
        nodes: Vec<ServiceNode>,
    },
    /// The service no longer exists; drop it entirely.
    Delete { service: String },
    /// The discovery source learned new balancing parameters for a service.
    /// Held until the next `Flush`, which rebuilds the weight table and
    /// picks these up.
    Config {
        service: String,
        retries: u32,
        failcost: u32,
        softfailcost: u32,
    },
    /// A single node's health flipped. Held until the next `Flush`, which
    /// drops the node from the set it installs if it's currently unhealthy.
    Health {
        service: String,
        node_key: String,
        healthy: bool,
    },
}

struct Envelope {
    index: u64,
    event: SdEvent,
}

/// Producer handle held by discovery sources.
#[derive(Clone)]
pub struct SdSender {
    tx: mpsc::Sender<Envelope>,
    next_index: Arc<AtomicU64>,
}

impl SdSender {
    /// Enqueues `event`, returning the index a caller can later hand to
    /// [`SdProgress::wait_index`] to block until this update (and everything
    /// queued before it) has been applied.
    pub async fn send(&self, event: SdEvent) -> Result<u64, SdEvent> {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx
            .send(Envelope { index, event })
            .await
            .map_err(|e| e.0.event)?;
        Ok(index)
    }

    pub fn try_send(&self, event: SdEvent) -> Result<u64, SdEvent> {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx
            .try_send(Envelope { index, event })
            .map(|_| index)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(env) => env.event,
                mpsc::error::TrySendError::Closed(env) => env.event,
            })
    }
}

struct Progress {
    max_index: AtomicU64,
    notify: Notify,
}

/// A handle onto how far the consumer task has gotten, independent of the
/// queue itself, so a caller that sent an event can block until it (and
/// everything queued before it) has been applied to the pool.
#[derive(Clone)]
pub struct SdProgress(Arc<Progress>);

impl SdProgress {
    /// Blocks until every event up to and including `index` has been
    /// applied, or `timeout` elapses. Returns whether `index` was reached.
    pub async fn wait_index(&self, index: u64, timeout: Duration) -> bool {
        if self.0.max_index.load(Ordering::SeqCst) >= index {
            return true;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return self.0.max_index.load(Ordering::SeqCst) >= index;
            }
            let notified = self.0.notify.notified();
            tokio::pin!(notified);
            if tokio::time::timeout(remaining, &mut notified).await.is_err() {
                return self.0.max_index.load(Ordering::SeqCst) >= index;
            }
            if self.0.max_index.load(Ordering::SeqCst) >= index {
                return true;
            }
        }
    }
}

/// Bounded channel of discovery updates plus the consumer side used by
/// [`spawn_consumer`].
pub struct SdQueue {
    rx: mpsc::Receiver<Envelope>,
    tx: SdSender,
    progress: Arc<Progress>,
}

impl SdQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            rx,
            tx: SdSender {
                tx,
                next_index: Arc::new(AtomicU64::new(0)),
            },
            progress: Arc::new(Progress {
                max_index: AtomicU64::new(0),
                notify: Notify::new(),
            }),
        }
    }

    pub fn sender(&self) -> SdSender {
        self.tx.clone()
    }

    pub fn progress(&self) -> SdProgress {
        SdProgress(self.progress.clone())
    }
}

/// Per-service state accumulated between flushes: balancing parameters and
/// per-node health overrides learned from `Config`/`Health` events, held
/// until the next `Flush` rebuilds the node set and picks them up. Health
/// overrides persist across flushes until a later `Health` event changes
/// them again or `Delete` clears the service out.
#[derive(Default)]
struct PendingShadow {
    config: Option<(u32, u32, u32)>,
    health: HashMap<String, bool>,
}

/// Drains `queue` and applies each event to `pool` until the sender side is
/// dropped. Wakes every two seconds even with nothing queued, matching the
/// original poller's idle cadence, so a future health-sweep hook has a
/// natural place to run.
pub fn spawn_consumer(pool: Arc<Pool>, mut queue: SdQueue) -> JoinHandle<()> {
    let progress = queue.progress.clone();
    tokio::spawn(async move {
        let mut shadow: HashMap<String, PendingShadow> = HashMap::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(2), queue.rx.recv()).await {
                Ok(Some(envelope)) => {
                    apply_event(&pool, &mut shadow, envelope.event);
                    progress.max_index.fetch_max(envelope.index, Ordering::SeqCst);
                    progress.notify.notify_waiters();
                }
                Ok(None) => break,
                Err(_elapsed) => continue,
            }
        }
        log::debug!("fdpool: service discovery queue closed, consumer exiting");
    })
}

fn apply_event(pool: &Pool, shadow: &mut HashMap<String, PendingShadow>, event: SdEvent) {
    match event {
        SdEvent::Flush { service, nodes } => {
            let pending = shadow.entry(service.clone()).or_default();
            let nodes: Vec<ServiceNode> = nodes
                .into_iter()
                .filter(|n| {
                    n.key
                        .as_deref()
                        .map(|k| pending.health.get(k).copied().unwrap_or(true))
                        .unwrap_or(true)
                })
                .collect();
            match pool.get(&service) {
                Some(svc) => {
                    if let Some((retries, failcost, softfailcost)) = pending.config.take() {
                        svc.set_config(retries, failcost, softfailcost);
                    }
                    match svc.update_hosts(nodes) {
                        Ok(n) => log::debug!("fdpool: sd flush for {service}: {n} nodes"),
                        Err(e) => log::warn!("fdpool: sd flush for {service} rejected: {e}"),
                    }
                }
                None => log::debug!("fdpool: sd flush for unknown service {service}, ignored"),
            }
        }
        SdEvent::Delete { service } => {
            pool.remove(&service);
            shadow.remove(&service);
            log::debug!("fdpool: sd delete for {service}");
        }
        SdEvent::Config {
            service,
            retries,
            failcost,
            softfailcost,
        } => {
            shadow.entry(service.clone()).or_default().config = Some((retries, failcost, softfailcost));
            log::debug!(
                "fdpool: sd config update for {service}: retries={retries} failcost={failcost} softfailcost={softfailcost} (applied on next flush)"
            );
        }
        SdEvent::Health {
            service,
            node_key,
            healthy,
        } => {
            shadow
                .entry(service.clone())
                .or_default()
                .health
                .insert(node_key.clone(), healthy);
            log::debug!(
                "fdpool: sd health for {service}/{node_key}: healthy={healthy} (applied on next flush)"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, Peer, SockType};
    use crate::strategy::Strategy;
    use std::net::SocketAddr;

    fn make_node(port: u16) -> ServiceNode {
        ServiceNode {
            key: Some(format!("host{port}")),
            node: Node::new(
                SockType::Stream,
                1,
                vec![crate::node::Port::new(
                    "port",
                    Peer::Tcp(SocketAddr::from(([127, 0, 0, 1], port))),
                )],
            ),
        }
    }

    #[tokio::test]
    async fn flush_event_updates_named_service() {
        let pool = Arc::new(Pool::new());
        let svc = pool.get_or_create("svc", SockType::Stream, 1, 100, 0, Strategy::Sequential, 5000);
        assert_eq!(svc.node_count(), 0);

        let queue = SdQueue::new(8);
        let sender = queue.sender();
        let handle = spawn_consumer(pool.clone(), queue);

        sender
            .send(SdEvent::Flush {
                service: "svc".into(),
                nodes: vec![make_node(1234)],
            })
            .await
            .ok();

        // Give the consumer task a chance to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(svc.node_count(), 1);

        drop(sender);
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn health_event_is_folded_into_the_next_flush() {
        let pool = Arc::new(Pool::new());
        let svc = pool.get_or_create("svc", SockType::Stream, 1, 100, 0, Strategy::Sequential, 5000);

        let queue = SdQueue::new(8);
        let sender = queue.sender();
        let progress = queue.progress();
        let handle = spawn_consumer(pool.clone(), queue);

        let first = sender
            .send(SdEvent::Flush {
                service: "svc".into(),
                nodes: vec![make_node(1), make_node(2)],
            })
            .await
            .unwrap();
        assert!(progress.wait_index(first, Duration::from_secs(1)).await);
        assert_eq!(svc.node_count(), 2);

        sender
            .send(SdEvent::Health {
                service: "svc".into(),
                node_key: "host1".into(),
                healthy: false,
            })
            .await
            .unwrap();

        // A flush with the same two nodes should now drop the unhealthy one.
        let last = sender
            .send(SdEvent::Flush {
                service: "svc".into(),
                nodes: vec![make_node(1), make_node(2)],
            })
            .await
            .unwrap();
        assert!(progress.wait_index(last, Duration::from_secs(1)).await);
        assert_eq!(svc.node_count(), 1);

        drop(sender);
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn config_event_is_applied_on_next_flush() {
        let pool = Arc::new(Pool::new());
        let svc = pool.get_or_create("svc", SockType::Stream, 1, 100, 0, Strategy::Sequential, 5000);

        let queue = SdQueue::new(8);
        let sender = queue.sender();
        let progress = queue.progress();
        let handle = spawn_consumer(pool.clone(), queue);

        sender
            .send(SdEvent::Config {
                service: "svc".into(),
                retries: 7,
                failcost: 250,
                softfailcost: 25,
            })
            .await
            .unwrap();

        let idx = sender
            .send(SdEvent::Flush {
                service: "svc".into(),
                nodes: vec![make_node(1)],
            })
            .await
            .unwrap();
        assert!(progress.wait_index(idx, Duration::from_secs(1)).await);
        assert_eq!(svc.retries(), 7);

        drop(sender);
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn wait_index_times_out_when_nothing_is_sent() {
        let pool = Arc::new(Pool::new());
        let queue = SdQueue::new(8);
        let progress = queue.progress();
        let _handle = spawn_consumer(pool, queue);

        assert!(!progress.wait_index(1, Duration::from_millis(20)).await);
    }
}
