//! Minimal demonstration of registering a service by hand and fetching a
//! connection from it. Run with a local listener on 127.0.0.1:9000 to see a
//! successful connect, or without one to see the pool exhaust its retries.

use std::net::SocketAddr;
use std::sync::Arc;

use fdpool::node::{Node, Peer, Port, ServiceNode, SockType};
use fdpool::pool::Pool;
use fdpool::strategy::{ConnStatus, Strategy};

#[tokio::main]
async fn main() {
    simple_logger::init_with_level(log::Level::Info).ok();

    let pool = Arc::new(Pool::new());
    let svc = pool.get_or_create("demo", SockType::Stream, 2, 100, 0, Strategy::Sequential, 2000);

    let node = Node::new(
        SockType::Stream,
        1,
        vec![Port::new(
            "port",
            Peer::Tcp(SocketAddr::from(([127, 0, 0, 1], 9000))),
        )],
    );
    svc.update_hosts(vec![ServiceNode { key: None, node }])
        .expect("non-empty node set");

    let mut conn = pool.new_conn("demo", "", None);
    match conn.get(ConnStatus::Start).await {
        Ok(handle) => {
            log::info!("connected to {} via {}", handle.peer, handle.port_key);
            conn.mark_done();
        }
        Err(e) => log::warn!("no backend available: {e}"),
    }
}
