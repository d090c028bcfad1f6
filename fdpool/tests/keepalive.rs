use std::net::SocketAddr;
use std::sync::Arc;

use fdpool::node::{Node, Peer, Port, ServiceNode, SockType};
use fdpool::pool::Pool;
use fdpool::strategy::{ConnStatus, Strategy};
use tokio::net::TcpListener;

async fn spawn_echo_listener() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            if let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 || sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }
    });
    addr
}

#[tokio::test]
async fn a_returned_connection_is_reused_before_a_fresh_one() {
    let addr = spawn_echo_listener().await;

    let pool = Arc::new(Pool::new());
    let svc = pool.get_or_create("echo", SockType::Stream, 1, 100, 0, Strategy::Sequential, 2000);
    let node = Node::new(SockType::Stream, 1, vec![Port::new("port", Peer::Tcp(addr))]);
    svc.update_hosts(vec![ServiceNode { key: None, node }]).unwrap();

    let mut conn = pool.new_conn("echo", "", None);

    let first = conn.get(ConnStatus::Start).await.expect("first connect succeeds");
    assert!(!first.reused);
    conn.mark_done();
    conn.put(first);

    let mut conn2 = pool.new_conn("echo", "", None);
    let second = conn2.get(ConnStatus::Start).await.expect("second get succeeds");
    assert!(second.reused, "expected the cached connection to be handed back");
}

#[tokio::test]
async fn service_discovery_swap_is_visible_to_a_fresh_connection() {
    let addr_a = spawn_echo_listener().await;
    let addr_b = spawn_echo_listener().await;

    let pool = Arc::new(Pool::new());
    let svc = pool.get_or_create("rolling", SockType::Stream, 1, 100, 0, Strategy::Sequential, 2000);

    let node_a = Node::new(SockType::Stream, 1, vec![Port::new("port", Peer::Tcp(addr_a))]);
    svc.update_hosts(vec![ServiceNode { key: None, node: node_a }]).unwrap();
    let gen_before = svc.generation();

    let node_b = Node::new(SockType::Stream, 1, vec![Port::new("port", Peer::Tcp(addr_b))]);
    svc.update_hosts(vec![ServiceNode { key: None, node: node_b }]).unwrap();
    assert!(svc.generation() > gen_before);

    let mut conn = pool.new_conn("rolling", "", None);
    let handle = conn.get(ConnStatus::Start).await.expect("connects to the new node");
    assert_eq!(handle.peer, Peer::Tcp(addr_b).to_string());
}
