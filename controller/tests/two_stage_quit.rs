//! A `/stop` handler triggers the two-stage quit: `quit_stage_one` runs,
//! "bye" is written, and the caller's worker replies in full before the
//! process-wide resources actually go away. Runs a real `Controller` on an
//! ephemeral port and drives it with a plain TCP client.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use controller::acl::Acl;
use controller::handlers::{Stats, StopHandler};
use controller::request::Handler;
use controller::router::Router;
use controller::server::Controller;
use controller::shutdown::Shutdown;

#[tokio::test]
async fn get_stop_replies_bye_and_then_closes_the_listener() {
    // Claim a free port up front so the controller can bind the same
    // address deterministically.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let shutdown = Arc::new(Shutdown::new());
    let mut router: Router<Arc<dyn Handler>> = Router::new();
    router
        .register(
            "/stop",
            Arc::new(StopHandler {
                shutdown: shutdown.clone(),
            }),
        )
        .unwrap();

    // acl_disabled=true: this test exercises the shutdown path, not ACL.
    let acl = Acl::new(true, vec![], false, false);
    let ctrl = Arc::new(Controller::new(
        format!("127.0.0.1:{port}").parse().unwrap(),
        5,
        router,
        acl,
        Arc::new(Stats::default()),
        shutdown,
        None,
    ));

    let run_handle = tokio::spawn(ctrl.run());
    // Give the accept loop a moment to bind and start listening.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let body = tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .write_all(b"GET /stop HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        buf
    })
    .await
    .unwrap();

    let text = String::from_utf8(body).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Content-Length: 4\r\n"));
    assert!(text.ends_with("bye\n"));

    // The listener should have quiesced: a fresh connect attempt must
    // fail rather than be accepted.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect_timeout(
        &format!("127.0.0.1:{port}").parse().unwrap(),
        Duration::from_millis(200)
    )
    .is_err());

    run_handle.abort();
}
