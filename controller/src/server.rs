//! The accept loop, worker pool, and keep-alive readiness layer.
//!
//! A bounded `tokio::sync::mpsc` job queue feeds a fixed pool of worker
//! tasks; each accepted connection becomes one job that owns its own
//! read/parse/respond cycle. `futures::stream::FuturesUnordered` drives
//! `TcpStream::readable()` for sockets that finished one request and are
//! keeping the connection alive, so an idle keep-alive client doesn't tie
//! up a worker slot waiting on its next request.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use crate::acl::{Acl, PeerIdentity};
use crate::error::CtrlError;
use crate::http::{self, Parser};
use crate::request::{Handler, Request};
use crate::router::Router;
use crate::shutdown::SharedShutdown;
use crate::tls;

/// A TCP socket, optionally wrapped in TLS. Lets the rest of the accept
/// loop and keep-alive layer treat both uniformly.
pub enum Socket {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl Socket {
    async fn readable(&self) -> io::Result<()> {
        match self {
            Socket::Plain(s) => s.readable().await,
            Socket::Tls(s) => s.get_ref().0.readable().await,
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Socket::Plain(s) => s.peer_addr().ok(),
            Socket::Tls(s) => s.get_ref().0.peer_addr().ok(),
        }
    }

    /// The leaf certificate CN an mTLS handshake presented, if any. See
    /// `tls::peer_cert_cn`'s doc comment for why this is currently a stub.
    fn peer_cert_cn(&self) -> Option<String> {
        match self {
            Socket::Plain(_) => None,
            Socket::Tls(s) => tls::peer_cert_cn(s.get_ref().1.peer_certificates()?),
        }
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_flush(cx),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

enum Job {
    Initial(Socket),
    Resumed(Socket),
}

enum ConnAction {
    Close,
    KeepAlive(Socket),
}

/// Shared, read-mostly state every worker needs. Held behind `Arc` so
/// cloning per-job is cheap.
pub struct WorkerCtx {
    pub router: Router<Arc<dyn Handler>>,
    pub acl: Acl,
    pub stats: Arc<crate::handlers::Stats>,
    pub shutdown: SharedShutdown,
    pub tls_acceptor: Option<TlsAcceptor>,
}

pub struct Controller {
    addr: SocketAddr,
    worker_count: usize,
    ctx: Arc<WorkerCtx>,
}

impl Controller {
    pub fn new(
        addr: SocketAddr,
        worker_count: usize,
        router: Router<Arc<dyn Handler>>,
        acl: Acl,
        stats: Arc<crate::handlers::Stats>,
        shutdown: SharedShutdown,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            addr,
            // Never run with fewer than 5 workers regardless of config.
            worker_count: worker_count.max(5),
            ctx: Arc::new(WorkerCtx {
                router,
                acl,
                stats,
                shutdown,
                tls_acceptor,
            }),
        }
    }

    pub fn shutdown_handle(&self) -> SharedShutdown {
        self.ctx.shutdown.clone()
    }

    /// Binds the listener, spawns the worker pool and the keep-alive
    /// readiness task, then runs the accept loop until shutdown.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        log::info!("controller listening on {}", self.addr);

        let (job_tx, job_rx) = mpsc::channel::<Job>(256);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        let (keepalive_tx, keepalive_rx) = mpsc::channel::<Socket>(256);

        let next_worker_id = AtomicUsize::new(0);
        for _ in 0..self.worker_count {
            let id = next_worker_id.fetch_add(1, Ordering::Relaxed);
            let ctx = self.ctx.clone();
            let rx = job_rx.clone();
            let keepalive_tx = keepalive_tx.clone();
            let handle = tokio::spawn(worker_loop(id, rx, keepalive_tx, ctx));
            self.ctx.shutdown.register_worker(id, handle);
        }

        let keepalive_ctx_shutdown = self.ctx.shutdown.clone();
        let keepalive_job_tx = job_tx.clone();
        tokio::spawn(keepalive_manager(
            keepalive_rx,
            keepalive_job_tx,
            keepalive_ctx_shutdown,
        ));

        let accept_ctx = self.ctx.clone();
        let accept_job_tx = job_tx.clone();
        let listener_handle = tokio::spawn(async move {
            accept_loop(listener, accept_job_tx, accept_ctx).await;
        });
        self.ctx.shutdown.register_listener(listener_handle);

        self.ctx.shutdown.wait_for_quit().await;
        Ok(())
    }
}

async fn accept_loop(
    listener: tokio::net::TcpListener,
    job_tx: mpsc::Sender<Job>,
    ctx: Arc<WorkerCtx>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        ctx.stats.accepted_total.fetch_add(1, Ordering::Relaxed);
                        log::debug!("accepted connection from {addr}");
                        stream.set_nodelay(true).ok();
                        if let Err(e) = job_tx.send(Job::Initial(Socket::Plain(stream))).await {
                            log::warn!("job queue closed while accepting: {e}");
                            break;
                        }
                    }
                    Err(e) => {
                        log::error!("accept failed: {e}");
                        break;
                    }
                }
            }
            _ = ctx.shutdown.wait_for_quit() => {
                log::info!("listener quiescing");
                break;
            }
        }
    }
}

/// Holds sockets that finished one request cycle with keep-alive, waking
/// them (via `TcpStream::readable()`) instead of spending a worker on a
/// blocking read.
async fn keepalive_manager(
    mut rx: mpsc::Receiver<Socket>,
    job_tx: mpsc::Sender<Job>,
    shutdown: SharedShutdown,
) {
    let mut pending = FuturesUnordered::new();
    loop {
        tokio::select! {
            maybe_socket = rx.recv() => {
                match maybe_socket {
                    Some(socket) => pending.push(async move {
                        let res = socket.readable().await;
                        (socket, res)
                    }),
                    None => break,
                }
            }
            Some((socket, res)) = pending.next(), if !pending.is_empty() => {
                if res.is_ok() {
                    if job_tx.send(Job::Resumed(socket)).await.is_err() {
                        break;
                    }
                }
                // err: peer went away while idle; drop the socket.
            }
            _ = shutdown.wait_for_quit() => break,
        }
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    keepalive_tx: mpsc::Sender<Socket>,
    ctx: Arc<WorkerCtx>,
) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            tokio::select! {
                job = guard.recv() => job,
                _ = ctx.shutdown.wait_for_quit() => None,
            }
        };
        let job = match job {
            Some(j) => j,
            None => break,
        };

        match process_job(id, job, &ctx).await {
            ConnAction::KeepAlive(socket) => {
                let _ = keepalive_tx.send(socket).await;
            }
            ConnAction::Close => {}
        }
    }
    log::debug!("worker {id} exiting");
}

async fn process_job(worker_id: usize, job: Job, ctx: &Arc<WorkerCtx>) -> ConnAction {
    let (mut socket, initial) = match job {
        Job::Initial(s) => (s, true),
        Job::Resumed(s) => (s, false),
    };

    if initial {
        let mut should_upgrade = false;
        if let Socket::Plain(ref tcp) = socket {
            let mut peek_buf = [0u8; 1];
            if let Ok(1) = tcp.peek(&mut peek_buf).await {
                should_upgrade = tls::looks_like_tls(peek_buf[0]);
            }
        }
        if should_upgrade {
            // A ClientHello requires TLS to actually be enabled, else close.
            let acceptor = match &ctx.tls_acceptor {
                Some(a) => a.clone(),
                None => {
                    log::debug!("worker {worker_id}: TLS ClientHello with no acceptor configured");
                    return ConnAction::Close;
                }
            };
            let tcp = match socket {
                Socket::Plain(tcp) => tcp,
                Socket::Tls(_) => unreachable!("already upgraded"),
            };
            socket = match acceptor.accept(tcp).await {
                Ok(tls_stream) => Socket::Tls(Box::new(tls_stream)),
                Err(e) => {
                    log::info!("worker {worker_id}: TLS handshake failed: {e}");
                    return ConnAction::Close;
                }
            };
        }
    }

    match run_request_cycle(&mut socket, ctx, worker_id).await {
        Ok(true) => ConnAction::KeepAlive(socket),
        Ok(false) => ConnAction::Close,
        Err(e) => {
            log::info!("worker {worker_id}: request failed: {e}");
            ConnAction::Close
        }
    }
}

/// Parses and answers exactly one request, returning whether the
/// connection should be kept alive for a future job.
async fn run_request_cycle(
    socket: &mut Socket,
    ctx: &Arc<WorkerCtx>,
    worker_id: usize,
) -> Result<bool, CtrlError> {
    let peer_addr = socket.peer_addr().map(|a| a.ip().to_string());
    let peer_cert_cn = socket.peer_cert_cn();
    let mut parser = Parser::new();
    let mut read_buf = [0u8; 8192];
    let mut header_field: Option<String> = None;
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    let mut req: Option<Request> = None;
    let mut path_for_404 = String::new();

    loop {
        let n = socket.read(&mut read_buf).await?;
        if n == 0 {
            return Ok(false);
        }
        let events = parser.feed(&read_buf[..n])?;
        for event in events {
            match event {
                http::Event::Url(path) => {
                    path_for_404 = path.clone();
                    let (base_path, query) = match path.split_once('?') {
                        Some((b, q)) => (b.to_string(), Some(q.to_string())),
                        None => (path.clone(), None),
                    };
                    let mut r = Request::new(parser.method.clone(), base_path.clone());
                    if let Some(q) = query {
                        r.parse_query_string(&q);
                    }
                    req = Some(r);
                }
                http::Event::HeaderField(f) => header_field = Some(f),
                http::Event::HeaderValue(v) => {
                    if let Some(f) = header_field.take() {
                        headers.insert(f.to_ascii_lowercase(), v);
                    }
                }
                http::Event::HeadersComplete => {
                    let request = req
                        .as_mut()
                        .ok_or_else(|| CtrlError::BadRequest("no request line".into()))?;

                    if let Some(cl) = headers.get("content-length") {
                        let len: u64 = cl
                            .parse()
                            .map_err(|_| CtrlError::BadRequest("bad Content-Length".into()))?;
                        parser.set_content_length(len)?;
                        request.content_length = Some(len);
                    }
                    if headers
                        .get("connection")
                        .map(|v| v.eq_ignore_ascii_case("close"))
                        .unwrap_or(false)
                    {
                        request.close_requested = true;
                    }
                    if let Some(upgrade) = headers.get("upgrade") {
                        request.upgrade_token = Some(upgrade.chars().take(32).collect());
                    }

                    let peer = PeerIdentity {
                        remote_addr: peer_addr.clone(),
                        cert_cn: peer_cert_cn.clone(),
                        issuer_cn: None,
                    };
                    if !ctx.acl.check(&request.method, &request.path, &peer) {
                        request.error(403, format!("Forbidden ({})", request.path));
                    } else if let Some((handler, captures)) = ctx.router.matches(&request.path) {
                        for (k, v) in captures {
                            request.set_capture(k, v);
                        }
                        if let Err(e) = handler.start(request) {
                            request.error(e.status(), e.message());
                        }
                    } else {
                        request.error(404, format!("Not Found ({})", request.path));
                    }
                }
                http::Event::Body(chunk) => {
                    let request = req.as_mut().expect("body arrives after headers");
                    if request.status < 400 {
                        if let Some((handler, _)) = ctx.router.matches(&request.path) {
                            if let Err(e) = handler.consume_post(request, &chunk) {
                                request.error(e.status(), e.message());
                            }
                        }
                    }
                }
                http::Event::MessageComplete => {
                    let mut request = req.take().ok_or_else(|| {
                        CtrlError::BadRequest(format!("no request for {path_for_404}"))
                    })?;

                    if request.status < 400 {
                        if let Some((handler, _)) = ctx.router.matches(&request.path) {
                            if let Err(e) = handler.finish(&mut request) {
                                request.error(e.status(), e.message());
                            }
                            handler.cleanup(&mut request);
                        }
                    }
                    request.mark_complete();
                    ctx.stats.record(request.status);

                    let keep_alive = !request.should_close(true);
                    let response = request.serialize_response(keep_alive);
                    socket.write_all(&response).await?;
                    socket.flush().await?;

                    if request.shutdown_requested {
                        // Stage one excludes this worker from the join (it's
                        // still inside this call); stage two is handed off
                        // to a separate task since awaiting our own
                        // JoinHandle from inside it would deadlock.
                        let shutdown = ctx.shutdown.clone();
                        match shutdown.quit_stage_one(Some(worker_id)).await {
                            Ok(()) => {
                                tokio::spawn(async move {
                                    shutdown.quit_stage_two().await;
                                });
                            }
                            Err(_) => {
                                log::debug!("worker {worker_id}: shutdown already in progress");
                            }
                        }
                    }

                    return Ok(keep_alive);
                }
            }
        }
    }
}
