//! Built-in handlers: `/stats`, `/loglevel`, and `/stop`. One small struct
//! implementing a narrow trait per HTTP endpoint, holding only the shared
//! state it needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fdpool::pool::Pool;

use crate::error::CtrlError;
use crate::request::{Handler, Request};
use crate::shutdown::SharedShutdown;

/// Process-wide request counters, exposed via `/stats`. `AtomicU64` with
/// `Relaxed` ordering throughout: these are observability counters, not
/// synchronization primitives.
#[derive(Default)]
pub struct Stats {
    pub accepted_total: AtomicU64,
    pub requests_total: AtomicU64,
    pub requests_ok: AtomicU64,
    pub requests_error: AtomicU64,
    pub requests_not_found: AtomicU64,
    pub requests_forbidden: AtomicU64,
}

impl Stats {
    pub fn record(&self, status: u16) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        match status {
            200..=299 => {
                self.requests_ok.fetch_add(1, Ordering::Relaxed);
            }
            403 => {
                self.requests_forbidden.fetch_add(1, Ordering::Relaxed);
            }
            404 => {
                self.requests_not_found.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.requests_error.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn to_json_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut fields = serde_json::Map::new();
        fields.insert(
            "controller.accepted_total".into(),
            self.accepted_total.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "controller.requests_total".into(),
            self.requests_total.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "controller.requests_ok".into(),
            self.requests_ok.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "controller.requests_error".into(),
            self.requests_error.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "controller.requests_not_found".into(),
            self.requests_not_found.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "controller.requests_forbidden".into(),
            self.requests_forbidden.load(Ordering::Relaxed).into(),
        );
        fields
    }
}

/// `GET /stats`: walks process counters and the FD pool's per-(service,
/// node, port) idle-FD counts, emitting `{"stats": {...}}` with dotted keys.
pub struct StatsHandler {
    pub stats: Arc<Stats>,
    pub pool: Arc<Pool>,
}

impl Handler for StatsHandler {
    fn finish(&self, req: &mut Request) -> Result<(), CtrlError> {
        let mut fields = self.stats.to_json_fields();
        for name in self.pool.service_names() {
            if let Some(svc) = self.pool.get(&name) {
                for port in svc.iter_ports() {
                    let key = format!(
                        "{name}.{}.{}.idle",
                        port.node_key.as_deref().unwrap_or("static"),
                        port.port_key
                    );
                    fields.insert(key, port.idle_count.into());
                }
            }
        }
        let body = serde_json::json!({ "stats": serde_json::Value::Object(fields) }).to_string();
        req.set_content_type("application/json");
        req.output_text(body);
        Ok(())
    }
}

/// `GET /loglevel`, `POST /loglevel?level=<name>`: reports or sets the
/// process-wide log threshold via `log::max_level`/`set_max_level`, which
/// every `log`-backed logger implementation (including `simple_logger`)
/// respects without needing its own mutable-level plumbing.
pub struct LogLevelHandler;

fn parse_level(name: &str) -> Option<log::LevelFilter> {
    match name.to_ascii_lowercase().as_str() {
        "debug" => Some(log::LevelFilter::Debug),
        "info" => Some(log::LevelFilter::Info),
        "warning" | "warn" => Some(log::LevelFilter::Warn),
        "error" => Some(log::LevelFilter::Error),
        "crit" | "critical" => Some(log::LevelFilter::Error),
        _ => None,
    }
}

impl Handler for LogLevelHandler {
    fn finish(&self, req: &mut Request) -> Result<(), CtrlError> {
        if req.method.eq_ignore_ascii_case("POST") {
            let level = req
                .query
                .get("level")
                .ok_or_else(|| CtrlError::BadRequest("missing level".into()))?;
            let parsed = parse_level(level)
                .ok_or_else(|| CtrlError::BadRequest(format!("unsupported level {level}")))?;
            log::set_max_level(parsed);
        }
        req.set_content_type("application/json");
        req.output_text(serde_json::json!({ "level": log::max_level().to_string() }).to_string());
        Ok(())
    }
}

/// A `/stop` handler demonstrating the two-stage quit: the handler only
/// writes the "bye" response and flags the request as a shutdown trigger;
/// `controller::server` is the one that actually calls `quit_stage_one`
/// once this worker's response bytes are on the wire, since
/// `Handler::finish` is synchronous and can't await.
pub struct StopHandler {
    #[allow(dead_code)]
    pub shutdown: SharedShutdown,
}

impl Handler for StopHandler {
    fn finish(&self, req: &mut Request) -> Result<(), CtrlError> {
        // The trailing newline is what makes `Content-Length: 4` line up
        // with a 4-byte body for the 3-byte word "bye".
        req.output_text("bye\n");
        req.request_shutdown();
        Ok(())
    }
}
