//! Per-request state and the handler capability set: one small trait per
//! endpoint, rather than a single dispatch god-function, walked through a
//! `start` → `consume_post`* → `finish` → `cleanup` → optional `upgrade`
//! lifecycle.

use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::error::CtrlError;

/// Either a growable text buffer or a raw byte blob the handler set
/// directly. Setting both is a handler bug: the blob wins and the text
/// buffer is logged and discarded.
#[derive(Debug, Default)]
enum Body {
    #[default]
    Empty,
    Text(String),
    Blob(Vec<u8>),
}

/// One in-flight request's mutable state, threaded through a handler's
/// `start`/`consume_post`/`finish`/`cleanup` calls.
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub content_length: Option<u64>,
    pub close_requested: bool,
    pub upgrade_token: Option<String>,
    pub status: u16,
    pub content_type: Option<String>,
    custom_headers: Vec<(String, String)>,
    body: Body,
    completed: bool,
    pub shutdown_requested: bool,
}

impl Request {
    pub fn new(method: String, path: String) -> Self {
        Self {
            method,
            path,
            query: BTreeMap::new(),
            content_length: None,
            close_requested: false,
            upgrade_token: None,
            status: 200,
            content_type: None,
            custom_headers: Vec::new(),
            body: Body::Empty,
            completed: false,
            shutdown_requested: false,
        }
    }

    /// Called by a `/stop`-style handler: marks the connection for close
    /// and tells the server loop to kick off `quit_stage_one` once this
    /// response has actually been written -- the worker must finish
    /// replying before it's joined.
    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
        self.close_requested = true;
    }

    pub fn set_capture(&mut self, name: String, value: String) {
        self.query.insert(name, value);
    }

    /// Parses a `?a=b&c=d` query string into the capture/query map.
    pub fn parse_query_string(&mut self, raw: &str) {
        for pair in raw.split('&').filter(|s| !s.is_empty()) {
            let mut it = pair.splitn(2, '=');
            let key = it.next().unwrap_or("").to_string();
            let value = it.next().unwrap_or("").to_string();
            if !key.is_empty() {
                self.query.insert(key, value);
            }
        }
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    /// Custom response headers must start with `X-` and be unique.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<(), CtrlError> {
        let name = name.into();
        if !name.starts_with("X-") {
            return Err(CtrlError::BadRequest(format!(
                "custom header {name} must start with X-"
            )));
        }
        if self.custom_headers.iter().any(|(k, _)| k == &name) {
            return Err(CtrlError::BadRequest(format!("duplicate header {name}")));
        }
        self.custom_headers.push((name, value.into()));
        Ok(())
    }

    pub fn output_text(&mut self, text: impl Into<String>) {
        if matches!(self.body, Body::Blob(_)) {
            log::warn!("handler set both a text body and a raw blob; blob wins");
            return;
        }
        self.body = Body::Text(text.into());
    }

    pub fn output_blob(&mut self, blob: Vec<u8>) {
        if matches!(self.body, Body::Text(_)) {
            log::warn!("handler set both a text body and a raw blob; blob wins");
        }
        self.body = Body::Blob(blob);
    }

    /// Switches the response to the canned JSON error body and marks the
    /// connection for close.
    pub fn error(&mut self, status: u16, message: impl Into<String>) {
        let err = CtrlError::Handler {
            status,
            message: message.into(),
        };
        self.status = status;
        self.body = Body::Text(err.to_json());
        self.content_type = Some("application/json".to_string());
        self.close_requested = true;
    }

    pub fn mark_complete(&mut self) {
        self.completed = true;
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    fn body_bytes(&self) -> &[u8] {
        match &self.body {
            Body::Empty => b"",
            Body::Text(s) => s.as_bytes(),
            Body::Blob(b) => b,
        }
    }

    /// Serialises the full response: status line, `Date` (RFC 1123),
    /// optional `Connection: close`, `Content-Length`, optional
    /// `Content-Type`, `Upgrade` handshake headers when status is 101,
    /// then custom `X-` headers, blank line, body.
    pub fn serialize_response(&self, keep_alive: bool) -> Vec<u8> {
        let mut out = Vec::new();
        let reason = reason_phrase(self.status);
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, reason).as_bytes());
        out.extend_from_slice(format!("Date: {}\r\n", httpdate_now()).as_bytes());

        let close = self.close_requested || !keep_alive;
        if close {
            out.extend_from_slice(b"Connection: close\r\n");
        } else if self.status != 101 {
            out.extend_from_slice(b"Connection: keep-alive\r\n");
        }

        let body = self.body_bytes();
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());

        if let Some(ct) = &self.content_type {
            out.extend_from_slice(format!("Content-Type: {ct}\r\n").as_bytes());
        }

        if self.status == 101 {
            if let Some(token) = &self.upgrade_token {
                out.extend_from_slice(format!("Upgrade: {token}\r\n").as_bytes());
                out.extend_from_slice(b"Connection: Upgrade\r\n");
            }
        }

        for (k, v) in &self.custom_headers {
            out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body);
        out
    }

    pub fn should_close(&self, keep_alive: bool) -> bool {
        self.close_requested || !keep_alive
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        101 => "Switching Protocols",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// RFC 1123 date, e.g. `Tue, 15 Nov 1994 08:12:31 GMT`, formatted by hand
/// rather than pulling in a dedicated date-formatting crate for one field.
fn httpdate_now() -> String {
    const DAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let days_since_epoch = secs / 86400;
    let time_of_day = secs % 86400;
    let (h, m, s) = (time_of_day / 3600, (time_of_day % 3600) / 60, time_of_day % 60);
    // 1970-01-01 was a Thursday.
    let weekday = DAYS[((days_since_epoch + 4) % 7) as usize];

    let mut days = days_since_epoch as i64;
    let mut year = 1970i64;
    loop {
        let leap = is_leap(year);
        let year_len = if leap { 366 } else { 365 };
        if days < year_len {
            break;
        }
        days -= year_len;
        year += 1;
    }
    let month_lengths = month_lengths(is_leap(year));
    let mut month = 0usize;
    while days >= month_lengths[month] {
        days -= month_lengths[month];
        month += 1;
    }
    let day = days + 1;

    format!(
        "{weekday}, {day:02} {} {year} {h:02}:{m:02}:{s:02} GMT",
        MONTHS[month]
    )
}

fn is_leap(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn month_lengths(leap: bool) -> [i64; 12] {
    [
        31,
        if leap { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ]
}

/// The capability set a registered route implements: `start` runs once
/// the handler is chosen and ACL'd, `consume_post` streams body chunks,
/// `finish` runs once the message is complete and serialises the
/// response, `cleanup` always runs after the response is sent.
pub trait Handler: Send + Sync {
    fn start(&self, _req: &mut Request) -> Result<(), CtrlError> {
        Ok(())
    }

    fn consume_post(&self, _req: &mut Request, _chunk: &[u8]) -> Result<(), CtrlError> {
        Err(CtrlError::BadRequest("handler does not accept a body".into()))
    }

    fn finish(&self, req: &mut Request) -> Result<(), CtrlError>;

    fn cleanup(&self, _req: &mut Request) {}
}
