//! Hand-rolled incremental HTTP/1.1 parser.
//!
//! Deliberately not delegated to `hyper`/`httparse`: header collection
//! tracks a tri-state `{None, Field, Value}` enum (growing `String`
//! buffers for the header currently being accumulated, reset once it's
//! complete) rather than heap-allocating per header up front.
//!
//! The parser is fed arbitrarily-sized chunks as they arrive off the
//! socket and emits a list of [`Event`]s per call, mirroring a
//! callback-driven shape (`on_url`, `on_header_field`, `on_header_value`,
//! `on_headers_complete`, `on_body`, `on_message_complete`) minus the
//! actual callback indirection (Rust callers just match on the returned
//! events).

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Url(String),
    HeaderField(String),
    HeaderValue(String),
    HeadersComplete,
    Body(Vec<u8>),
    MessageComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    RequestLine,
    Headers,
    Body,
    Done,
}

/// Idle between headers, accumulating a field name, or accumulating a
/// field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    None,
    Field,
    Value,
}

#[derive(Debug)]
pub struct Parser {
    phase: Phase,
    header_state: HeaderState,
    line_buf: Vec<u8>,
    cur_field: String,
    cur_value: String,
    remaining_body: u64,
    pub method: String,
    pub path: String,
    pub version: String,
}

/// Anything claiming a body this large is almost certainly a malformed or
/// hostile `Content-Length`, not a legitimate request.
const MAX_CONTENT_LENGTH: u64 = 100 * 1024 * 1024 * 1024;

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            phase: Phase::RequestLine,
            header_state: HeaderState::None,
            line_buf: Vec::new(),
            cur_field: String::new(),
            cur_value: String::new(),
            remaining_body: 0,
            method: String::new(),
            path: String::new(),
            version: String::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Resets everything but the method/path/version buffers' allocations,
    /// so the same `Parser` can be reused across a keep-alive connection's
    /// next request.
    pub fn reset(&mut self) {
        self.phase = Phase::RequestLine;
        self.header_state = HeaderState::None;
        self.line_buf.clear();
        self.cur_field.clear();
        self.cur_value.clear();
        self.remaining_body = 0;
        self.method.clear();
        self.path.clear();
        self.version.clear();
    }

    /// Feeds one chunk of socket bytes in, returning every event the chunk
    /// produced. `Err` covers a bad header value, an oversized
    /// `Content-Length`, or any other parser-level malformation.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Event>, crate::error::CtrlError> {
        let mut events = Vec::new();
        let mut i = 0;
        while i < data.len() {
            match self.phase {
                Phase::RequestLine | Phase::Headers => {
                    let b = data[i];
                    i += 1;
                    if b == b'\n' {
                        if self.line_buf.last() == Some(&b'\r') {
                            self.line_buf.pop();
                        }
                        let line = std::mem::take(&mut self.line_buf);
                        self.consume_line(&line, &mut events)?;
                    } else {
                        self.line_buf.push(b);
                        if self.line_buf.len() > 64 * 1024 {
                            return Err(crate::error::CtrlError::BadRequest(
                                "header line too long".into(),
                            ));
                        }
                    }
                }
                Phase::Body => {
                    let take = (data.len() - i).min(self.remaining_body as usize);
                    if take > 0 {
                        events.push(Event::Body(data[i..i + take].to_vec()));
                        self.remaining_body -= take as u64;
                        i += take;
                    }
                    if self.remaining_body == 0 {
                        self.phase = Phase::Done;
                        events.push(Event::MessageComplete);
                    }
                }
                Phase::Done => break,
            }
        }
        // No body declared: a bare GET with no Content-Length completes as
        // soon as headers do.
        if self.phase == Phase::Body && self.remaining_body == 0 {
            self.phase = Phase::Done;
            events.push(Event::MessageComplete);
        }
        Ok(events)
    }

    fn consume_line(
        &mut self,
        line: &[u8],
        events: &mut Vec<Event>,
    ) -> Result<(), crate::error::CtrlError> {
        match self.phase {
            Phase::RequestLine => {
                let text = std::str::from_utf8(line)
                    .map_err(|_| crate::error::CtrlError::BadRequest("bad request line".into()))?;
                let mut parts = text.split_whitespace();
                self.method = parts.next().unwrap_or_default().to_string();
                self.path = parts.next().unwrap_or_default().to_string();
                self.version = parts.next().unwrap_or("HTTP/1.1").to_string();
                if self.method.is_empty() || self.path.is_empty() {
                    return Err(crate::error::CtrlError::BadRequest(
                        "malformed request line".into(),
                    ));
                }
                events.push(Event::Url(self.path.clone()));
                self.phase = Phase::Headers;
                Ok(())
            }
            Phase::Headers => {
                if line.is_empty() {
                    self.flush_header(events);
                    events.push(Event::HeadersComplete);
                    self.phase = Phase::Body;
                    return Ok(());
                }
                // Continuation lines (leading whitespace) are folded onto
                // the in-progress value; anything else starts a new field.
                if (line[0] == b' ' || line[0] == b'\t') && self.header_state == HeaderState::Value
                {
                    self.cur_value.push(' ');
                    self.cur_value
                        .push_str(std::str::from_utf8(line).unwrap_or("").trim());
                    return Ok(());
                }
                self.flush_header(events);
                let text = std::str::from_utf8(line)
                    .map_err(|_| crate::error::CtrlError::BadRequest("bad header bytes".into()))?;
                let (field, value) = text
                    .split_once(':')
                    .ok_or_else(|| crate::error::CtrlError::BadRequest("bad header value".into()))?;
                self.header_state = HeaderState::Field;
                self.cur_field = field.trim().to_string();
                events.push(Event::HeaderField(self.cur_field.clone()));
                self.header_state = HeaderState::Value;
                self.cur_value = value.trim().to_string();
                Ok(())
            }
            Phase::Body | Phase::Done => Ok(()),
        }
    }

    fn flush_header(&mut self, events: &mut Vec<Event>) {
        if self.header_state == HeaderState::Value {
            events.push(Event::HeaderValue(self.cur_value.clone()));
        }
        self.header_state = HeaderState::None;
    }

    /// Call once `Content-Length` is known (from the header-processing
    /// caller in `request.rs`), validating it against the 100 GiB ceiling.
    pub fn set_content_length(&mut self, len: u64) -> Result<(), crate::error::CtrlError> {
        if len > MAX_CONTENT_LENGTH {
            return Err(crate::error::CtrlError::BadRequest(
                "Content-Length exceeds 100GiB".into(),
            ));
        }
        self.remaining_body = len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_line_and_headers_in_one_shot() {
        let mut p = Parser::new();
        let events = p
            .feed(b"GET /stats HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        assert_eq!(events[0], Event::Url("/stats".into()));
        assert!(events.contains(&Event::HeaderField("Host".into())));
        assert!(events.contains(&Event::HeaderValue("x".into())));
        assert!(events.contains(&Event::HeadersComplete));
        assert!(events.contains(&Event::MessageComplete));
    }

    #[test]
    fn splits_across_many_small_feeds() {
        let mut p = Parser::new();
        let mut events = Vec::new();
        for byte in b"GET /a HTTP/1.1\r\n\r\n" {
            events.extend(p.feed(&[*byte]).unwrap());
        }
        assert_eq!(events[0], Event::Url("/a".into()));
        assert!(events.contains(&Event::MessageComplete));
    }

    #[test]
    fn body_arrives_after_content_length_is_applied() {
        let mut p = Parser::new();
        let events = p
            .feed(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\n")
            .unwrap();
        assert!(events.contains(&Event::HeadersComplete));
        assert!(!events.contains(&Event::MessageComplete));
        p.set_content_length(5).unwrap();
        let events = p.feed(b"hello").unwrap();
        assert!(events.contains(&Event::Body(b"hello".to_vec())));
        assert!(events.contains(&Event::MessageComplete));
    }

    #[test]
    fn rejects_oversized_content_length() {
        let mut p = Parser::new();
        assert!(p.set_content_length(100 * 1024 * 1024 * 1024 + 1).is_err());
        assert!(p.set_content_length(100 * 1024 * 1024 * 1024).is_ok());
    }

    #[test]
    fn reset_allows_parsing_a_second_request() {
        let mut p = Parser::new();
        p.feed(b"GET /a HTTP/1.1\r\n\r\n").unwrap();
        assert!(p.is_done());
        p.reset();
        let events = p.feed(b"GET /b HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(events[0], Event::Url("/b".into()));
    }
}
