//! HTTP-facing error taxonomy. Every variant carries a status code and a
//! message that gets serialised into the canned JSON error body.

use std::fmt;

#[derive(Debug)]
pub enum CtrlError {
    /// 404: no handler matched the request path.
    NotFound(String),
    /// 403: ACL denied the request.
    Forbidden(String),
    /// 400: malformed request (bad header, oversized Content-Length, body
    /// delivered to a handler with no `consume_post`, parser desync).
    BadRequest(String),
    /// A handler explicitly raised an error via `ctrl_error`-equivalent.
    Handler { status: u16, message: String },
    /// Transport-level failure while talking to the client.
    Io(std::io::Error),
}

impl CtrlError {
    pub fn status(&self) -> u16 {
        match self {
            CtrlError::NotFound(_) => 404,
            CtrlError::Forbidden(_) => 403,
            CtrlError::BadRequest(_) => 400,
            CtrlError::Handler { status, .. } => *status,
            CtrlError::Io(_) => 500,
        }
    }

    pub fn message(&self) -> String {
        match self {
            CtrlError::NotFound(path) => format!("Not Found ({path})"),
            CtrlError::Forbidden(path) => format!("Forbidden ({path})"),
            CtrlError::BadRequest(msg) => msg.clone(),
            CtrlError::Handler { message, .. } => message.clone(),
            CtrlError::Io(e) => e.to_string(),
        }
    }

    /// The canned JSON error body, e.g.
    /// `{"error":{"status":"403","message":"Forbidden (/…)"}}`.
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "error": {
                "status": self.status().to_string(),
                "message": self.message(),
            }
        })
        .to_string()
    }
}

impl fmt::Display for CtrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status(), self.message())
    }
}

impl std::error::Error for CtrlError {}

impl From<std::io::Error> for CtrlError {
    fn from(e: std::io::Error) -> Self {
        CtrlError::Io(e)
    }
}
