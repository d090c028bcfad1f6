//! Embeddable HTTP(S) control-plane server: a tokio accept loop, a bounded
//! worker pool, a hand-rolled HTTP/1.1 parser, URL-pattern routing, an
//! ACL engine over peer identity, and a cooperative two-stage shutdown.
//!
//! See `DESIGN.md` at the workspace root for the grounding ledger behind
//! each module's design.

pub mod acl;
pub mod config;
pub mod error;
pub mod handlers;
pub mod http;
pub mod request;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod tls;

pub use config::Config;
pub use error::CtrlError;
pub use server::Controller;
pub use shutdown::Shutdown;
