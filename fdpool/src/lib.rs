//! Client-side connection pool and load balancer.
//!
//! A [`pool::Pool`] holds one [`service::Service`] per backend name. Each
//! service tracks a weighted, hot-swappable set of nodes (hosts or unix
//! sockets) reachable under one or more port keys, and a per-connection
//! [`strategy::ConnCursor`] decides which node to try next as callers retry.
//! Sockets that succeed are handed back with [`conn::Connection::put`] so the
//! next caller can reuse them instead of paying a fresh connect.

pub mod conn;
pub mod error;
pub mod node;
pub mod pool;
pub mod portmap;
pub mod sd;
pub mod service;
pub mod strategy;

pub use conn::Connection;
pub use error::FdPoolError;
pub use pool::Pool;
pub use service::Service;
