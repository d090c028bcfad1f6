use std::io;

/// Error sentinels returned by [`crate::service::Service`] construction and
/// [`crate::service::Service::update_hosts`].
///
/// Mirrors the `EFDP_*` negative sentinels of the original `fd_pool.h`.
#[derive(Debug)]
pub enum FdPoolError {
    /// No valid nodes in the config, and no service-discovery source configured.
    EmptyConfig,
    /// The input string was not a recognised `scheme://host:port` URL.
    NotUrl,
    /// The resolver reported the name does not exist.
    NoSuchName,
    /// The resolver failed for some other reason.
    ResolveFailed,
    /// `update_hosts` was called for a service that was never registered.
    NoSuchService,
    /// A concurrent `update_hosts` call won the race; this one's result was discarded.
    RaceLost,
    /// The iterator ran out of (node, port) pairs to try.
    Exhausted,
    /// An I/O-level failure (socket, connect, poll).
    Io(io::Error),
}

impl std::error::Error for FdPoolError {}

impl std::fmt::Display for FdPoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyConfig => write!(f, "empty config node"),
            Self::NotUrl => write!(f, "not a valid URL or not a supported URL scheme"),
            Self::NoSuchName => write!(f, "resolver: no such name"),
            Self::ResolveFailed => write!(f, "resolver: lookup failed"),
            Self::NoSuchService => write!(f, "no such service"),
            Self::RaceLost => write!(f, "update race lost"),
            Self::Exhausted => write!(f, "iterator exhausted (EAGAIN)"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl From<io::Error> for FdPoolError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
