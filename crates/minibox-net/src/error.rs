//! Error types for network setup.

use thiserror::Error;

/// Result type alias for network operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors that can occur while wiring the container network.
#[derive(Debug, Error)]
pub enum NetError {
    /// Netlink protocol or socket error.
    #[error("netlink error: {0}")]
    Netlink(String),

    /// Bridge lookup error.
    #[error("bridge error: {0}")]
    Bridge(String),

    /// Veth pair creation or host-side configuration error.
    #[error("link add error: {0}")]
    LinkAdd(String),

    /// Moving the peer into the container namespace failed.
    #[error("link move error: {0}")]
    LinkMove(String),

    /// In-namespace interface or address configuration failed.
    #[error("address assign error: {0}")]
    AddrAssign(String),
}
