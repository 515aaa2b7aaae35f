//! Error types for container launch.

use thiserror::Error;

/// Result type alias for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Errors that can occur while launching or running the container.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// `clone(2)` with the namespace flags failed.
    #[error("clone failed: {0}")]
    Clone(String),

    /// Writing the uid/gid maps for the new user namespace failed.
    #[error("id map error: {0}")]
    IdMap(String),

    /// The parent/child start handshake failed.
    #[error("start sync error: {0}")]
    Sync(String),

    /// Mounting `/proc` inside the new root failed.
    #[error("proc mount failed: {0}")]
    ProcMount(String),

    /// The pivot_root sequence failed.
    #[error("pivot_root failed: {0}")]
    Pivot(String),

    /// Setting the container hostname failed.
    #[error("sethostname failed: {0}")]
    Hostname(String),

    /// Executing the user command failed.
    #[error("exec failed: {0}")]
    Exec(String),

    /// Waiting on the child failed.
    #[error("wait failed: {0}")]
    Wait(String),

    /// In-namespace network configuration failed.
    #[error(transparent)]
    Net(#[from] minibox_net::NetError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
