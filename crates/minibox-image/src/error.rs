//! Error types for image operations.

use thiserror::Error;

/// Result type alias for image operations.
pub type Result<T> = std::result::Result<T, ImageError>;

/// Errors that can occur while resolving, pulling, or storing an image.
#[derive(Debug, Error)]
pub enum ImageError {
    /// No default registry configured and the reference names no host.
    #[error("no default registry configured")]
    NoDefaultRegistry,

    /// Invalid image reference.
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// Registry HTTP error.
    #[error("registry error: {0}")]
    Registry(String),

    /// Bearer-token authentication error.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Registry response decode error.
    #[error("decode error: {0}")]
    Decode(String),

    /// Manifest error.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// Layer media type this runtime does not handle.
    #[error("unsupported layer media type: {0}")]
    UnsupportedLayerType(String),

    /// Downloaded blob did not match its manifest digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    Digest {
        /// Digest from the manifest descriptor.
        expected: String,
        /// Digest computed over the downloaded bytes.
        actual: String,
    },

    /// Layer unpack error.
    #[error("unpack error: {0}")]
    Unpack(String),

    /// Hardlink whose target resolves outside the blob store.
    #[error("invalid hardlink: {0}")]
    InvalidHardlink(String),

    /// Extended attribute error while translating whiteouts.
    #[error("xattr error: {0}")]
    Xattr(String),

    /// Overlay mount error.
    #[error("overlay mount error: {0}")]
    Mount(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
