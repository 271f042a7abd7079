//! Error types for the ringlimit service.

use thiserror::Error;

/// Main error type for ringlimit operations.
#[derive(Error, Debug)]
pub enum RingLimitError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The request was malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The hash ring has no peers, so no node can own the key
    #[error("No peers available to route the request")]
    RoutingUnavailable,

    /// A peer could not be dialed during a membership update
    #[error("Failed to connect to peer {host}: {reason}")]
    PeerConnectionFailed { host: String, reason: String },

    /// The request deadline passed before the operation completed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The request was cancelled by the caller
    #[error("Request cancelled")]
    Cancelled,

    /// The loader failed to hydrate a missing key
    #[error("Loader failure: {0}")]
    LoaderFailure(String),

    /// The storer failed to flush the cache
    #[error("Store failure: {0}")]
    StoreFailure(String),

    /// A remote peer answered with an error status
    #[error("Peer {host} returned an error: {status}")]
    Remote {
        host: String,
        #[source]
        status: tonic::Status,
    },

    /// gRPC transport errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RingLimitError> for tonic::Status {
    fn from(err: RingLimitError) -> Self {
        match err {
            RingLimitError::Remote { status, .. } => status,
            RingLimitError::RoutingUnavailable => tonic::Status::unavailable(err.to_string()),
            RingLimitError::DeadlineExceeded => tonic::Status::deadline_exceeded(err.to_string()),
            RingLimitError::Cancelled => tonic::Status::cancelled(err.to_string()),
            RingLimitError::InvalidRequest(msg) => tonic::Status::invalid_argument(msg),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

/// Result type alias for ringlimit operations.
pub type Result<T> = std::result::Result<T, RingLimitError>;
