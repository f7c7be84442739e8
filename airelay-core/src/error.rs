use thiserror::Error;

/// Core error type for airelay.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The upstream connection could never be established (DNS, TLS,
    /// connect-level failure). No response object exists.
    #[error("upstream connection failed: {0}")]
    UpstreamConnect(String),

    /// The upstream answered, but with a failure status.
    #[error("upstream returned {status}: {message}")]
    UpstreamResponse { status: u16, message: String },

    /// Delivering a frame to the downstream client failed
    /// (typically: the client disconnected).
    #[error("downstream delivery failed: {0}")]
    DownstreamDelivery(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, RelayError>;
