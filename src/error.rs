//! Error types.
//!
//! Startup failures surface as [`CollectorError`] and end the process;
//! everything raised once collection is running is logged where it happens.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a control-plane transport.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// Socket I/O failed.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Payload could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame did not follow the relay protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Payload does not fit in a single frame.
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The control plane refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// No reply within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The connection is gone.
    #[error("connection closed")]
    Closed,

    /// Handle was never issued or was already cancelled.
    #[error("unknown subscription handle {0}")]
    UnknownHandle(u64),
}

/// Errors raised by the dataset writer.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("cannot create dataset file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Append or flush after `close()`.
    #[error("dataset already closed")]
    Closed,
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Fatal errors that stop the collector before or during startup.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Discovery found nothing to subscribe to.
    #[error("no E2 nodes connected")]
    NoNodes,

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("control plane: {0}")]
    ControlPlane(#[from] ControlPlaneError),
}
