//! Error taxonomy shared by the allocator, the task handlers and the stores.

use crate::lock::LockTarget;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Existing AZs disagree on the prefix length of a subnet group.
    #[error("subnet group {group:?} has differing sizes across AZs: /{first} vs /{second}")]
    ShapeMismatch { group: String, first: u8, second: u8 },

    #[error("no free /{prefix} block in {searched}")]
    NoSpaceAvailable { prefix: u8, searched: String },

    #[error("cloud API call {operation} failed: {message}")]
    CloudApi { operation: String, message: String },

    /// The container tree and the topology snapshot disagree.
    #[error("inconsistent inventory: {0}")]
    InconsistentInventory(String),

    #[error("timed out acquiring lock {target}")]
    LockTimeout { target: LockTarget },

    #[error("task cancelled: {0}")]
    Cancelled(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid CIDR {input:?}: {reason}")]
    InvalidCidr { input: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error on {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON in {path}")]
    Json {
        path: String,
        #[source]
        source: serde_path_to_error::Error<serde_json::Error>,
    },

    #[error("failed to serialize {what}")]
    Serialize {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub fn cloud(operation: &str, message: impl ToString) -> Self {
        Error::CloudApi {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }

    pub fn invalid_cidr(input: impl ToString, reason: impl ToString) -> Self {
        Error::InvalidCidr {
            input: input.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True when the task should go back on the queue rather than fail.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout { .. })
    }
}
