//! Block bridge error types

use thiserror::Error;

/// Errors surfaced to the host for a logical request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Bad range, zero length, wrong direction
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Write attempted while this node is not allowed to accept writes
    #[error("Device is not primary")]
    Unauthoritative,

    /// Buffer mapping, staging allocation or queue capacity failed
    #[error("Insufficient resources: {0}")]
    ResourceExhausted(String),

    /// Device is being removed or was interrupted by teardown
    #[error("No such device")]
    DeviceGone,

    /// Device has no storage engine attached yet
    #[error("Device not set up yet")]
    NotReady,

    /// A submitted fragment failed in the storage engine
    #[error("Medium failure at sector {sector}: {reason}")]
    MediumFailure { sector: u64, reason: String },

    /// A fragment could not be queued after earlier fragments were
    #[error("Submission of fragment {fragment} failed: {reason}")]
    SubmissionFailed { fragment: usize, reason: String },
}

impl BridgeError {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Errors that may clear up without intervention
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unauthoritative | Self::ResourceExhausted(_) | Self::NotReady
        )
    }

    /// errno reported to NBD clients
    #[must_use]
    pub fn nbd_errno(&self) -> u32 {
        match self {
            Self::InvalidArgument(_) => 22,                // EINVAL
            Self::Unauthoritative => 1,                    // EPERM
            Self::ResourceExhausted(_) => 12,              // ENOMEM
            Self::DeviceGone | Self::NotReady => 19,       // ENODEV
            Self::MediumFailure { .. } | Self::SubmissionFailed { .. } => 5, // EIO
        }
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
