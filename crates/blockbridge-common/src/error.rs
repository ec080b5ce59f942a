//! Error types for blockbridge
//!
//! Errors raised while loading and validating configuration. I/O path
//! errors live in `blockbridge-block`.

use thiserror::Error;

/// Common result type for blockbridge configuration operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for blockbridge
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a deserialization error
    pub fn deserialization(msg: impl Into<String>) -> Self {
        Self::Deserialization(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::configuration("block_size must be a power of two");
        assert_eq!(
            err.to_string(),
            "configuration error: block_size must be a power of two"
        );
    }
}
