//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("pool requires at least one credential")]
    NoCredentials,

    #[error("pool exhausted: all {total} credentials are disabled")]
    PoolExhausted { total: usize, disabled: usize },

    #[error("quota exhausted: {at_limit} of {total} credentials are at their monthly limit")]
    QuotaExhausted { total: usize, at_limit: usize },

    #[error("credential index {index} out of range (pool size {len})")]
    InvalidIndex { index: usize, len: usize },
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
