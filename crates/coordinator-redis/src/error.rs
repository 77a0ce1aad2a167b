use polybus_coordinator::LivenessStoreError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The Redis URL could not be parsed.
    #[error("Invalid Redis URL: {0}")]
    InvalidUrl(#[source] redis::RedisError),

    /// A Redis command or connection failed.
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

impl LivenessStoreError for Error {}
