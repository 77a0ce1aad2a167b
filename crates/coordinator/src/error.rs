use crate::{CoordinatorError, LivenessStoreError};

use thiserror::Error;

/// Errors that can occur in the stale node coordinator.
#[derive(Debug, Error)]
pub enum Error<S>
where
    S: LivenessStoreError,
{
    /// The liveness store failed.
    #[error(transparent)]
    Store(S),

    /// The options are unusable.
    #[error("Invalid coordinator options: {0}")]
    InvalidOptions(String),

    /// The host name could not be determined and no node name was configured.
    #[error("Failed to resolve node name: {0}")]
    NodeName(String),

    /// The coordinator has been shut down.
    #[error("Coordinator has been shut down")]
    ShutDown,
}

impl<S> CoordinatorError for Error<S> where S: LivenessStoreError {}
