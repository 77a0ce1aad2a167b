use polybus_coordinator::LivenessStoreError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
#[error("Liveness store error")]
pub struct Error;

impl LivenessStoreError for Error {}
