use crate::listener::ListenerState;
use crate::pending::PendingKey;

use polybus::{BoxError, EventPublisherError};
use thiserror::Error;

/// Result type for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur on the event bus.
#[derive(Debug, Error)]
pub enum Error {
    /// The broker failed before accepting a message or command.
    #[error(transparent)]
    Transport(#[from] polybus_broker::Error),

    /// The publisher has been shut down.
    #[error("Event publisher has been disposed")]
    Disposed,

    /// The coordinator could not answer.
    #[error("Queue coordinator failed: {0}")]
    Coordinator(#[source] BoxError),

    /// Consumer registration failed.
    #[error(transparent)]
    Consumers(#[from] polybus::Error),

    /// A listener needs at least one consumer.
    #[error("No event consumers are registered")]
    NoConsumers,

    /// The options are unusable.
    #[error("Invalid event bus options: {0}")]
    InvalidOptions(String),

    /// The listener is not in a state that allows the operation.
    #[error("Cannot {operation} a listener that is {state}")]
    InvalidState {
        /// The attempted operation.
        operation: &'static str,

        /// The state the listener was in.
        state: ListenerState,
    },

    /// A sequence number was reused while its message was still pending.
    #[error("Message {0} is already pending")]
    DuplicatePending(PendingKey),

    /// A pending message was dropped without being confirmed or rejected.
    #[error("Confirmation for message {0} was lost")]
    ConfirmationLost(PendingKey),
}

impl Error {
    pub(crate) fn coordinator<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Coordinator(Box::new(error))
    }
}

impl EventPublisherError for Error {}
