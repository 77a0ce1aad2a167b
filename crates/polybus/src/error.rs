use thiserror::Error;

/// Boxed error used at handler and transport boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for consumer registration.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building the consumer index or running descriptors.
#[derive(Debug, Error)]
pub enum Error {
    /// Two descriptors were built for the same event type.
    #[error("event type '{event_type}' is registered more than once")]
    DuplicateEventType {
        /// The wire type name.
        event_type: String,
    },

    /// A decoded event was handed to the executor of another type.
    #[error("expected event of type '{expected}'")]
    EventTypeMismatch {
        /// The wire type name the executor accepts.
        expected: String,
    },

    /// The payload could not be decoded as the declared type.
    #[error("failed to decode '{event_type}': {source}")]
    Decode {
        /// The wire type name.
        event_type: String,

        /// The protobuf decoding error.
        #[source]
        source: prost::DecodeError,
    },
}
