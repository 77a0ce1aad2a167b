use thiserror::Error;

/// Boxed error raised by broker callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by broker operations.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The channel has been closed.
    #[error("Channel {0} is closed")]
    ChannelClosed(u16),

    /// The connection to the broker is gone.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The exchange does not exist.
    #[error("Exchange '{0}' not found")]
    ExchangeNotFound(String),

    /// The queue does not exist.
    #[error("Queue '{0}' not found")]
    QueueNotFound(String),

    /// A consumer with the same tag already exists.
    #[error("Consumer tag '{0}' already in use")]
    ConsumerTagInUse(String),

    /// The consumer tag is unknown.
    #[error("Consumer '{0}' not found")]
    ConsumerNotFound(String),

    /// The delivery tag is unknown on this channel.
    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    /// A declaration conflicts with an existing entity.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Writing to the broker failed.
    #[error("Write failed: {0}")]
    Write(String),
}
