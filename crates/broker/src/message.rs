use std::collections::HashMap;

use bytes::Bytes;

/// Exchange routing types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes every message to every bound queue, ignoring the routing key.
    Fanout,

    /// Routes on exact routing key match.
    Direct,
}

/// Options for declaring a queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives a broker restart.
    pub durable: bool,

    /// Only usable by the declaring connection.
    pub exclusive: bool,

    /// Deleted when the last consumer goes away.
    pub auto_delete: bool,

    /// Extra arguments, such as `x-queue-type`.
    pub arguments: HashMap<String, String>,
}

impl QueueOptions {
    /// A durable, replicated quorum queue.
    #[must_use]
    pub fn quorum() -> Self {
        Self {
            durable: true,
            arguments: HashMap::from([("x-queue-type".to_string(), "quorum".to_string())]),
            ..Self::default()
        }
    }
}

/// How the broker stores a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Kept in memory only.
    #[default]
    Transient = 1,

    /// Written to disk.
    Persistent = 2,
}

/// Message properties carried next to the body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BasicProperties {
    /// Application-level message type.
    pub message_type: Option<String>,

    /// MIME type of the body.
    pub content_type: Option<String>,

    /// Storage mode.
    pub delivery_mode: DeliveryMode,
}

/// A message pushed to a consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Tag of the consumer receiving the message.
    pub consumer_tag: String,

    /// Channel-scoped identifier used to settle the message.
    pub delivery_tag: u64,

    /// Whether the message was delivered before.
    pub redelivered: bool,

    /// Exchange the message was published to.
    pub exchange: String,

    /// Routing key the message was published with.
    pub routing_key: String,

    /// Message properties.
    pub properties: BasicProperties,

    /// Message body.
    pub body: Bytes,
}

/// A publisher confirm.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Confirm {
    /// The confirmed sequence number.
    pub delivery_tag: u64,

    /// Whether every outstanding publish up to and including `delivery_tag`
    /// is confirmed.
    pub multiple: bool,

    /// `true` for an ack, `false` for a nack.
    pub ack: bool,
}
