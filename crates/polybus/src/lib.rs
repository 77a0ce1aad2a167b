//! Typed event bus abstractions: events, consumers and publishers.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod consumer;
mod descriptor;
mod error;
mod index;
mod outcome;
mod publisher;

pub use consumer::{ConsumeEvent, Descriptors, EventConsumer};
pub use descriptor::{ConsumerDescriptor, DecodedEvent};
pub use error::{BoxError, Error, Result};
pub use index::ConsumerIndex;
pub use outcome::Outcome;
pub use publisher::{EventPublisher, EventPublisherError};

/// Content type carried by every message published on the bus.
pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// An event that can travel on the bus.
///
/// Any protobuf message with a registered full name qualifies. The full name
/// is the wire type of the message and the key consumers are routed by, so it
/// must be globally unique per schema.
pub trait Event: prost::Message + prost::Name + Default + Clone + 'static {
    /// Returns the wire type name of the event.
    #[must_use]
    fn type_name() -> String {
        <Self as prost::Name>::full_name()
    }
}

impl<T> Event for T where T: prost::Message + prost::Name + Default + Clone + 'static {}
