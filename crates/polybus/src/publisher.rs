use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;

use crate::Event;

/// Marker trait for publisher errors
pub trait EventPublisherError: Debug + Error + Send + Sync + 'static {}

/// A trait representing something that can put events on the bus.
#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    /// The error type for the publisher.
    type Error: EventPublisherError;

    /// Publishes an event, returning once the broker has durably accepted it.
    async fn publish<E: Event>(&self, event: &E) -> Result<(), Self::Error>;
}
