use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Event;
use crate::descriptor::ConsumerDescriptor;
use crate::outcome::Outcome;

/// Handles one event type.
///
/// A consumer implements this once per event type it understands and lists
/// those types in [`EventConsumer::describe`].
#[async_trait]
pub trait ConsumeEvent<E>
where
    Self: Send + Sync + 'static,
    E: Event,
{
    /// Consumes the event.
    ///
    /// The message is acknowledged only on [`Outcome::Success`]; anything else
    /// puts it back on the queue for another instance.
    async fn consume_event(&self, event: E, cancellation: CancellationToken) -> Outcome;
}

/// A registered consumer of events.
///
/// ```ignore
/// impl EventConsumer for Directory {
///     fn describe(self: Arc<Self>, descriptors: &mut Descriptors) {
///         descriptors.add::<Person, _>(&self);
///         descriptors.add::<AddressBook, _>(&self);
///     }
/// }
/// ```
pub trait EventConsumer
where
    Self: Send + Sync + 'static,
{
    /// Lists every event type this consumer handles.
    fn describe(self: Arc<Self>, descriptors: &mut Descriptors);
}

/// Collects the descriptors a consumer declares.
#[derive(Default)]
pub struct Descriptors {
    descriptors: Vec<ConsumerDescriptor>,
}

impl Descriptors {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that `consumer` handles events of type `E`.
    pub fn add<E, C>(&mut self, consumer: &Arc<C>) -> &mut Self
    where
        E: Event,
        C: EventConsumer + ConsumeEvent<E>,
    {
        self.descriptors
            .push(ConsumerDescriptor::new::<E, C>(consumer.clone()));
        self
    }

    /// Number of declared descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether nothing was declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub(crate) fn into_inner(self) -> Vec<ConsumerDescriptor> {
        self.descriptors
    }
}

impl std::fmt::Debug for Descriptors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.descriptors.iter().map(ConsumerDescriptor::event_type))
            .finish()
    }
}
