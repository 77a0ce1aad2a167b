use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::Event;
use crate::consumer::{ConsumeEvent, EventConsumer};
use crate::error::Error;
use crate::outcome::Outcome;

trait ErasedEvent: Any + Debug + Send {
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<E: Event> ErasedEvent for E {
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// An event decoded by a descriptor, waiting to be executed.
pub struct DecodedEvent {
    inner: Box<dyn ErasedEvent>,
}

impl DecodedEvent {
    fn new<E: Event>(event: E) -> Self {
        Self {
            inner: Box::new(event),
        }
    }

    /// Recovers the concrete event, or `None` if it is not an `E`.
    #[must_use]
    pub fn downcast<E: Event>(self) -> Option<E> {
        self.inner.into_any().downcast::<E>().ok().map(|event| *event)
    }
}

impl Debug for DecodedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

type Decoder = Arc<dyn Fn(Bytes) -> Result<DecodedEvent, Error> + Send + Sync>;

type Executor =
    Arc<dyn Fn(DecodedEvent, CancellationToken) -> BoxFuture<'static, Outcome> + Send + Sync>;

/// Binds one event type to the consumer that handles it.
///
/// Built once when the consumer index is constructed and never mutated.
#[derive(Clone)]
pub struct ConsumerDescriptor {
    instance: Arc<dyn EventConsumer>,
    event_type: String,
    decoder: Decoder,
    executor: Executor,
}

impl ConsumerDescriptor {
    /// Creates the descriptor for `consumer` handling events of type `E`.
    pub fn new<E, C>(consumer: Arc<C>) -> Self
    where
        E: Event,
        C: EventConsumer + ConsumeEvent<E>,
    {
        let event_type = E::type_name();

        let decoder: Decoder = {
            let event_type = event_type.clone();

            Arc::new(move |body: Bytes| {
                E::decode(body)
                    .map(DecodedEvent::new)
                    .map_err(|source| Error::Decode {
                        event_type: event_type.clone(),
                        source,
                    })
            })
        };

        let executor: Executor = {
            let consumer = consumer.clone();

            Arc::new(move |event: DecodedEvent, cancellation: CancellationToken| {
                let consumer = consumer.clone();

                async move {
                    match event.downcast::<E>() {
                        Some(event) => {
                            <C as ConsumeEvent<E>>::consume_event(&consumer, event, cancellation)
                                .await
                        }
                        None => Outcome::error(Error::EventTypeMismatch {
                            expected: E::type_name(),
                        }),
                    }
                }
                .boxed()
            })
        };

        Self {
            instance: consumer,
            event_type,
            decoder,
            executor,
        }
    }

    /// The consumer instance this descriptor dispatches to.
    #[must_use]
    pub const fn instance(&self) -> &Arc<dyn EventConsumer> {
        &self.instance
    }

    /// The wire type name of the event.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Decodes a message body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the body is not a valid encoding of the type.
    pub fn decode(&self, body: Bytes) -> Result<DecodedEvent, Error> {
        (self.decoder)(body)
    }

    /// Runs the consumer on a decoded event.
    pub fn execute(
        &self,
        event: DecodedEvent,
        cancellation: CancellationToken,
    ) -> BoxFuture<'static, Outcome> {
        (self.executor)(event, cancellation)
    }
}

impl Debug for ConsumerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerDescriptor")
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}
