use crate::error::{Error, Result};

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use polybus::{ConsumerIndex, Outcome, PROTOBUF_CONTENT_TYPE};
use polybus_broker::{Channel, Delivery};
use polybus_coordinator::QueueCoordinator;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a delivery is settled with the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// Acknowledge, removing the message from the queue.
    Ack,

    /// Reject, optionally returning the message to the queue.
    Reject {
        /// Whether the message goes back to the queue.
        requeue: bool,
    },
}

impl Settlement {
    const REQUEUE: Self = Self::Reject { requeue: true };
    const DISCARD: Self = Self::Reject { requeue: false };
}

/// Decides the fate of each delivery and settles it.
pub struct EventReceiver<C>
where
    C: QueueCoordinator,
{
    channel: Arc<dyn Channel>,
    consumers: Arc<ConsumerIndex>,
    coordinator: Arc<C>,
    cancellation: CancellationToken,
}

impl<C> EventReceiver<C>
where
    C: QueueCoordinator,
{
    /// Creates a receiver settling deliveries on `channel`. Consumers get a
    /// child of `cancellation`.
    pub fn new(
        channel: Arc<dyn Channel>,
        consumers: Arc<ConsumerIndex>,
        coordinator: Arc<C>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            channel,
            consumers,
            coordinator,
            cancellation,
        }
    }

    /// Dispatches a delivery and settles it on the channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordinator`] if support for an unknown event type
    /// could not be checked, and [`Error::Transport`] if the settlement could
    /// not be sent. The delivery is left unsettled in both cases.
    pub async fn receive(&self, delivery: Delivery) -> Result<Settlement> {
        let settlement = self.dispatch(&delivery).await?;

        match settlement {
            Settlement::Ack => self.channel.basic_ack(delivery.delivery_tag, false).await?,
            Settlement::Reject { requeue } => {
                self.channel
                    .basic_reject(delivery.delivery_tag, requeue)
                    .await?;
            }
        }

        Ok(settlement)
    }

    /// Decides how a delivery is settled, running its consumer if there is one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordinator`] if support for an unknown event type
    /// could not be checked.
    pub async fn dispatch(&self, delivery: &Delivery) -> Result<Settlement> {
        let properties = &delivery.properties;

        let (Some(event_type), Some(content_type)) = (
            properties.message_type.as_deref().filter(|t| !t.is_empty()),
            properties.content_type.as_deref().filter(|t| !t.is_empty()),
        ) else {
            warn!(
                delivery_tag = delivery.delivery_tag,
                message_type = ?properties.message_type,
                content_type = ?properties.content_type,
                "Malformed message: missing type or content type."
            );
            return Ok(Settlement::DISCARD);
        };

        if !content_type.eq_ignore_ascii_case(PROTOBUF_CONTENT_TYPE) {
            warn!("Unsupported content type {content_type} for {event_type}.");
            return Ok(Settlement::REQUEUE);
        }

        let Some(descriptor) = self.consumers.get(event_type) else {
            return self.dispatch_unknown(event_type).await;
        };

        let event = match descriptor.decode(delivery.body.clone()) {
            Ok(event) => event,
            Err(error) => {
                warn!(%error, "Malformed message: failed to decode {event_type}.");
                return Ok(Settlement::DISCARD);
            }
        };

        info!("Consuming {event_type}: {event:?}");

        let outcome = AssertUnwindSafe(descriptor.execute(event, self.cancellation.child_token()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Outcome::error(panic_message(panic.as_ref())));

        Ok(match outcome {
            Outcome::Success => Settlement::Ack,
            Outcome::Failure => {
                debug!("Consumer declined {event_type}, returning it to the queue.");
                Settlement::REQUEUE
            }
            Outcome::Error(error) => {
                error!(%error, "Unhandled exception occurred while consuming {event_type}.");
                Settlement::REQUEUE
            }
        })
    }

    async fn dispatch_unknown(&self, event_type: &str) -> Result<Settlement> {
        let supported = tokio::select! {
            biased;
            () = self.cancellation.cancelled() => {
                debug!("Stopped checking support for {event_type}, returning it to the queue.");
                return Ok(Settlement::REQUEUE);
            }
            supported = self.coordinator.is_event_supported(event_type) => {
                supported.map_err(Error::coordinator)?
            }
        };

        if supported {
            info!("No local consumer for {event_type}, returning it to the queue for a live node.");
            Ok(Settlement::REQUEUE)
        } else {
            info!("No live consumer for {event_type}, discarding it.");
            Ok(Settlement::Ack)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .map_or_else(
            || "consumer panicked".to_string(),
            |message| format!("consumer panicked: {message}"),
        )
}
