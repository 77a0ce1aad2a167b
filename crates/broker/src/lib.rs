//! Abstract interface for the message broker underneath the bus.
//!
//! The interface follows the AMQP 0-9-1 channel model: a [`Connection`] hands
//! out [`Channel`]s, channels declare topology, publish with confirms and
//! consume with explicit acknowledgement. Broker callbacks (confirms,
//! deliveries, cancellations and callback exceptions) are delivered through
//! handler traits registered on the channel.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod message;

pub use error::{BoxError, Error, Result};
pub use message::{BasicProperties, Confirm, Delivery, DeliveryMode, ExchangeKind, QueueOptions};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

/// Stable identity of a channel within its connection.
pub type ChannelId = u16;

/// A connection to the broker.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Opens a new channel.
    async fn create_channel(&self) -> Result<Arc<dyn Channel>>;
}

/// A lightweight session multiplexed over a connection.
///
/// A channel is not meant to be shared by concurrent publishers: the sequence
/// number returned by [`Channel::next_publish_seq_no`] is only meaningful for
/// the next [`Channel::basic_publish`] issued on the same channel.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// The channel number.
    fn id(&self) -> ChannelId;

    /// Sequence number the broker will assign to the next publish.
    fn next_publish_seq_no(&self) -> u64;

    /// Declares an exchange.
    async fn exchange_declare(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;

    /// Declares a queue.
    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<()>;

    /// Binds a queue to an exchange.
    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Puts the channel in confirm mode, reporting confirms to `handler`.
    async fn confirm_select(&self, handler: Arc<dyn ConfirmHandler>) -> Result<()>;

    /// Removes the confirm handler, if any.
    fn clear_confirm_handler(&self);

    /// Writes a message to an exchange.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &BasicProperties,
        body: Bytes,
    ) -> Result<()>;

    /// Starts consuming from a queue with manual acknowledgement.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<()>;

    /// Acknowledges a delivery.
    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;

    /// Rejects a delivery, optionally returning it to its queue.
    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Cancels a consumer. The consumer's handler is told once the broker
    /// has confirmed the cancellation.
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Registers the handler for exceptions raised by channel callbacks.
    fn set_callback_exception_handler(&self, handler: Arc<dyn CallbackExceptionHandler>);

    /// Removes the callback exception handler, if any.
    fn clear_callback_exception_handler(&self);

    /// Closes the channel.
    async fn close(&self) -> Result<()>;
}

/// Receives publisher confirms.
///
/// Called from the broker's own completion flow; implementations must not block.
pub trait ConfirmHandler: Send + Sync + 'static {
    /// Handles an ack or nack for one or more publishes on `channel`.
    fn handle_confirm(&self, channel: ChannelId, confirm: Confirm);
}

/// Receives deliveries for a consumer.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Handles one delivery. The broker does not push the next delivery to this
    /// consumer until the returned future completes.
    ///
    /// An error is a callback exception: the broker reports it to the channel's
    /// [`CallbackExceptionHandler`].
    async fn handle_delivery(&self, delivery: Delivery) -> std::result::Result<(), BoxError>;

    /// Called once the consumer has been cancelled, either on request or by
    /// the broker.
    async fn handle_cancel(&self, consumer_tags: &[String]);
}

/// Receives exceptions raised by channel callbacks.
pub trait CallbackExceptionHandler: Send + Sync + 'static {
    /// Handles an exception raised by a callback on `channel`.
    fn handle_callback_exception(&self, channel: ChannelId, error: &BoxError);
}
