use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::options::EventBusOptions;
use crate::pending::{ConfirmTracker, PendingKey};
use crate::shutdown::ShutdownGuard;

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use polybus::{Event, PROTOBUF_CONTENT_TYPE};
use polybus_broker::{BasicProperties, Channel, Connection, DeliveryMode};
use tracing::{debug, error, info, warn};

/// Publishes events to the bus exchange with publisher confirms.
///
/// Channels are pooled and each one is used by a single publish at a time.
/// A publish returns once the broker acks the message. Nacked messages are
/// published again with a fresh sequence number until they are acked.
#[derive(Clone, Debug)]
pub struct EventPublisher {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    bus: EventBus,
    tracker: Arc<ConfirmTracker>,
    // most recently released first
    pool: Mutex<BTreeMap<Reverse<Instant>, PooledChannel>>,
    guard: ShutdownGuard,
    shutdown: tokio::sync::Mutex<bool>,
}

struct PooledChannel(Arc<dyn Channel>);

impl std::fmt::Debug for PooledChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledChannel").field(&self.0.id()).finish()
    }
}

/// A channel taken out of the pool. Goes back in on drop unless discarded.
struct ChannelLease<'a> {
    channel: Arc<dyn Channel>,
    inner: &'a Inner,
    discarded: bool,
}

impl ChannelLease<'_> {
    fn discard(mut self) -> Arc<dyn Channel> {
        self.discarded = true;
        self.channel.clone()
    }
}

impl Deref for ChannelLease<'_> {
    type Target = dyn Channel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl Drop for ChannelLease<'_> {
    fn drop(&mut self) {
        if !self.discarded {
            self.inner.release(self.channel.clone());
        }
    }
}

impl EventPublisher {
    /// Creates a publisher. Channels are opened on demand.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOptions`] if the options are unusable.
    pub fn new(options: EventBusOptions, connection: Arc<dyn Connection>) -> Result<Self> {
        Ok(Self::with_bus(EventBus::new(options, connection)?))
    }

    /// Creates a publisher on an existing bus.
    #[must_use]
    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                tracker: Arc::new(ConfirmTracker::new()),
                pool: Mutex::new(BTreeMap::new()),
                guard: ShutdownGuard::new(),
                shutdown: tokio::sync::Mutex::new(false),
            }),
        }
    }

    /// Publishes an event and waits for the broker to accept it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] once [`EventPublisher::shutdown`] has
    /// started, and [`Error::Transport`] if the message could not be written
    /// to the broker.
    pub async fn publish<E>(&self, event: &E) -> Result<()>
    where
        E: Event,
    {
        let Some(_permit) = self.inner.guard.try_acquire() else {
            return Err(Error::Disposed);
        };

        let channel = self.inner.acquire().await?;

        let event_type = E::type_name();
        let body = Bytes::from(event.encode_to_vec());
        let properties = BasicProperties {
            message_type: Some(event_type.clone()),
            content_type: Some(PROTOBUF_CONTENT_TYPE.to_string()),
            delivery_mode: DeliveryMode::Persistent,
        };

        loop {
            let key = PendingKey::new(channel.id(), channel.next_publish_seq_no());

            let Some(confirmation) = self.inner.tracker.register(key) else {
                return Err(Error::DuplicatePending(key));
            };

            if let Err(error) = channel
                .basic_publish(
                    &self.inner.bus.options().exchange,
                    "",
                    &properties,
                    body.clone(),
                )
                .await
            {
                self.inner.tracker.remove(key);

                // The channel state is unknown after a failed write.
                let channel = channel.discard();
                self.inner.close_channel(channel.as_ref()).await;

                return Err(Error::Transport(error));
            }

            match confirmation.await {
                Ok(true) => {
                    debug!(pending = %key, %event_type, "published event");
                    return Ok(());
                }
                Ok(false) => {
                    warn!(pending = %key, %event_type, "event rejected by the broker, publishing again");
                }
                Err(_) => return Err(Error::ConfirmationLost(key)),
            }
        }
    }

    /// Stops accepting publishes, waits for the in-flight ones to finish and
    /// closes every channel. Messages still waiting for a confirm are logged.
    ///
    /// Calling this more than once is a no-op.
    pub async fn shutdown(&self) {
        let mut shutdown = self.inner.shutdown.lock().await;

        if *shutdown {
            return;
        }

        self.inner.guard.drain().await;

        let channels = std::mem::take(&mut *self.inner.pool.lock());

        for PooledChannel(channel) in channels.into_values() {
            self.inner.close_channel(channel.as_ref()).await;
        }

        for key in self.inner.tracker.drain() {
            error!("Unconfirmed message {key}.");
        }

        *shutdown = true;

        info!("event publisher shut down");
    }

    /// Number of idle pooled channels.
    #[must_use]
    pub fn pooled_channels(&self) -> usize {
        self.inner.pool.lock().len()
    }

    /// Messages waiting for a broker confirm.
    #[must_use]
    pub fn outstanding(&self) -> Vec<PendingKey> {
        self.inner.tracker.outstanding()
    }
}

impl Inner {
    async fn acquire(&self) -> Result<ChannelLease<'_>> {
        let pooled = self.pool.lock().pop_first();

        let channel = match pooled {
            Some((_, PooledChannel(channel))) => channel,
            None => self.create_channel().await?,
        };

        Ok(ChannelLease {
            channel,
            inner: self,
            discarded: false,
        })
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        let channel = self.bus.create_channel(true).await?;

        if let Err(error) = channel.confirm_select(self.tracker.clone()).await {
            self.bus.close_channel(channel.as_ref()).await;
            return Err(error.into());
        }

        debug!(channel = channel.id(), "created publisher channel");

        Ok(channel)
    }

    /// Detaches the confirm handler before closing, so late confirms from
    /// the broker do not reach the tracker.
    async fn close_channel(&self, channel: &dyn Channel) {
        channel.clear_confirm_handler();
        self.bus.close_channel(channel).await;
    }

    fn release(&self, channel: Arc<dyn Channel>) {
        let mut pool = self.pool.lock();

        // Two releases can observe the same instant.
        loop {
            if let Entry::Vacant(entry) = pool.entry(Reverse(Instant::now())) {
                entry.insert(PooledChannel(channel));
                return;
            }
        }
    }
}

#[async_trait]
impl polybus::EventPublisher for EventPublisher {
    type Error = Error;

    async fn publish<E>(&self, event: &E) -> Result<(), Self::Error>
    where
        E: Event,
    {
        Self::publish(self, event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use assert_matches::assert_matches;
    use polybus_broker_memory::MemoryBroker;
    use polybus_example::Person;
    use tokio::time::timeout;
    use tracing_test::traced_test;

    fn options() -> EventBusOptions {
        EventBusOptions {
            exchange: "bus".to_string(),
            queue: "people".to_string(),
            tag: "people-1".to_string(),
        }
    }

    async fn bind_queue(broker: &MemoryBroker) {
        let channel = broker.connection().create_channel().await.unwrap();
        channel
            .exchange_declare("bus", polybus_broker::ExchangeKind::Fanout, true)
            .await
            .unwrap();
        channel
            .queue_declare("people", polybus_broker::QueueOptions::quorum())
            .await
            .unwrap();
        channel.queue_bind("people", "bus", "").await.unwrap();
        channel.close().await.unwrap();
    }

    fn person(id: i32) -> Person {
        Person {
            id,
            name: format!("person {id}"),
            ..Person::default()
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_publish_waits_for_ack() {
        let broker = MemoryBroker::new();
        bind_queue(&broker).await;
        let publisher = EventPublisher::new(options(), broker.connection()).unwrap();

        publisher.publish(&person(1)).await.unwrap();

        assert_eq!(broker.queue_len("people"), 1);
        assert_eq!(publisher.pooled_channels(), 1);
        assert!(publisher.outstanding().is_empty());
        assert!(logs_contain("is Acks by the broker."));

        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn test_channels_are_reused() {
        let broker = MemoryBroker::new();
        let publisher = EventPublisher::new(options(), broker.connection()).unwrap();

        for id in 0..5 {
            publisher.publish(&person(id)).await.unwrap();
        }

        assert_eq!(broker.open_channels(), 1);
        assert_eq!(broker.published_count("bus"), 5);

        publisher.shutdown().await;
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_nack_is_published_again() {
        let broker = MemoryBroker::new();
        bind_queue(&broker).await;
        let publisher = EventPublisher::new(options(), broker.connection()).unwrap();

        broker.nack_next_publishes(2);
        timeout(Duration::from_secs(1), publisher.publish(&person(7)))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(broker.queue_len("people"), 1);
        assert!(logs_contain("Message 2:1 is Nacks by the broker."));
        assert!(logs_contain("Message 2:2 is Nacks by the broker."));
        assert!(logs_contain("Message 2:3 is Acks by the broker."));

        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_failure_is_a_transport_error() {
        let broker = MemoryBroker::new();
        let publisher = EventPublisher::new(options(), broker.connection()).unwrap();

        broker.fail_next_publishes(1);

        assert_matches!(
            publisher.publish(&person(1)).await,
            Err(Error::Transport(polybus_broker::Error::Write(_)))
        );
        assert!(publisher.outstanding().is_empty());
        assert_eq!(publisher.pooled_channels(), 0);
        assert_eq!(broker.open_channels(), 0);

        publisher.publish(&person(2)).await.unwrap();
        assert_eq!(broker.published_count("bus"), 1);

        publisher.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_shutdown_reports_unconfirmed_messages() {
        let broker = MemoryBroker::new();
        let publisher = EventPublisher::new(options(), broker.connection()).unwrap();

        publisher.publish(&person(1)).await.unwrap();

        let confirmation = publisher
            .inner
            .tracker
            .register(PendingKey::new(1, 2))
            .unwrap();
        assert_eq!(publisher.outstanding(), vec![PendingKey::new(1, 2)]);

        publisher.shutdown().await;

        assert!(logs_contain("Unconfirmed message 1:2."));
        assert!(publisher.outstanding().is_empty());
        assert!(confirmation.await.is_err());
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_is_disposed() {
        let broker = MemoryBroker::new();
        let publisher = EventPublisher::new(options(), broker.connection()).unwrap();

        publisher.publish(&person(1)).await.unwrap();
        publisher.shutdown().await;
        publisher.shutdown().await;

        assert_matches!(publisher.publish(&person(2)).await, Err(Error::Disposed));
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_publish_through_trait() {
        async fn publish_via<P: polybus::EventPublisher>(publisher: &P) -> bool {
            publisher.publish(&person(3)).await.is_ok()
        }

        let broker = MemoryBroker::new();
        let publisher = EventPublisher::new(options(), broker.connection()).unwrap();

        assert!(publish_via(&publisher).await);

        publisher.shutdown().await;
    }
}
