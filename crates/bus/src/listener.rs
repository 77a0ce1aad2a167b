use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::lifetime::ApplicationLifetime;
use crate::options::EventBusOptions;
use crate::receiver::EventReceiver;

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use polybus::{BoxError, ConsumerIndex, EventConsumer};
use polybus_broker::{
    CallbackExceptionHandler, Channel, ChannelId, Connection, Delivery, DeliveryHandler,
    QueueOptions,
};
use polybus_coordinator::QueueCoordinator;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of an [`EventListener`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerState {
    /// Constructed, not yet consuming.
    Created,

    /// Consuming from the queue.
    Started,

    /// Waiting for the broker to confirm the consumer is cancelled.
    Stopping,

    /// No longer consuming.
    Stopped,
}

impl Display for ListenerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };

        f.write_str(state)
    }
}

/// How a subscription ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Ended {
    Running,
    Requested,
    Unexpectedly,
}

/// Subscribes the service queue to the bus and feeds deliveries to an
/// [`EventReceiver`].
///
/// Losing the subscription for any reason other than [`EventListener::stop`]
/// is fatal: the listener asks the application to stop.
pub struct EventListener<C, L>
where
    C: QueueCoordinator,
    L: ApplicationLifetime,
{
    bus: EventBus,
    consumers: Arc<ConsumerIndex>,
    coordinator: Arc<C>,
    lifetime: Arc<L>,
    state: Mutex<ListenerState>,
    running: tokio::sync::Mutex<Option<Running<C, L>>>,
}

impl<C, L> fmt::Debug for EventListener<C, L>
where
    C: QueueCoordinator,
    L: ApplicationLifetime,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListener")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

struct Running<C, L>
where
    C: QueueCoordinator,
    L: ApplicationLifetime,
{
    channel: Arc<dyn Channel>,
    subscription: Arc<Subscription<C, L>>,
}

struct Subscription<C, L>
where
    C: QueueCoordinator,
    L: ApplicationLifetime,
{
    receiver: EventReceiver<C>,
    channel: Arc<dyn Channel>,
    tag: String,
    stopping: AtomicBool,
    faulted: AtomicBool,
    ended: watch::Sender<Ended>,
    cancellation: CancellationToken,
    lifetime: Arc<L>,
}

impl<C, L> EventListener<C, L>
where
    C: QueueCoordinator,
    L: ApplicationLifetime,
{
    /// Creates a listener for `consumers`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOptions`] for unusable options,
    /// [`Error::Consumers`] if two consumers claim the same event type and
    /// [`Error::NoConsumers`] if there is nothing to consume.
    pub fn new<I>(
        options: EventBusOptions,
        connection: Arc<dyn Connection>,
        consumers: I,
        coordinator: Arc<C>,
        lifetime: Arc<L>,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = Arc<dyn EventConsumer>>,
    {
        let bus = EventBus::new(options, connection)?;
        let consumers = ConsumerIndex::new(consumers)?;

        if consumers.is_empty() {
            return Err(Error::NoConsumers);
        }

        Ok(Self {
            bus,
            consumers: Arc::new(consumers),
            coordinator,
            lifetime,
            state: Mutex::new(ListenerState::Created),
            running: tokio::sync::Mutex::new(None),
        })
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    /// The consumers this listener dispatches to.
    #[must_use]
    pub fn consumers(&self) -> &ConsumerIndex {
        &self.consumers
    }

    /// Advertises every consumed event type, declares and binds the queue,
    /// and starts consuming.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the listener is
    /// [`ListenerState::Created`], [`Error::Coordinator`] if an event type
    /// cannot be advertised, and [`Error::Transport`] if the subscription
    /// cannot be set up.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;

        let state = self.state();
        if state != ListenerState::Created {
            return Err(Error::InvalidState {
                operation: "start",
                state,
            });
        }

        let mut event_types: Vec<&str> = self.consumers.event_types().collect();
        event_types.sort_unstable();

        for event_type in event_types {
            self.coordinator
                .register_supported_event(event_type)
                .await
                .map_err(Error::coordinator)?;
        }

        let channel = self.create_subscriber().await?;
        let options = self.bus.options();

        let cancellation = CancellationToken::new();
        let subscription = Arc::new(Subscription {
            receiver: EventReceiver::new(
                channel.clone(),
                self.consumers.clone(),
                self.coordinator.clone(),
                cancellation.clone(),
            ),
            channel: channel.clone(),
            tag: options.tag.clone(),
            stopping: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            ended: watch::Sender::new(Ended::Running),
            cancellation,
            lifetime: self.lifetime.clone(),
        });

        channel.set_callback_exception_handler(subscription.clone());

        if let Err(error) = channel
            .basic_consume(&options.queue, &options.tag, subscription.clone())
            .await
        {
            self.bus.close_channel(channel.as_ref()).await;
            return Err(error.into());
        }

        *running = Some(Running {
            channel,
            subscription,
        });
        *self.state.lock() = ListenerState::Started;

        info!(queue = %options.queue, tag = %options.tag, "listening for events");

        Ok(())
    }

    async fn create_subscriber(&self) -> Result<Arc<dyn Channel>> {
        let options = self.bus.options();
        let channel = self.bus.create_channel(true).await?;

        let setup = async {
            channel
                .queue_declare(&options.queue, QueueOptions::quorum())
                .await?;
            channel.queue_bind(&options.queue, &options.exchange, "").await
        };

        if let Err(error) = setup.await {
            self.bus.close_channel(channel.as_ref()).await;
            return Err(error.into());
        }

        Ok(channel)
    }

    /// Cancels the consumer, waits for the broker to confirm it, and closes
    /// the channel. Deliveries being handled finish first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the listener is
    /// [`ListenerState::Started`], and [`Error::Transport`] if the cancel
    /// cannot be sent.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;

        let Some(Running {
            channel,
            subscription,
        }) = running.take()
        else {
            return Err(Error::InvalidState {
                operation: "stop",
                state: self.state(),
            });
        };

        *self.state.lock() = ListenerState::Stopping;
        subscription.stopping.store(true, Ordering::SeqCst);

        let mut ended = subscription.ended.subscribe();
        let consuming = *ended.borrow() == Ended::Running;

        if consuming {
            match channel.basic_cancel(&subscription.tag).await {
                Ok(()) => {}
                // A faulted subscription cancels itself; the broker may have
                // dropped the consumer already.
                Err(polybus_broker::Error::ConsumerNotFound(_))
                    if subscription.faulted.load(Ordering::SeqCst) => {}
                Err(error) => {
                    subscription.stopping.store(false, Ordering::SeqCst);
                    *running = Some(Running {
                        channel,
                        subscription,
                    });
                    *self.state.lock() = ListenerState::Started;
                    return Err(error.into());
                }
            }

            let _ = ended.wait_for(|ended| *ended != Ended::Running).await;
        }

        subscription.cancellation.cancel();
        channel.clear_callback_exception_handler();
        self.bus.close_channel(channel.as_ref()).await;

        *self.state.lock() = ListenerState::Stopped;

        info!(tag = %subscription.tag, "stopped listening for events");

        Ok(())
    }
}

#[async_trait]
impl<C, L> DeliveryHandler for Subscription<C, L>
where
    C: QueueCoordinator,
    L: ApplicationLifetime,
{
    async fn handle_delivery(&self, delivery: Delivery) -> std::result::Result<(), BoxError> {
        self.receiver.receive(delivery).await?;

        Ok(())
    }

    async fn handle_cancel(&self, consumer_tags: &[String]) {
        if !matches!(consumer_tags, [tag] if *tag == self.tag) {
            warn!("Unknown message consumer {consumer_tags:?} was stopped.");
        }

        if self.stopping.load(Ordering::SeqCst) {
            self.ended.send_replace(Ended::Requested);
        } else if self.faulted.load(Ordering::SeqCst) {
            debug!(tag = %self.tag, "cancelled faulted consumer");
            self.ended.send_replace(Ended::Unexpectedly);
        } else {
            error!(fatal = true, tag = %self.tag, "The message consumer stopped unexpectedly.");
            self.ended.send_replace(Ended::Unexpectedly);
            self.cancellation.cancel();
            self.lifetime.stop_application();
        }
    }
}

impl<C, L> CallbackExceptionHandler for Subscription<C, L>
where
    C: QueueCoordinator,
    L: ApplicationLifetime,
{
    fn handle_callback_exception(&self, channel: ChannelId, error: &BoxError) {
        error!(fatal = true, channel, %error, "Unhandled exception occurred in a message channel callback.");
        self.faulted.store(true, Ordering::SeqCst);
        self.cancellation.cancel();
        self.cancel_consumer();
        self.lifetime.stop_application();
    }
}

impl<C, L> Subscription<C, L>
where
    C: QueueCoordinator,
    L: ApplicationLifetime,
{
    /// Stops taking deliveries on a channel whose state can no longer be
    /// trusted.
    fn cancel_consumer(&self) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(tag = %self.tag, "no runtime to cancel the faulted consumer on");
            return;
        };

        let channel = self.channel.clone();
        let tag = self.tag.clone();

        runtime.spawn(async move {
            if let Err(error) = channel.basic_cancel(&tag).await {
                warn!(%tag, %error, "failed to cancel faulted consumer");
            }
        });
    }
}
