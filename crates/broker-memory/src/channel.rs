use crate::{Inner, Routed, StoredMessage};

use std::collections::{BTreeMap, HashMap};
use std::pin::pin;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use polybus_broker::{
    BasicProperties, CallbackExceptionHandler, Channel, ChannelId, Confirm, ConfirmHandler,
    Delivery, DeliveryHandler, Error, ExchangeKind, QueueOptions, Result,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Default)]
struct ChannelState {
    confirms: Option<mpsc::UnboundedSender<Confirm>>,
    callback_exception: Option<Arc<dyn CallbackExceptionHandler>>,
    // consumer tag -> (queue, token)
    consumers: HashMap<String, (String, CancellationToken)>,
    // delivery tag -> (queue, message)
    unacked: BTreeMap<u64, (String, StoredMessage)>,
    next_delivery_tag: u64,
}

/// A channel on a [`crate::MemoryBroker`].
pub struct MemoryChannel {
    id: ChannelId,
    this: Weak<Self>,
    broker: Arc<Inner>,
    closed: AtomicBool,
    confirm_mode: AtomicBool,
    next_seq_no: AtomicU64,
    state: Mutex<ChannelState>,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MemoryChannel {
    pub(crate) fn new(id: ChannelId, broker: Arc<Inner>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            this: this.clone(),
            broker,
            closed: AtomicBool::new(false),
            confirm_mode: AtomicBool::new(false),
            next_seq_no: AtomicU64::new(1),
            state: Mutex::new(ChannelState::default()),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed(self.id));
        }

        Ok(())
    }

    fn send_confirm(&self, confirm: Confirm) {
        if let Some(confirms) = &self.state.lock().confirms {
            let _ = confirms.send(confirm);
        }
    }

    fn next_delivery(&self, queue: &str, consumer_tag: &str) -> Option<Delivery> {
        let message = self.broker.pop(queue)?;

        if self.closed.load(Ordering::SeqCst) {
            self.broker.requeue(queue, message);
            return None;
        }

        let mut state = self.state.lock();
        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;

        let delivery = Delivery {
            consumer_tag: consumer_tag.to_string(),
            delivery_tag,
            redelivered: message.redelivered,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            properties: message.properties.clone(),
            body: message.body.clone(),
        };

        state.unacked.insert(delivery_tag, (queue.to_string(), message));

        Some(delivery)
    }

    fn settle(&self, delivery_tag: u64, multiple: bool) -> Result<Vec<(String, StoredMessage)>> {
        let mut state = self.state.lock();

        if !state.unacked.contains_key(&delivery_tag) {
            return Err(Error::UnknownDeliveryTag(delivery_tag));
        }

        if multiple {
            let rest = state.unacked.split_off(&(delivery_tag + 1));
            let settled = std::mem::replace(&mut state.unacked, rest);
            Ok(settled.into_values().collect())
        } else {
            Ok(state.unacked.remove(&delivery_tag).into_iter().collect())
        }
    }

    fn raise_callback_exception(&self, error: &polybus_broker::BoxError) {
        let handler = self.state.lock().callback_exception.clone();

        match handler {
            Some(handler) => handler.handle_callback_exception(self.id, error),
            None => warn!(channel = self.id, %error, "unhandled callback exception"),
        }
    }

    async fn run_consumer(
        self: Arc<Self>,
        queue: String,
        consumer_tag: String,
        handler: Arc<dyn DeliveryHandler>,
        token: CancellationToken,
        notify: Arc<tokio::sync::Notify>,
    ) {
        loop {
            let mut notified = pin!(notify.notified());
            notified.as_mut().enable();

            if token.is_cancelled() {
                break;
            }

            if let Some(delivery) = self.next_delivery(&queue, &consumer_tag) {
                if let Err(error) = handler.handle_delivery(delivery).await {
                    self.raise_callback_exception(&error);
                }

                // A requeued delivery is ready at once; let other tasks in.
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                () = notified => {}
                () = token.cancelled() => break,
            }
        }

        self.broker.remove_consumer(&queue, &consumer_tag);
        self.state.lock().consumers.remove(&consumer_tag);

        if !self.closed.load(Ordering::SeqCst) {
            debug!(channel = self.id, %consumer_tag, "consumer cancelled");
            handler.handle_cancel(&[consumer_tag]).await;
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn next_publish_seq_no(&self) -> u64 {
        if self.confirm_mode.load(Ordering::SeqCst) {
            self.next_seq_no.load(Ordering::SeqCst)
        } else {
            0
        }
    }

    async fn exchange_declare(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.ensure_open()?;
        self.broker.declare_exchange(name, kind, durable)
    }

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.ensure_open()?;
        self.broker.declare_queue(name, options)
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.bind_queue(queue, exchange, routing_key)
    }

    async fn confirm_select(&self, handler: Arc<dyn ConfirmHandler>) -> Result<()> {
        self.ensure_open()?;

        let (sender, mut receiver) = mpsc::unbounded_channel::<Confirm>();
        let id = self.id;

        // Confirms arrive in order, off the publishing task.
        tokio::spawn(async move {
            while let Some(confirm) = receiver.recv().await {
                handler.handle_confirm(id, confirm);
            }
        });

        self.state.lock().confirms = Some(sender);
        self.confirm_mode.store(true, Ordering::SeqCst);

        Ok(())
    }

    fn clear_confirm_handler(&self) {
        self.state.lock().confirms = None;
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &BasicProperties,
        body: Bytes,
    ) -> Result<()> {
        self.ensure_open()?;

        if self.broker.take_publish_failure() {
            return Err(Error::Write("injected publish failure".to_string()));
        }

        let routed = self.broker.route(StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
            body,
            redelivered: false,
        })?;

        if self.confirm_mode.load(Ordering::SeqCst) {
            let delivery_tag = self.next_seq_no.fetch_add(1, Ordering::SeqCst);

            self.send_confirm(Confirm {
                delivery_tag,
                multiple: false,
                ack: matches!(routed, Routed::Delivered),
            });
        }

        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<()> {
        self.ensure_open()?;

        if self.state.lock().consumers.contains_key(consumer_tag) {
            return Err(Error::ConsumerTagInUse(consumer_tag.to_string()));
        }

        let token = CancellationToken::new();
        let notify = self.broker.add_consumer(queue, consumer_tag, token.clone())?;

        self.state
            .lock()
            .consumers
            .insert(consumer_tag.to_string(), (queue.to_string(), token.clone()));

        let this = self.this.upgrade().ok_or(Error::ChannelClosed(self.id))?;

        tokio::spawn(this.run_consumer(
            queue.to_string(),
            consumer_tag.to_string(),
            handler,
            token,
            notify,
        ));

        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.ensure_open()?;
        self.settle(delivery_tag, multiple)?;

        Ok(())
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.ensure_open()?;

        for (queue, message) in self.settle(delivery_tag, false)? {
            if requeue {
                self.broker.requeue(&queue, message);
            }
        }

        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()?;

        let state = self.state.lock();
        let (_, token) = state
            .consumers
            .get(consumer_tag)
            .ok_or_else(|| Error::ConsumerNotFound(consumer_tag.to_string()))?;

        token.cancel();

        Ok(())
    }

    fn set_callback_exception_handler(&self, handler: Arc<dyn CallbackExceptionHandler>) {
        self.state.lock().callback_exception = Some(handler);
    }

    fn clear_callback_exception_handler(&self) {
        self.state.lock().callback_exception = None;
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (consumers, unacked) = {
            let mut state = self.state.lock();
            state.confirms = None;
            state.callback_exception = None;

            (
                std::mem::take(&mut state.consumers),
                std::mem::take(&mut state.unacked),
            )
        };

        for (consumer_tag, (queue, token)) in consumers {
            token.cancel();
            self.broker.remove_consumer(&queue, &consumer_tag);
        }

        // Unacknowledged deliveries go back to their queues in order.
        for (queue, message) in unacked.into_values().rev() {
            self.broker.requeue(&queue, message);
        }

        self.broker.open_channels.fetch_sub(1, Ordering::SeqCst);

        debug!(channel = self.id, "closed channel");

        Ok(())
    }
}
