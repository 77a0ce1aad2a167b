//! In-memory (single process) broker for local development and tests.
//!
//! Supports fanout and direct exchanges, durable queues, publisher confirms,
//! manual acknowledgement with requeue, and consumer cancellation. A few
//! fault injection hooks let tests drive the unhappy paths of a real broker.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod channel;

pub use channel::MemoryChannel;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use polybus_broker::{
    BasicProperties, Channel, Connection, Error, ExchangeKind, QueueOptions, Result,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Debug)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    body: Bytes,
    redelivered: bool,
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    // (queue, routing key)
    bindings: HashSet<(String, String)>,
}

#[derive(Debug)]
struct Queue {
    options: QueueOptions,
    messages: VecDeque<StoredMessage>,
    consumers: HashMap<String, CancellationToken>,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    published: HashMap<String, u64>,
    nack_next: usize,
    fail_next: usize,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    next_channel_id: AtomicU16,
    open_channels: AtomicUsize,
}

enum Routed {
    Delivered,
    Nacked,
}

/// In-memory broker connection.
///
/// Clones share the same broker.
#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Creates a new, empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection to this broker.
    #[must_use]
    pub fn connection(&self) -> Arc<dyn Connection> {
        Arc::new(self.clone())
    }

    /// Number of ready (not yet delivered) messages in a queue.
    #[must_use]
    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.messages.len())
    }

    /// Number of consumers attached to a queue.
    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.consumers.len())
    }

    /// Whether an exchange has been declared.
    #[must_use]
    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.inner.state.lock().exchanges.contains_key(exchange)
    }

    /// Options a queue was declared with.
    #[must_use]
    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|queue| queue.options.clone())
    }

    /// Number of messages an exchange accepted and routed.
    #[must_use]
    pub fn published_count(&self, exchange: &str) -> u64 {
        self.inner
            .state
            .lock()
            .published
            .get(exchange)
            .copied()
            .unwrap_or_default()
    }

    /// Number of channels currently open.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.inner.open_channels.load(Ordering::SeqCst)
    }

    /// Makes the broker nack the next `count` publishes without routing them.
    pub fn nack_next_publishes(&self, count: usize) {
        self.inner.state.lock().nack_next += count;
    }

    /// Makes the next `count` publishes fail before reaching the broker.
    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.state.lock().fail_next += count;
    }

    /// Cancels every consumer of a queue from the broker side, as happens when
    /// the queue is deleted or its leader moves.
    pub fn cancel_consumers(&self, queue: &str) {
        let state = self.inner.state.lock();

        if let Some(queue) = state.queues.get(queue) {
            for token in queue.consumers.values() {
                token.cancel();
            }
        }
    }
}

impl Inner {
    fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(existing) = state.exchanges.get(name) {
            if existing.kind != kind || existing.durable != durable {
                return Err(Error::PreconditionFailed(format!(
                    "exchange '{name}' already declared with different settings"
                )));
            }

            return Ok(());
        }

        debug!(exchange = name, ?kind, durable, "declared exchange");

        state.exchanges.insert(
            name.to_string(),
            Exchange {
                kind,
                durable,
                bindings: HashSet::new(),
            },
        );

        Ok(())
    }

    fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(existing) = state.queues.get(name) {
            if existing.options != options {
                return Err(Error::PreconditionFailed(format!(
                    "queue '{name}' already declared with different settings"
                )));
            }

            return Ok(());
        }

        debug!(queue = name, durable = options.durable, "declared queue");

        state.queues.insert(
            name.to_string(),
            Queue {
                options,
                messages: VecDeque::new(),
                consumers: HashMap::new(),
                notify: Arc::new(Notify::new()),
            },
        );

        Ok(())
    }

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.state.lock();

        if !state.queues.contains_key(queue) {
            return Err(Error::QueueNotFound(queue.to_string()));
        }

        let exchange = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| Error::ExchangeNotFound(exchange.to_string()))?;

        exchange
            .bindings
            .insert((queue.to_string(), routing_key.to_string()));

        Ok(())
    }

    fn take_publish_failure(&self) -> bool {
        let mut state = self.state.lock();

        if state.fail_next > 0 {
            state.fail_next -= 1;
            true
        } else {
            false
        }
    }

    fn route(&self, message: StoredMessage) -> Result<Routed> {
        let mut state = self.state.lock();

        let exchange = state
            .exchanges
            .get(&message.exchange)
            .ok_or_else(|| Error::ExchangeNotFound(message.exchange.clone()))?;

        let targets: Vec<String> = exchange
            .bindings
            .iter()
            .filter(|(_, key)| exchange.kind == ExchangeKind::Fanout || *key == message.routing_key)
            .map(|(queue, _)| queue.clone())
            .collect();

        if state.nack_next > 0 {
            state.nack_next -= 1;
            return Ok(Routed::Nacked);
        }

        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.messages.push_back(message.clone());
                queue.notify.notify_waiters();
            }
        }

        *state.published.entry(message.exchange).or_default() += 1;

        Ok(Routed::Delivered)
    }

    fn add_consumer(&self, queue: &str, tag: &str, token: CancellationToken) -> Result<Arc<Notify>> {
        let mut state = self.state.lock();

        let queue = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;

        if queue.consumers.contains_key(tag) {
            return Err(Error::ConsumerTagInUse(tag.to_string()));
        }

        queue.consumers.insert(tag.to_string(), token);

        Ok(queue.notify.clone())
    }

    fn remove_consumer(&self, queue: &str, tag: &str) {
        if let Some(queue) = self.state.lock().queues.get_mut(queue) {
            queue.consumers.remove(tag);
        }
    }

    fn pop(&self, queue: &str) -> Option<StoredMessage> {
        self.state
            .lock()
            .queues
            .get_mut(queue)
            .and_then(|queue| queue.messages.pop_front())
    }

    fn requeue(&self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;

        if let Some(queue) = self.state.lock().queues.get_mut(queue) {
            queue.messages.push_front(message);
            queue.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl Connection for MemoryBroker {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        // Ids run 1..=u16::MAX and wrap; 0 is never handed out.
        let (Ok(last) | Err(last)) =
            self.inner
                .next_channel_id
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                    Some(last % u16::MAX + 1)
                });
        let id = last % u16::MAX + 1;
        self.inner.open_channels.fetch_add(1, Ordering::SeqCst);

        debug!(channel = id, "opened channel");

        Ok(MemoryChannel::new(id, self.inner.clone()))
    }
}
