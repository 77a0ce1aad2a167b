//! Event bus over an AMQP-style broker.
//!
//! [`EventPublisher`] publishes events with publisher confirms and retries
//! nacked messages. [`EventListener`] subscribes a queue to the bus exchange
//! and hands deliveries to an [`EventReceiver`], which routes them to the
//! registered consumers and decides whether each message is acknowledged,
//! requeued or discarded.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod bus;
mod error;
mod lifetime;
mod listener;
mod options;
mod pending;
mod publisher;
mod receiver;
mod shutdown;

pub use bus::EventBus;
pub use error::{Error, Result};
pub use lifetime::ApplicationLifetime;
pub use listener::{EventListener, ListenerState};
pub use options::EventBusOptions;
pub use pending::{ConfirmTracker, PendingKey};
pub use publisher::EventPublisher;
pub use receiver::{EventReceiver, Settlement};
pub use shutdown::{ShutdownGuard, ShutdownPermit};
