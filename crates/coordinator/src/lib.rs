//! Decentralized liveness protocol answering "does some live instance still
//! consume event type X?".
//!
//! Every node advertises the event types it consumes by periodically writing
//! a heartbeat into one sorted set per type (member = node name, score = UNIX
//! seconds). A type is supported while at least one heartbeat is newer than the
//! stale threshold.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod options;
mod stale;

pub use error::Error;
pub use options::QueueCoordinatorOptions;
pub use stale::StaleNodeCoordinator;

use std::error::Error as StdError;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

/// Marker trait for coordinator errors.
pub trait CoordinatorError: Debug + StdError + Send + Sync + 'static {}

/// Tracks which event types are consumed by live nodes.
#[async_trait]
pub trait QueueCoordinator: Send + Sync + 'static {
    /// The error type for the coordinator.
    type Error: CoordinatorError;

    /// Advertises that this node consumes `event_type`, and keeps advertising
    /// it until [`QueueCoordinator::shutdown`]. Registering a type twice is a
    /// no-op.
    async fn register_supported_event(&self, event_type: &str) -> Result<(), Self::Error>;

    /// Whether any node advertised `event_type` within the stale threshold.
    async fn is_event_supported(&self, event_type: &str) -> Result<bool, Self::Error>;

    /// Stops every renewal and waits for them to finish.
    async fn shutdown(&self);
}

/// Marker trait for liveness store errors.
pub trait LivenessStoreError: Debug + StdError + Send + Sync + 'static {}

/// Score-ordered storage for heartbeats.
#[async_trait]
pub trait LivenessStore: Send + Sync + 'static {
    /// The error type for the store.
    type Error: LivenessStoreError;

    /// Sets the heartbeat of `node` under `key` to `now` (UNIX seconds).
    async fn renew(&self, key: &str, node: &str, now: i64) -> Result<(), Self::Error>;

    /// Counts members of `key` whose heartbeat is newer than `now - threshold`.
    async fn count_live(&self, key: &str, now: i64, threshold: Duration)
    -> Result<u64, Self::Error>;
}

/// Lowest score still considered live.
///
/// Heartbeats strictly greater than the returned value are live.
#[must_use]
pub fn live_since(now: i64, threshold: Duration) -> i64 {
    let threshold = i64::try_from(threshold.as_secs()).unwrap_or(i64::MAX);

    now.saturating_sub(threshold)
}
