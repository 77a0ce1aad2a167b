use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use parking_lot::Mutex;
use polybus_broker::{ChannelId, Confirm, ConfirmHandler};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Identifies one in-flight publish.
///
/// Ordered by channel, then delivery tag, so every pending message of a
/// channel up to a given tag is one contiguous range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PendingKey {
    /// The channel the message was published on.
    pub channel: ChannelId,

    /// The publish sequence number on that channel.
    pub delivery_tag: u64,
}

impl PendingKey {
    /// Creates a key.
    #[must_use]
    pub const fn new(channel: ChannelId, delivery_tag: u64) -> Self {
        Self {
            channel,
            delivery_tag,
        }
    }
}

impl Display for PendingKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.delivery_tag)
    }
}

/// Outstanding publishes waiting for a broker confirm.
///
/// Each registered message is resolved at most once: lookup and removal
/// happen under the same lock, and resolution happens after it is released.
#[derive(Debug, Default)]
pub struct ConfirmTracker {
    pending: Mutex<BTreeMap<PendingKey, oneshot::Sender<bool>>>,
}

impl ConfirmTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a message. The receiver resolves to `true` on ack and
    /// `false` on nack.
    ///
    /// Returns `None` if the key is already pending.
    pub fn register(&self, key: PendingKey) -> Option<oneshot::Receiver<bool>> {
        let mut pending = self.pending.lock();

        if pending.contains_key(&key) {
            return None;
        }

        let (sender, receiver) = oneshot::channel();
        pending.insert(key, sender);

        Some(receiver)
    }

    /// Stops tracking a message that never reached the broker.
    pub fn remove(&self, key: PendingKey) -> bool {
        let removed = self.pending.lock().remove(&key).is_some();

        if !removed {
            warn!(pending = %key, "Trying to remove non-existent pending message");
        }

        removed
    }

    /// Resolves the messages a confirm covers: `last` alone, or with
    /// `multiple` every pending message of `channel` up to and including
    /// `last`. Returns how many were resolved.
    pub fn complete(&self, channel: ChannelId, last: u64, multiple: bool, confirmed: bool) -> usize {
        let highest = PendingKey::new(channel, last);
        let lowest = PendingKey::new(channel, if multiple { 0 } else { last });

        let resolved: Vec<_> = {
            let mut pending = self.pending.lock();
            let keys: Vec<PendingKey> = pending.range(lowest..=highest).map(|(key, _)| *key).collect();

            keys.into_iter()
                .filter_map(|key| pending.remove(&key).map(|sender| (key, sender)))
                .collect()
        };

        let status = if confirmed { "Acks" } else { "Nacks" };

        if resolved.is_empty() {
            if multiple {
                error!("Unknown multiple messages is {status} with the highest message is {highest}.");
            } else {
                error!("Unknown message {highest} is {status}.");
            }
        }

        let count = resolved.len();

        for (key, sender) in resolved {
            // The publisher may have given up waiting.
            let _ = sender.send(confirmed);
            info!("Message {key} is {status} by the broker.");
        }

        count
    }

    /// Messages still waiting for a confirm, in order.
    #[must_use]
    pub fn outstanding(&self) -> Vec<PendingKey> {
        self.pending.lock().keys().copied().collect()
    }

    /// Stops tracking everything, returning what was pending. Waiters observe
    /// a closed channel.
    pub fn drain(&self) -> Vec<PendingKey> {
        std::mem::take(&mut *self.pending.lock())
            .into_keys()
            .collect()
    }

    /// Number of messages waiting for a confirm.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether nothing is waiting for a confirm.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl ConfirmHandler for ConfirmTracker {
    fn handle_confirm(&self, channel: ChannelId, confirm: Confirm) {
        self.complete(channel, confirm.delivery_tag, confirm.multiple, confirm.ack);
    }
}
