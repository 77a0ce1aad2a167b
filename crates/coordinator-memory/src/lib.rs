//! In-memory (single node) liveness store for local development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use polybus_coordinator::{LivenessStore, live_since};
use tokio::sync::Mutex;

/// A score-ordered set of unique members.
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: i64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }

        self.ordered.insert((score, member.to_string()));
    }

    fn count_above(&self, min: i64) -> usize {
        match min.checked_add(1) {
            Some(from) => self.ordered.range((from, String::new())..).count(),
            None => 0,
        }
    }
}

/// In-memory liveness store.
///
/// Clones share the same sets.
#[derive(Clone, Debug, Default)]
pub struct MemoryLivenessStore {
    sets: Arc<Mutex<HashMap<String, SortedSet>>>,
}

impl MemoryLivenessStore {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The heartbeat of `node` under `key`, if any.
    pub async fn score(&self, key: &str, node: &str) -> Option<i64> {
        self.sets.lock().await.get(key)?.scores.get(node).copied()
    }

    /// Members of `key`, lowest score first.
    pub async fn members(&self, key: &str) -> Vec<(String, i64)> {
        self.sets.lock().await.get(key).map_or_else(Vec::new, |set| {
            set.ordered
                .iter()
                .map(|(score, member)| (member.clone(), *score))
                .collect()
        })
    }
}

#[async_trait]
impl LivenessStore for MemoryLivenessStore {
    type Error = Error;

    async fn renew(&self, key: &str, node: &str, now: i64) -> Result<(), Self::Error> {
        self.sets
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .insert(node, now);

        Ok(())
    }

    async fn count_live(
        &self,
        key: &str,
        now: i64,
        threshold: Duration,
    ) -> Result<u64, Self::Error> {
        let since = live_since(now, threshold);
        let sets = self.sets.lock().await;

        Ok(sets
            .get(key)
            .map_or(0, |set| set.count_above(since) as u64))
    }
}
