//! Liveness store backed by Redis sorted sets.
//!
//! Heartbeats are written with `ZADD key score member` and counted with
//! `ZCOUNT key (min +inf`, so any number of nodes can share a key without
//! read-modify-write races.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::time::Duration;

use async_trait::async_trait;
use polybus_coordinator::{LivenessStore, live_since};
use redis::AsyncCommands;
use tracing::trace;

/// Options for configuring a `RedisLivenessStore`.
#[derive(Clone, Debug)]
pub struct RedisLivenessStoreConfig {
    /// Redis connection URL, such as `redis://127.0.0.1:6379`.
    pub url: String,
}

/// Liveness store backed by Redis.
#[derive(Clone, Debug)]
pub struct RedisLivenessStore {
    client: redis::Client,
}

impl RedisLivenessStore {
    /// Creates a new store. No connection is made until the first command.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn new(RedisLivenessStoreConfig { url }: RedisLivenessStoreConfig) -> Result<Self, Error> {
        let client = redis::Client::open(url.as_str()).map_err(Error::InvalidUrl)?;

        Ok(Self { client })
    }

    /// Creates a store from an existing client.
    #[must_use]
    pub const fn with_client(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LivenessStore for RedisLivenessStore {
    type Error = Error;

    async fn renew(&self, key: &str, node: &str, now: i64) -> Result<(), Self::Error> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let _: () = conn.zadd(key, node, now).await?;

        trace!(key, node, now, "renewed heartbeat");

        Ok(())
    }

    async fn count_live(
        &self,
        key: &str,
        now: i64,
        threshold: Duration,
    ) -> Result<u64, Self::Error> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let min = format!("({}", live_since(now, threshold));
        let live: u64 = conn.zcount(key, min, "+inf").await?;

        Ok(live)
    }
}
