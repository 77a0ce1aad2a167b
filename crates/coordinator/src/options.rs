use std::time::Duration;

/// Options for [`crate::StaleNodeCoordinator`].
#[derive(Clone, Debug)]
pub struct QueueCoordinatorOptions {
    /// Prefix of every sorted set key. Must be the same on every instance of
    /// the same logical service.
    pub key_prefix: String,

    /// Name this node advertises itself with. Defaults to the host name.
    pub node_name: Option<String>,

    /// Age after which a heartbeat no longer counts.
    pub stale_threshold: Duration,

    /// How often heartbeats are written.
    pub renew_interval: Duration,
}

impl QueueCoordinatorOptions {
    /// Default stale threshold.
    pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

    /// Default renew interval.
    pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(3 * 60);

    /// Options with the given key prefix and default timings.
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            node_name: None,
            stale_threshold: Self::DEFAULT_STALE_THRESHOLD,
            renew_interval: Self::DEFAULT_RENEW_INTERVAL,
        }
    }

    /// Checks the options, reporting the first problem found.
    ///
    /// # Errors
    ///
    /// Returns a description of the invalid option.
    pub fn validate(&self) -> Result<(), String> {
        if self.key_prefix.is_empty() {
            return Err("key_prefix is required".to_string());
        }

        if matches!(&self.node_name, Some(name) if name.is_empty()) {
            return Err("node_name must not be empty".to_string());
        }

        if self.renew_interval.is_zero() {
            return Err("renew_interval must be positive".to_string());
        }

        if self.renew_interval >= self.stale_threshold {
            return Err("renew_interval must be shorter than stale_threshold".to_string());
        }

        Ok(())
    }
}
