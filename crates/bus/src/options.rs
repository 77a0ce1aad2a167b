use crate::error::{Error, Result};

/// Longest name the broker accepts for exchanges, queues and consumer tags.
const MAX_NAME_BYTES: usize = 255;

/// Options shared by the publisher and the listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventBusOptions {
    /// The fanout exchange every service of the bus publishes to.
    pub exchange: String,

    /// The queue this service consumes from. Unique per service.
    pub queue: String,

    /// Consumer tag of this service's subscription.
    pub tag: String,
}

impl EventBusOptions {
    /// Checks every name, reporting the first problem found.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOptions`] if a name is empty or too long.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("exchange", &self.exchange),
            ("queue", &self.queue),
            ("tag", &self.tag),
        ] {
            if value.is_empty() {
                return Err(Error::InvalidOptions(format!("{field} is required")));
            }

            if value.len() > MAX_NAME_BYTES {
                return Err(Error::InvalidOptions(format!(
                    "{field} is longer than {MAX_NAME_BYTES} bytes"
                )));
            }
        }

        Ok(())
    }
}
