use crate::error::Result;
use crate::options::EventBusOptions;

use std::sync::Arc;

use polybus_broker::{Channel, Connection, ExchangeKind};
use tracing::{debug, warn};

/// Broker connection and options shared by the publisher and the listener.
#[derive(Clone)]
pub struct EventBus {
    options: Arc<EventBusOptions>,
    connection: Arc<dyn Connection>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Creates a bus after validating `options`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidOptions`] if the options are unusable.
    pub fn new(options: EventBusOptions, connection: Arc<dyn Connection>) -> Result<Self> {
        options.validate()?;

        Ok(Self {
            options: Arc::new(options),
            connection,
        })
    }

    /// The bus options.
    #[must_use]
    pub fn options(&self) -> &EventBusOptions {
        &self.options
    }

    /// Opens a channel, optionally declaring the durable fanout exchange on it.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the channel cannot be opened or the
    /// exchange cannot be declared. The channel is closed in the latter case.
    pub async fn create_channel(&self, declare_exchange: bool) -> Result<Arc<dyn Channel>> {
        let channel = self.connection.create_channel().await?;

        if declare_exchange {
            if let Err(error) = channel
                .exchange_declare(&self.options.exchange, ExchangeKind::Fanout, true)
                .await
            {
                self.close_channel(channel.as_ref()).await;
                return Err(error.into());
            }
        }

        debug!(channel = channel.id(), "opened bus channel");

        Ok(channel)
    }

    /// Closes a channel, logging instead of failing.
    pub async fn close_channel(&self, channel: &dyn Channel) {
        if let Err(error) = channel.close().await {
            warn!(channel = channel.id(), %error, "failed to close channel");
        }
    }
}
