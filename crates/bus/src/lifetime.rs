use tokio_util::sync::CancellationToken;

/// The host process, as seen by the listener.
///
/// The listener asks for the whole application to stop when its subscription
/// dies underneath it, since it cannot keep receiving without one.
pub trait ApplicationLifetime: Send + Sync + 'static {
    /// Requests a graceful stop of the application.
    fn stop_application(&self);
}

impl ApplicationLifetime for CancellationToken {
    fn stop_application(&self) {
        self.cancel();
    }
}
