use crate::error::BoxError;

/// Result of handing one event to its consumer.
///
/// `Success` acknowledges the message. `Failure` and `Error` both return the
/// message to its queue so another instance can try it; `Error` additionally
/// carries the detail that gets logged.
#[derive(Debug)]
pub enum Outcome {
    /// The event was consumed.
    Success,

    /// The consumer declined the event.
    Failure,

    /// The consumer failed unexpectedly.
    Error(BoxError),
}

impl Outcome {
    /// Creates an `Error` outcome from any error value.
    pub fn error<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Error(error.into())
    }

    /// Returns `true` if the event was consumed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<bool> for Outcome {
    fn from(consumed: bool) -> Self {
        if consumed { Self::Success } else { Self::Failure }
    }
}

impl<E> From<Result<bool, E>> for Outcome
where
    E: Into<BoxError>,
{
    fn from(result: Result<bool, E>) -> Self {
        match result {
            Ok(consumed) => consumed.into(),
            Err(error) => Self::Error(error.into()),
        }
    }
}
