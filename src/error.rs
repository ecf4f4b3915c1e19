use std::{any::Any, sync::Arc};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a call did not produce a value.
///
/// Errors are cloneable because a single cause is observed by every party
/// watching the cancelled context.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// The group was stopped; nothing was enqueued.
    #[error("group closed")]
    Closed,
    /// The context was cancelled without a more specific cause.
    #[error("context canceled")]
    Canceled,
    /// A deadline attached to the context passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    /// The batch function (or keyed job) panicked while this request was outstanding.
    #[error("batch function panicked: {0}")]
    Panicked(Arc<str>),
    /// The batch function returned without fulfilling or cancelling the request.
    #[error("request dropped without a result")]
    Unfulfilled,
    /// A cause supplied through [`Request::cancel`](crate::Request::cancel).
    #[error(transparent)]
    Cause(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap any error (or message) as a cancellation cause.
    pub fn cause<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Cause(Arc::from(err.into()))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    /// True for the two plain context outcomes: `Canceled` and `DeadlineExceeded`.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled | Error::DeadlineExceeded)
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message: Arc<str> = if let Some(s) = payload.downcast_ref::<&'static str>() {
            Arc::from(*s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Arc::from(s.as_str())
        } else {
            Arc::from("Box<dyn Any>")
        };
        Error::Panicked(message)
    }
}
