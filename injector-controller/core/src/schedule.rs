use std::time::Duration;
use thiserror::Error;

/// The outcome of a reconciler body, carrying scheduling intent instead of
/// leaving callers to inspect error types at runtime.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The target resource is intentionally gone or terminal. Treated as
    /// success; the key is not requeued.
    #[error("target resource no longer exists")]
    DoNotRequeue,

    /// Retry immediately. The wrapped error is logged but never propagated,
    /// so any accumulated backoff for the key is reset.
    #[error("requeueing: {source}")]
    RequeueNow {
        #[source]
        source: anyhow::Error,
    },

    /// Retry after exactly `after`, whether or not an error is attached.
    /// Used for disruption-budget draining and the periodic sync patterns.
    #[error("requeueing after {after:?}")]
    RequeueAfter {
        after: Duration,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Anything else: retry immediately with the error propagated, so the
    /// caller's exponential backoff grows on repeated failures.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ControllerError {
    pub fn requeue_now(source: impl Into<anyhow::Error>) -> Self {
        Self::RequeueNow {
            source: source.into(),
        }
    }

    pub fn requeue_after(after: Duration) -> Self {
        Self::RequeueAfter {
            after,
            source: None,
        }
    }

    pub fn requeue_after_with(after: Duration, source: impl Into<anyhow::Error>) -> Self {
        Self::RequeueAfter {
            after,
            source: Some(source.into()),
        }
    }
}

/// A scheduling decision, derived exhaustively from a reconcile result.
///
/// This is pure data; the runtime layer maps it onto the work queue
/// (`Stop` becomes the periodic resync, `Immediate { error: Some(_) }`
/// feeds the per-key backoff).
#[derive(Debug)]
pub enum Schedule {
    /// Done (or intentionally terminal); wait for the next event.
    Stop,
    /// Re-run the key now. `error` is set only when backoff should grow.
    Immediate { error: Option<anyhow::Error> },
    /// Re-run the key after a fixed delay.
    After(Duration),
}

impl Schedule {
    /// Classifies a reconcile result in priority order.
    pub fn from_result(res: Result<(), ControllerError>) -> Self {
        match res {
            Ok(()) => Self::Stop,
            Err(ControllerError::DoNotRequeue) => Self::Stop,
            Err(ControllerError::RequeueNow { source }) => {
                tracing::info!(error = %source, "Requeueing");
                Self::Immediate { error: None }
            }
            Err(ControllerError::RequeueAfter { after, source }) => {
                if let Some(error) = source {
                    tracing::info!(error = %error, ?after, "Requeueing after delay");
                }
                Self::After(after)
            }
            Err(ControllerError::Other(error)) => Self::Immediate { error: Some(error) },
        }
    }
}
