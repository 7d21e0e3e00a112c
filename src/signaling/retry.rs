use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Delay before retrying after an unexpected signaling failure. Empty polls
/// retry immediately.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(3);

/// Errors the retry layer can classify.
pub trait Transient {
    /// True when the failure is the service's "no data within the poll
    /// window" marker rather than a real error.
    fn is_empty_poll(&self) -> bool;
}

impl Transient for crate::error::SignalError {
    fn is_empty_poll(&self) -> bool {
        matches!(self, crate::error::SignalError::EmptyPoll)
    }
}

/// Runs one attempt of a poll or post.
///
/// Success yields the value. An empty poll yields `None` with no logging and
/// no delay. Any other failure is logged and charged one backoff interval
/// before yielding `None`, so a looping caller does not hammer a broken
/// service.
pub async fn poll_once<T, E, Fut>(attempt: Fut) -> Option<T>
where
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    match attempt.await {
        Ok(value) => Some(value),
        Err(err) if err.is_empty_poll() => None,
        Err(err) => {
            warn!(target: "signaling", error = %err, "signaling request failed; backing off");
            tokio::time::sleep(RETRY_BACKOFF).await;
            None
        }
    }
}

/// Repeats an operation until it succeeds.
///
/// Never gives up; callers that need a bound wrap this in
/// `tokio::time::timeout`. Attempts are strictly sequential, so there is
/// never more than one in-flight request per call site.
pub async fn call_with_retry<T, E, F, Fut>(mut operation: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    loop {
        if let Some(value) = poll_once(operation()).await {
            return value;
        }
    }
}
