//! Bounded condition polling.
//!
//! Every wait in the operator (namespace termination, pod readiness, version
//! endpoint, clone job completion) goes through [`poll_until`], so each has
//! an explicit attempt budget and a uniform timeout error.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// Poll `condition` every `interval` until it returns `Ok(true)`, for at
/// most `max_attempts` attempts. A condition error counts as a failed
/// attempt; waits must outlast transient API hiccups.
pub async fn poll_until<F, Fut>(
    what: &str,
    interval: Duration,
    max_attempts: u32,
    mut condition: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut last_err: Option<Error> = None;
    for attempt in 1..=max_attempts {
        match condition().await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                debug!(what, attempt, max_attempts, "condition not met yet");
            }
            Err(err) => {
                debug!(what, attempt, max_attempts, error = %err, "condition check failed");
                last_err = Some(err);
            }
        }
        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(match last_err {
        Some(err) => Error::Timeout(format!("{what} (last error: {err})")),
        None => Error::Timeout(what.to_string()),
    })
}

/// Like [`poll_until`], but the condition produces a value: `Ok(None)` means
/// "not yet", and the first `Ok(Some(v))` is returned.
pub async fn poll_for<T, F, Fut>(
    what: &str,
    interval: Duration,
    max_attempts: u32,
    mut produce: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let mut last_err: Option<Error> = None;
    for attempt in 1..=max_attempts {
        match produce().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {
                debug!(what, attempt, max_attempts, "not available yet");
            }
            Err(err) => {
                debug!(what, attempt, max_attempts, error = %err, "attempt failed");
                last_err = Some(err);
            }
        }
        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(match last_err {
        Some(err) => Error::Timeout(format!("{what} (last error: {err})")),
        None => Error::Timeout(what.to_string()),
    })
}
