// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Polling for a condition to become true
//!
//! Orchestrator tests drive background work (workers, lease reapers, job
//! runners) that finishes on its own schedule.  [`wait_for_condition`]
//! re-checks a caller-supplied condition until it holds, fails permanently, or
//! a deadline passes.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Result of one check of a condition
#[derive(Debug, thiserror::Error)]
pub enum CondCheckError<E> {
    /// the condition failed in a way that retrying won't fix
    #[error("poll condition failed: {0}")]
    Failed(E),
    /// the condition does not hold yet
    #[error("poll condition not yet ready")]
    NotYet,
}

#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("permanent error")]
    PermanentError(#[source] E),
}

/// Checks `cond` every `poll_interval` until it returns `Ok` or a permanent
/// error, giving up after `poll_max`
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    loop {
        let duration = Instant::now().duration_since(poll_start);
        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e))
            }
            Err(CondCheckError::NotYet) => (),
        }
        if duration > *poll_max {
            return Err(Error::TimedOut(duration));
        }
        tokio::time::sleep(*poll_interval).await;
    }
}
