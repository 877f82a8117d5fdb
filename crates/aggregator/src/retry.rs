//! Backoff policies for storage calls and peer polling.

use std::future::Future;
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use facilitator_core::{Classify, FailureClass};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{PeerPollConfig, RetryConfig};
use crate::PipelineError;

fn exponential(initial: Duration, max: Duration, elapsed: Duration) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_max_interval(max)
        .with_max_elapsed_time(Some(elapsed))
        .build()
}

/// Run `op`, retrying while it fails with a `Transient` error.
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    what: &str,
    mut op: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let policy = exponential(config.initial_interval(), config.max_interval(), config.max_elapsed());
    backoff::future::retry_notify(
        policy,
        || {
            let attempt = op();
            async move {
                attempt.await.map_err(|e| {
                    if e.class().is_retryable() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
        |e: PipelineError, wait: Duration| {
            warn!(op = what, error = %e, retry_in_ms = wait.as_millis() as u64, "transient failure");
        },
    )
    .await
}

/// Poll `op` until it stops reporting `NotReady`, the deadline passes or the
/// token is cancelled. Transient failures are retried on the same schedule.
pub async fn poll_until_ready<T, F, Fut>(
    config: &PeerPollConfig,
    what: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let policy = exponential(config.initial_interval(), config.max_interval(), config.deadline());
    let polling = backoff::future::retry_notify(
        policy,
        || {
            let attempt = op();
            async move {
                attempt.await.map_err(|e| match e.class() {
                    FailureClass::NotReady | FailureClass::Transient => {
                        backoff::Error::transient(e)
                    }
                    _ => backoff::Error::permanent(e),
                })
            }
        },
        |e: PipelineError, wait: Duration| {
            debug!(op = what, error = %e, retry_in_ms = wait.as_millis() as u64, "waiting for peer");
        },
    );

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        result = polling => result.map_err(|e| match e.class() {
            FailureClass::NotReady => PipelineError::PeerTimeout(what.to_string()),
            _ => e,
        }),
    }
}
