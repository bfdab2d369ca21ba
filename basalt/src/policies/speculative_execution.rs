//! Speculative execution launches parallel attempts of the same request
//! against subsequent nodes of the plan when the current attempt takes too
//! long, reducing tail latency. The first successful response wins; losing
//! fibers are dropped and their stream ids are reclaimed by the orphan
//! mechanism of their connections.

use futures::{
    future::FutureExt,
    stream::{FuturesUnordered, StreamExt},
};
use std::{future::Future, time::Duration};
use tracing::{trace_span, Instrument};

use crate::errors::{NoHostAvailableError, QueryError};

/// Decides whether and when additional speculative fibers are started.
pub trait SpeculativeExecutionPolicy: std::fmt::Debug + Send + Sync {
    /// The maximum number of speculative executions triggered for a single
    /// request, not counting the initial one.
    fn max_retry_count(&self) -> usize;

    /// The delay between consecutive speculative executions.
    fn retry_interval(&self) -> Duration;
}

/// Schedules a fixed number of speculative executions, separated by a
/// constant delay.
#[derive(Debug, Clone)]
pub struct SimpleSpeculativeExecutionPolicy {
    pub max_retry_count: usize,
    pub retry_interval: Duration,
}

impl SpeculativeExecutionPolicy for SimpleSpeculativeExecutionPolicy {
    fn max_retry_count(&self) -> usize {
        self.max_retry_count
    }

    fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
}

/// Checks if a result produced by one speculative fiber can be ignored in
/// favour of results from the remaining fibers.
///
/// Errors tied to the contacted node can be ignored; errors that would
/// reproduce on every node cannot.
fn can_be_ignored<ResT>(result: &Result<ResT, QueryError>) -> bool {
    match result {
        Ok(_) => false,
        Err(e) => match e {
            QueryError::BrokenConnection(_)
            | QueryError::UnableToAllocStreamId
            | QueryError::IoError(_) => true,
            QueryError::DbError(db_error, _) => db_error.can_speculative_retry(),
            _ => false,
        },
    }
}

pub(crate) async fn execute<QueryFut, ResT>(
    policy: &dyn SpeculativeExecutionPolicy,
    mut query_runner_generator: impl FnMut(bool) -> QueryFut,
) -> Result<ResT, QueryError>
where
    QueryFut: Future<Output = Option<Result<ResT, QueryError>>>,
{
    let mut retries_remaining = policy.max_retry_count();
    let retry_interval = policy.retry_interval();

    let mut async_tasks = FuturesUnordered::new();
    async_tasks.push(
        query_runner_generator(false)
            .instrument(trace_span!("Speculative execution: original request")),
    );

    let sleep = tokio::time::sleep(retry_interval).fuse();
    tokio::pin!(sleep);

    let mut last_error = None;
    loop {
        futures::select! {
            _ = &mut sleep => {
                if retries_remaining > 0 {
                    async_tasks.push(
                        query_runner_generator(true)
                            .instrument(trace_span!("Speculative execution", retries_remaining)),
                    );
                    retries_remaining -= 1;

                    // Reset the timer for the next speculative fiber.
                    sleep.set(tokio::time::sleep(retry_interval).fuse());
                }
            }
            res = async_tasks.select_next_some() => {
                if let Some(r) = res {
                    if !can_be_ignored(&r) {
                        return r;
                    } else {
                        last_error = Some(r)
                    }
                } else {
                    // None is returned only when the plan was exhausted;
                    // there is no point in starting any more fibers, but
                    // running ones may still produce a response.
                    retries_remaining = 0;
                }
                if async_tasks.is_empty() && retries_remaining == 0 {
                    return last_error.unwrap_or(Err(QueryError::NoHostAvailable(
                        NoHostAvailableError::default(),
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BrokenConnectionError;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ignorable_error() -> QueryError {
        QueryError::BrokenConnection(BrokenConnectionError::ChannelError)
    }

    fn fatal_error() -> QueryError {
        QueryError::ProtocolError("test")
    }

    #[test]
    fn ignorable_error_classification() {
        assert!(can_be_ignored::<()>(&Err(ignorable_error())));
        assert!(can_be_ignored::<()>(&Err(QueryError::UnableToAllocStreamId)));
        assert!(can_be_ignored::<()>(&Err(QueryError::DbError(
            crate::errors::DbError::Overloaded,
            String::new()
        ))));

        assert!(!can_be_ignored(&Ok(())));
        assert!(!can_be_ignored::<()>(&Err(fatal_error())));
        assert!(!can_be_ignored::<()>(&Err(QueryError::DbError(
            crate::errors::DbError::SyntaxError,
            String::new()
        ))));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn first_success_wins() {
        let policy = SimpleSpeculativeExecutionPolicy {
            max_retry_count: 2,
            retry_interval: Duration::from_millis(10),
        };

        let attempts = Arc::new(AtomicUsize::new(0));
        let result: Result<usize, QueryError> = execute(&policy, |_is_speculative| {
            let attempts = attempts.clone();
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                if attempt == 0 {
                    // The initial fiber stalls longer than the speculative
                    // delay, so a speculative fiber starts and wins.
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Some(Err(ignorable_error()))
                } else {
                    Some(Ok(attempt))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn fatal_error_short_circuits() {
        let policy = SimpleSpeculativeExecutionPolicy {
            max_retry_count: 5,
            retry_interval: Duration::from_millis(10),
        };

        let result: Result<usize, QueryError> =
            execute(&policy, |_| async { Some(Err(fatal_error())) }).await;
        assert_matches!(result, Err(QueryError::ProtocolError(_)));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn exhausted_plan_returns_last_error() {
        let policy = SimpleSpeculativeExecutionPolicy {
            max_retry_count: 3,
            retry_interval: Duration::from_millis(10),
        };

        let first = AtomicUsize::new(0);
        let result: Result<usize, QueryError> = execute(&policy, |_| {
            let is_first = first.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if is_first {
                    Some(Err(ignorable_error()))
                } else {
                    // Plan exhausted.
                    None
                }
            }
        })
        .await;

        assert_matches!(result, Err(QueryError::BrokenConnection(_)));
    }
}
