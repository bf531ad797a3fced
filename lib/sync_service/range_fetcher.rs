use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::source::BlockSource;
use super::types::{
    BlockRange, FetchError, FetchErrorKind, FetchFailure, FetchResult, Fetched, Height,
    SharedRateLimiter,
};

/// Aggregate failure for one range. Returned only after every per-height task has finished.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} of {} heights failed in range {range} (first: {})", failures.len(), range.block_count(), first_failure(failures))]
pub struct RangeFetchError {
    pub range: BlockRange,
    /// Failed heights in increasing order.
    pub failures: Vec<FetchFailure>,
    /// Number of heights that were fetched successfully but not returned.
    pub succeeded: usize,
}

impl RangeFetchError {
    pub fn all_cancelled(&self) -> bool {
        self.failures
            .iter()
            .all(|failure| failure.cause.kind == FetchErrorKind::Cancelled)
    }
}

fn first_failure(failures: &[FetchFailure]) -> String {
    failures
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

/// Fetches every height of a range concurrently.
///
/// One task is spawned per height. Each task waits for a slot (at most `max_in_flight` requests
/// run at once) and for one limiter permit per upstream request it will issue, then reports through a bounded fan-in
/// channel. A single failed height does not cancel the others; the range is all-or-nothing.
#[derive(Clone)]
pub struct RangeFetcher {
    limiter: SharedRateLimiter,
    max_in_flight: usize,
}

impl RangeFetcher {
    pub fn new(limiter: SharedRateLimiter, max_in_flight: usize) -> Self {
        Self {
            limiter,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Fetches `range` and returns the payloads sorted by height ascending.
    pub async fn fetch_range<S>(
        &self,
        source: Arc<S>,
        range: BlockRange,
        cancel: &CancellationToken,
    ) -> Result<Vec<Fetched<S::Payload>>, RangeFetchError>
    where
        S: BlockSource,
    {
        let (sender, receiver) = flume::bounded::<FetchResult<S::Payload>>(self.max_in_flight);
        let slots = Arc::new(Semaphore::new(self.max_in_flight));

        let mut tasks = JoinSet::new();
        for height in range.heights() {
            let sender = sender.clone();
            let source = Arc::clone(&source);
            let limiter = Arc::clone(&self.limiter);
            let slots = Arc::clone(&slots);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = fetch_one(source.as_ref(), &limiter, &slots, &cancel, height).await;
                let _ = sender.send_async(result).await;
            });
        }
        drop(sender);

        let expected = usize::try_from(range.block_count()).unwrap_or(usize::MAX);
        let mut fetched = Vec::with_capacity(expected);
        let mut failures = Vec::new();
        while let Ok(result) = receiver.recv_async().await {
            match result {
                Ok(value) => fetched.push(value),
                Err(failure) => failures.push(failure),
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(
                    event = "range_fetch_task_failed",
                    range = %range,
                    error = %err,
                    "per-height fetch task panicked"
                );
            }
        }

        if fetched.len() + failures.len() < expected {
            let reported: HashSet<Height> = fetched
                .iter()
                .map(|value| value.height)
                .chain(failures.iter().map(|failure| failure.height))
                .collect();
            failures.extend(
                range
                    .heights()
                    .filter(|height| !reported.contains(height))
                    .map(|height| FetchFailure {
                        height,
                        cause: FetchError::new(
                            FetchErrorKind::Other,
                            "fetch task ended without reporting a result",
                        ),
                    }),
            );
        }

        if !failures.is_empty() {
            failures.sort_by_key(|failure| failure.height);
            for failure in &failures {
                debug!(
                    event = "range_fetch_height_failed",
                    height = failure.height,
                    kind = failure.cause.kind.as_str(),
                    message = %failure.cause.message,
                    "height fetch failed"
                );
            }
            warn!(
                event = "range_fetch_partial_failure",
                range = %range,
                failed = failures.len(),
                succeeded = fetched.len(),
                "range fetch failed; discarding successful heights for this batch"
            );
            return Err(RangeFetchError {
                range,
                failures,
                succeeded: fetched.len(),
            });
        }

        fetched.sort_by_key(|value| value.height);
        Ok(fetched)
    }
}

async fn fetch_one<S>(
    source: &S,
    limiter: &SharedRateLimiter,
    slots: &Semaphore,
    cancel: &CancellationToken,
    height: Height,
) -> FetchResult<S::Payload>
where
    S: BlockSource,
{
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FetchError::cancelled()),
        outcome = async {
            let _slot = slots
                .acquire()
                .await
                .map_err(|_| FetchError::new(FetchErrorKind::Other, "fetch slots closed"))?;
            for _ in 0..source.requests_per_block().max(1) {
                limiter.until_ready().await;
            }
            source.fetch_block(height).await
        } => outcome,
    };

    outcome
        .map(|value| Fetched { height, value })
        .map_err(|cause| FetchFailure { height, cause })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use tokio_util::sync::CancellationToken;

    use super::RangeFetcher;
    use crate::sync_service::test_support::{test_row, MockSource};
    use crate::sync_service::types::{
        fixed_interval_limiter, BlockRange, FetchError, FetchErrorKind,
    };

    fn fetcher(max_in_flight: usize) -> RangeFetcher {
        RangeFetcher::new(fixed_interval_limiter(Duration::from_millis(1)), max_in_flight)
    }

    #[tokio::test]
    async fn successful_range_is_sorted_by_height() {
        let source = Arc::new(MockSource::serving_rows(1_000, 1, 1));
        let range = BlockRange::new(1, 25).unwrap();

        let fetched = fetcher(4)
            .fetch_range(source.clone(), range, &CancellationToken::new())
            .await
            .expect("range should succeed");

        let heights: Vec<i64> = fetched.iter().map(|f| f.height).collect();
        assert_eq!(heights, (1..=25).collect::<Vec<_>>());
        assert_eq!(fetched[0].value, vec![test_row(1, "a", 1)]);
        assert_eq!(source.total_block_calls(), 25);
    }

    #[tokio::test]
    async fn one_failed_height_fails_the_batch_without_cancelling_others() {
        let source = Arc::new(
            MockSource::serving_rows(1_000, 1, 1).with_block_plan(
                101,
                vec![Err(FetchError::new(FetchErrorKind::UpstreamUnavailable, "503"))],
            ),
        );
        let range = BlockRange::new(100, 102).unwrap();

        let err = fetcher(8)
            .fetch_range(source.clone(), range, &CancellationToken::new())
            .await
            .expect_err("batch must fail when one height fails");

        assert_eq!(err.range, range);
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].height, 101);
        assert_eq!(err.failures[0].cause.kind, FetchErrorKind::UpstreamUnavailable);
        assert_eq!(err.succeeded, 2);
        assert_eq!(source.block_calls_for(100), 1);
        assert_eq!(source.block_calls_for(102), 1);
    }

    #[tokio::test]
    async fn every_failure_is_aggregated() {
        let source = Arc::new(
            MockSource::serving_rows(1_000, 1, 1)
                .with_block_plan(3, vec![Err(FetchError::new(FetchErrorKind::Decode, "bad json"))])
                .with_block_plan(7, vec![Err(FetchError::new(FetchErrorKind::Network, "reset"))]),
        );

        let err = fetcher(2)
            .fetch_range(source, BlockRange::new(1, 10).unwrap(), &CancellationToken::new())
            .await
            .expect_err("two heights fail");

        let failed: Vec<i64> = err.failures.iter().map(|f| f.height).collect();
        assert_eq!(failed, vec![3, 7]);
        assert_eq!(err.succeeded, 8);
        assert!(!err.all_cancelled());
    }

    #[tokio::test]
    async fn limiter_is_charged_per_upstream_request() {
        let source = Arc::new(MockSource::serving_rows(1_000, 1, 1).with_requests_per_block(2));
        let fetcher = RangeFetcher::new(fixed_interval_limiter(Duration::from_millis(25)), 8);
        let started = Instant::now();

        fetcher
            .fetch_range(source.clone(), BlockRange::new(1, 3).unwrap(), &CancellationToken::new())
            .await
            .expect("range should succeed");

        // Six permits at one per 25ms: the first is free, the rest wait.
        assert!(started.elapsed() >= Duration::from_millis(120));
        assert_eq!(source.total_block_calls(), 3);
    }

    #[tokio::test]
    async fn cancelled_fetch_reports_cancellation() {
        let source = Arc::new(MockSource::serving_rows(1_000, 1, 1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher(2)
            .fetch_range(source, BlockRange::new(1, 5).unwrap(), &cancel)
            .await
            .expect_err("cancelled before start");

        assert!(err.all_cancelled());
        assert_eq!(err.failures.len(), 5);
    }
}
