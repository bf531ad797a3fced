use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;

/// Block height as stored upstream and in every domain table.
pub type Height = i64;

/// Inclusive block range handed to the range fetcher. Always `from_height <= to_height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from_height: Height,
    pub to_height: Height,
}

impl BlockRange {
    /// Returns `None` for an inverted range instead of constructing one.
    pub fn new(from_height: Height, to_height: Height) -> Option<Self> {
        (from_height <= to_height).then_some(Self {
            from_height,
            to_height,
        })
    }

    pub fn block_count(&self) -> i64 {
        self.to_height - self.from_height + 1
    }

    pub fn heights(&self) -> impl Iterator<Item = Height> {
        self.from_height..=self.to_height
    }

    /// Splits the range into consecutive sub-batches of at most `batch_size` heights, in
    /// increasing height order.
    pub fn split(&self, batch_size: i64) -> Vec<BlockRange> {
        let batch_size = batch_size.max(1);
        let mut batches = Vec::new();
        let mut start = self.from_height;
        while start <= self.to_height {
            let end = start.saturating_add(batch_size - 1).min(self.to_height);
            batches.push(BlockRange {
                from_height: start,
                to_height: end,
            });
            start = end + 1;
        }
        batches
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from_height, self.to_height)
    }
}

/// One successfully fetched unit, tagged with its source height.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub height: Height,
    pub value: T,
}

/// Normalized upstream failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Network,
    RateLimited,
    UpstreamUnavailable,
    HttpStatus,
    Decode,
    Cancelled,
    Other,
}

impl FetchErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::RateLimited => "rate_limited",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::HttpStatus => "http_status",
            Self::Decode => "decode",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        }
    }
}

/// Typed upstream failure with human-readable details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FetchErrorKind::Cancelled, "fetch cancelled by shutdown")
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for FetchError {}

/// Per-height fetch failure. Aggregated by the range fetcher, never silently dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub height: Height,
    pub cause: FetchError,
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "height {}: {}", self.height, self.cause)
    }
}

/// Result of fetching a single height.
pub type FetchResult<T> = Result<Fetched<T>, FetchFailure>;

/// Normalized persistence failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistErrorKind {
    Retryable,
    Fatal,
}

/// Typed persistence failure with human-readable details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistError {
    pub kind: PersistErrorKind,
    pub message: String,
}

impl PersistError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: PersistErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: PersistErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == PersistErrorKind::Retryable
    }
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = match self.kind {
            PersistErrorKind::Retryable => "retryable",
            PersistErrorKind::Fatal => "fatal",
        };
        write!(f, "{class} persistence error: {}", self.message)
    }
}

impl std::error::Error for PersistError {}

/// Shared limiter enforcing one request budget per upstream endpoint.
pub type SharedRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Builds a fixed-interval limiter with burst 1.
pub fn fixed_interval_limiter(interval: Duration) -> SharedRateLimiter {
    let quota = Quota::with_period(interval.max(Duration::from_millis(1)))
        .unwrap_or_else(|| Quota::per_second(nonzero!(1u32)))
        .allow_burst(nonzero!(1u32));
    Arc::new(RateLimiter::direct(quota))
}

/// Sync driver tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncDriverConfig {
    pub interval: Duration,
    /// Maximum heights per sub-batch handed to the range fetcher.
    pub batch_size: i64,
    /// Cold-start look-back window below the chain tip.
    pub lookback_blocks: i64,
    pub fetch_concurrency: usize,
}

impl Default for SyncDriverConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 200,
            lookback_blocks: 10_000,
            fetch_concurrency: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BlockRange;

    #[test]
    fn inverted_range_is_not_constructed() {
        assert!(BlockRange::new(10, 9).is_none());
        assert_eq!(BlockRange::new(10, 10).map(|r| r.block_count()), Some(1));
    }

    #[test]
    fn split_respects_batch_size_and_order() {
        let range = BlockRange::new(1, 450).expect("valid range");
        let batches = range.split(200);

        assert_eq!(
            batches,
            vec![
                BlockRange::new(1, 200).unwrap(),
                BlockRange::new(201, 400).unwrap(),
                BlockRange::new(401, 450).unwrap(),
            ]
        );
        assert!(batches.iter().all(|batch| batch.block_count() <= 200));
    }

    #[test]
    fn split_of_short_range_is_single_batch() {
        let range = BlockRange::new(501, 650).expect("valid range");
        assert_eq!(range.split(200), vec![range]);
    }
}
