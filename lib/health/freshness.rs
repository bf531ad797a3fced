use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;

use crate::sync_service::types::{FetchError, Height, PersistError};

/// Latest block known to one side of the freshness comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainStats {
    pub height: Height,
    pub time: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatsError {
    #[error("chain stats unavailable from upstream: {0}")]
    Upstream(#[from] FetchError),
    #[error("chain stats unavailable from store: {0}")]
    Store(#[from] PersistError),
    #[error("no blocks stored yet")]
    Empty,
}

pub trait ChainStatsSource: Send + Sync {
    fn chain_stats<'a>(&'a self) -> BoxFuture<'a, Result<ChainStats, StatsError>>;
}

impl<T> ChainStatsSource for Arc<T>
where
    T: ChainStatsSource + ?Sized,
{
    fn chain_stats<'a>(&'a self) -> BoxFuture<'a, Result<ChainStats, StatsError>> {
        (**self).chain_stats()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessThresholds {
    pub max_height_lag: i64,
    pub max_time_lag: Duration,
}

impl Default for FreshnessThresholds {
    fn default() -> Self {
        Self {
            max_height_lag: 900,
            max_time_lag: Duration::from_secs(600),
        }
    }
}

/// Local node position relative to the authoritative chain. Derived each health tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeFreshness {
    pub core_height: Height,
    pub local_height: Height,
    pub height_lag: i64,
    pub time_lag_seconds: i64,
    pub up_to_date: bool,
}

impl NodeFreshness {
    /// The node is stale when either lag strictly exceeds its threshold.
    pub fn evaluate(core: &ChainStats, local: &ChainStats, thresholds: &FreshnessThresholds) -> Self {
        let height_lag = core.height - local.height;
        let time_lag_seconds = (core.time - local.time).num_seconds();
        let max_time_lag = i64::try_from(thresholds.max_time_lag.as_secs()).unwrap_or(i64::MAX);

        Self {
            core_height: core.height,
            local_height: local.height,
            height_lag,
            time_lag_seconds,
            up_to_date: height_lag <= thresholds.max_height_lag && time_lag_seconds <= max_time_lag,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    use super::{ChainStats, FreshnessThresholds, NodeFreshness};

    fn stats(height: i64, seconds: i64) -> ChainStats {
        ChainStats {
            height,
            time: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + ChronoDuration::seconds(seconds),
        }
    }

    #[test]
    fn lag_at_threshold_is_up_to_date() {
        let freshness = NodeFreshness::evaluate(
            &stats(10_900, 600),
            &stats(10_000, 0),
            &FreshnessThresholds::default(),
        );

        assert_eq!(freshness.height_lag, 900);
        assert_eq!(freshness.time_lag_seconds, 600);
        assert!(freshness.up_to_date);
    }

    #[test]
    fn height_lag_over_threshold_is_stale() {
        let freshness = NodeFreshness::evaluate(
            &stats(10_901, 0),
            &stats(10_000, 0),
            &FreshnessThresholds::default(),
        );
        assert!(!freshness.up_to_date);
    }

    #[test]
    fn time_lag_over_threshold_is_stale() {
        let freshness = NodeFreshness::evaluate(
            &stats(10_001, 601),
            &stats(10_000, 0),
            &FreshnessThresholds::default(),
        );
        assert!(!freshness.up_to_date);
    }
}
