use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::range_fetcher::{RangeFetchError, RangeFetcher};
use super::ranges::{resolve_range, RangeInputs, RangeResolutionError};
use super::source::BlockSource;
use super::store::{BatchUpsertStore, CheckpointSource, FlushError, RowPersister};
use super::transform::{RowTransformer, TransformError};
use super::types::{BlockRange, FetchError, Height, PersistError, SyncDriverConfig};
use crate::domain::Domain;
use crate::health::{HealthPublisher, HealthReason};
use crate::server::monitoring::{DomainLabels, TickLabels, SYNC_METRICS};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TickError {
    #[error("failed to read stored checkpoint: {0}")]
    Checkpoint(#[source] PersistError),
    #[error("failed to read upper bound `{name}`: {source}")]
    UpperBound {
        name: String,
        #[source]
        source: PersistError,
    },
    #[error("failed to read upstream bounds: {0}")]
    Upstream(#[source] FetchError),
    #[error(transparent)]
    Range(#[from] RangeResolutionError),
    #[error(transparent)]
    Fetch(#[from] RangeFetchError),
    #[error("transform failed for {range}: {source}")]
    Transform {
        range: BlockRange,
        #[source]
        source: TransformError,
    },
    #[error("flush failed for {range}: {source}")]
    Flush {
        range: BlockRange,
        #[source]
        source: FlushError,
    },
    #[error("tick cancelled")]
    Cancelled,
}

impl TickError {
    fn health_reason(&self) -> HealthReason {
        match self {
            Self::Range(_) => HealthReason::InvalidRange,
            _ => HealthReason::SyncFailed,
        }
    }
}

/// What a completed tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to fetch: caught up, or an upper bound has no data yet.
    Empty,
    Synced { range: BlockRange, rows: usize },
}

/// Named upper bound on the heights a driver may sync, e.g. another domain's stored tip.
#[derive(Clone)]
pub struct UpperBound {
    pub name: &'static str,
    pub source: Arc<dyn CheckpointSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Resolving,
    Fetching,
    Flushing,
}

/// Periodic incremental sync loop for one domain.
///
/// Each tick reads the stored checkpoint, resolves the missing range, splits it into sub-batches
/// and for each batch fetches, transforms and flushes in that order. A failed batch ends the tick;
/// the next tick resumes from whatever was durably stored.
pub struct SyncDriver<S, X, P>
where
    S: BlockSource,
    X: RowTransformer<S::Payload>,
    P: RowPersister<X::Row>,
{
    domain: Domain,
    source: Arc<S>,
    transformer: X,
    store: BatchUpsertStore<X::Row, P>,
    fetcher: RangeFetcher,
    upper_bounds: Vec<UpperBound>,
    health: HealthPublisher,
    config: SyncDriverConfig,
    earliest_available: Option<Height>,
    state: DriverState,
}

impl<S, X, P> SyncDriver<S, X, P>
where
    S: BlockSource,
    X: RowTransformer<S::Payload>,
    P: RowPersister<X::Row>,
{
    pub fn new(
        domain: Domain,
        source: Arc<S>,
        transformer: X,
        persister: P,
        fetcher: RangeFetcher,
        health: HealthPublisher,
        config: SyncDriverConfig,
    ) -> Self {
        Self {
            domain,
            source,
            transformer,
            store: BatchUpsertStore::new(persister),
            fetcher,
            upper_bounds: Vec::new(),
            health,
            config,
            earliest_available: None,
            state: DriverState::Idle,
        }
    }

    pub fn with_upper_bound(mut self, bound: UpperBound) -> Self {
        self.upper_bounds.push(bound);
        self
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Runs one tick: resolve, then fetch/transform/flush each sub-batch sequentially.
    ///
    /// On failure the driver stays in the stage that failed until the next tick starts.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> Result<TickOutcome, TickError> {
        let outcome = self.tick_inner(cancel).await;
        if outcome.is_ok() {
            self.state = DriverState::Idle;
        }
        outcome
    }

    async fn tick_inner(&mut self, cancel: &CancellationToken) -> Result<TickOutcome, TickError> {
        self.state = DriverState::Resolving;
        let Some(range) = self.resolve(cancel).await? else {
            debug!(
                event = "sync_tick_empty",
                domain = %self.domain,
                "nothing to sync"
            );
            return Ok(TickOutcome::Empty);
        };

        if let Some(metrics) = SYNC_METRICS.get() {
            metrics
                .target_height
                .get_or_create(&DomainLabels::new(self.domain))
                .set(range.to_height);
        }

        let batches = range.split(self.config.batch_size);
        info!(
            event = "sync_range_resolved",
            domain = %self.domain,
            from_height = range.from_height,
            to_height = range.to_height,
            batches = batches.len(),
            "syncing range"
        );

        let mut rows_total = 0;
        for batch in batches {
            if cancel.is_cancelled() {
                return Err(TickError::Cancelled);
            }
            rows_total += self.sync_batch(batch, cancel).await?;
        }

        Ok(TickOutcome::Synced {
            range,
            rows: rows_total,
        })
    }

    async fn resolve(&mut self, cancel: &CancellationToken) -> Result<Option<BlockRange>, TickError> {
        let last_stored = self
            .store
            .latest_height()
            .await
            .map_err(TickError::Checkpoint)?;

        let mut upper_bounds = Vec::with_capacity(self.upper_bounds.len());
        for bound in &self.upper_bounds {
            let tip = bound
                .source
                .latest_height()
                .await
                .map_err(|source| TickError::UpperBound {
                    name: bound.name.to_string(),
                    source,
                })?;
            match tip {
                Some(tip) => upper_bounds.push(tip),
                None => {
                    debug!(
                        event = "sync_upper_bound_empty",
                        domain = %self.domain,
                        bound = bound.name,
                        "upper bound has no data yet"
                    );
                    return Ok(None);
                }
            }
        }

        let chain_tip = cancellable(cancel, self.source.fetch_chain_tip()).await?;
        let earliest_available = match (last_stored, self.earliest_available) {
            (Some(_), _) => 1,
            (None, Some(earliest)) => earliest,
            (None, None) => {
                let earliest = cancellable(cancel, self.source.fetch_earliest_available()).await?;
                self.earliest_available = Some(earliest);
                earliest
            }
        };

        let inputs = RangeInputs {
            last_stored,
            chain_tip,
            earliest_available,
            lookback_blocks: self.config.lookback_blocks,
            upper_bounds,
        };
        Ok(resolve_range(&inputs)?)
    }

    async fn sync_batch(&mut self, batch: BlockRange, cancel: &CancellationToken) -> Result<usize, TickError> {
        self.state = DriverState::Fetching;
        let fetched = match self
            .fetcher
            .fetch_range(Arc::clone(&self.source), batch, cancel)
            .await
        {
            Ok(fetched) => fetched,
            Err(_) if cancel.is_cancelled() => return Err(TickError::Cancelled),
            Err(err) => {
                if let Some(metrics) = SYNC_METRICS.get() {
                    metrics
                        .fetch_failures_total
                        .get_or_create(&DomainLabels::new(self.domain))
                        .inc_by(err.failures.len() as u64);
                }
                return Err(err.into());
            }
        };

        let rows = self
            .transformer
            .transform(fetched)
            .await
            .map_err(|source| TickError::Transform {
                range: batch,
                source,
            })?;
        for row in rows {
            self.store.add(row);
        }

        self.state = DriverState::Flushing;
        let written = self
            .store
            .flush_upsert()
            .await
            .map_err(|source| TickError::Flush {
                range: batch,
                source,
            })?;

        debug!(
            event = "sync_batch_flushed",
            domain = %self.domain,
            from_height = batch.from_height,
            to_height = batch.to_height,
            rows = written.len(),
            "batch committed"
        );
        if let Some(metrics) = SYNC_METRICS.get() {
            metrics
                .rows_upserted_total
                .get_or_create(&DomainLabels::new(self.domain))
                .inc_by(written.len() as u64);
        }
        self.record_checkpoint().await;
        Ok(written.len())
    }

    /// Publishes the stored `MAX(height)`, which trails the batch end when trailing heights had
    /// no rows.
    async fn record_checkpoint(&self) {
        let Some(metrics) = SYNC_METRICS.get() else {
            return;
        };
        match self.store.latest_height().await {
            Ok(Some(height)) => {
                metrics
                    .checkpoint_height
                    .get_or_create(&DomainLabels::new(self.domain))
                    .set(height);
            }
            Ok(None) => {}
            Err(err) => debug!(
                event = "sync_checkpoint_metric_skipped",
                domain = %self.domain,
                error = %err,
                "could not read stored checkpoint for metrics"
            ),
        }
    }

    /// Runs one tick, then logs it, records metrics and publishes health.
    ///
    /// Returns `false` when the tick failed.
    pub async fn run_tick(&mut self, cancel: &CancellationToken) -> bool {
        let result = self.tick(cancel).await;
        let stage = std::mem::replace(&mut self.state, DriverState::Idle);

        let outcome = match &result {
            Ok(TickOutcome::Empty) => "empty",
            Ok(TickOutcome::Synced { .. }) => "ok",
            Err(TickError::Cancelled) => {
                info!(
                    event = "sync_tick_cancelled",
                    domain = %self.domain,
                    "tick interrupted by shutdown"
                );
                return false;
            }
            Err(_) => "failed",
        };
        if let Some(metrics) = SYNC_METRICS.get() {
            metrics
                .ticks_total
                .get_or_create(&TickLabels::new(self.domain, outcome))
                .inc();
        }

        let published = match &result {
            Ok(TickOutcome::Synced { range, rows }) => {
                info!(
                    event = "sync_tick_completed",
                    domain = %self.domain,
                    from_height = range.from_height,
                    to_height = range.to_height,
                    rows,
                    "tick completed"
                );
                self.health.publish(true)
            }
            Ok(TickOutcome::Empty) => self.health.publish(true),
            Err(err) => {
                error!(
                    event = "sync_tick_failed",
                    domain = %self.domain,
                    reason = err.health_reason().as_str(),
                    stage = ?stage,
                    error = %err,
                    "tick failed; will resume from stored checkpoint"
                );
                self.health.publish_with_reason(false, err.health_reason())
            }
        };
        if let Err(err) = published {
            warn!(
                event = "health_publish_failed",
                domain = %self.domain,
                error = %err,
                "could not publish domain health"
            );
        }

        result.is_ok()
    }

    /// Ticks every `interval` until `cancel` fires. Cancellation is observed between ticks and
    /// while fetching; an in-flight flush always completes.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            event = "sync_driver_started",
            domain = %self.domain,
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "sync driver started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.run_tick(&cancel).await;
        }

        info!(
            event = "sync_driver_stopped",
            domain = %self.domain,
            "sync driver stopped"
        );
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    request: BoxFuture<'_, Result<T, FetchError>>,
) -> Result<T, TickError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TickError::Cancelled),
        result = request => result.map_err(TickError::Upstream),
    }
}

/// Type-erased driver handle so the supervisor can hold drivers of different domains.
pub trait DriverTask: Send {
    fn domain(&self) -> Domain;

    fn run(self: Box<Self>, cancel: CancellationToken) -> BoxFuture<'static, ()>;

    fn run_once(self: Box<Self>, cancel: CancellationToken) -> BoxFuture<'static, bool>;
}

impl<S, X, P> DriverTask for SyncDriver<S, X, P>
where
    S: BlockSource,
    X: RowTransformer<S::Payload> + 'static,
    P: RowPersister<X::Row> + 'static,
{
    fn domain(&self) -> Domain {
        self.domain
    }

    fn run(self: Box<Self>, cancel: CancellationToken) -> BoxFuture<'static, ()> {
        Box::pin((*self).run(cancel))
    }

    fn run_once(self: Box<Self>, cancel: CancellationToken) -> BoxFuture<'static, bool> {
        Box::pin(async move {
            let mut driver = *self;
            driver.run_tick(&cancel).await
        })
    }
}
