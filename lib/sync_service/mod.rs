pub mod domains;
pub mod driver;
mod error;
pub mod range_fetcher;
pub mod ranges;
pub mod source;
pub mod store;
#[cfg(test)]
pub(crate) mod test_support;
pub mod transform;
pub mod types;
pub mod validators;

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::domain::Domain;
use crate::health::store::{PgHealthRecordSink, PgStoredChainStats};
use crate::health::{FreshnessThresholds, HealthConfig, HealthEngine, HealthEngineBuilder, HealthSnapshot};
use crate::upstream::{CometClient, HeightJsonClient};
use domains::signers::{CommitSource, PgBlockSignerStore, SignerTransformer};
use domains::snapshots::{
    BalanceEntry, BalanceTransformer, PgAssetPriceStore, PgHistorySegmentStore,
    PgNetworkBalanceStore, PriceEntry, PriceTransformer, SegmentEntry, SegmentTransformer,
    SnapshotSource,
};
use domains::txs::{BlockResultsSource, PgCometTxStore, TxTransformer};
use domains::PgPool;
use driver::{DriverTask, SyncDriver, UpperBound};
use range_fetcher::RangeFetcher;
use types::{fixed_interval_limiter, SyncDriverConfig};
use validators::CachedValidatorResolver;

pub use error::Error;

/// Owns one sync driver per enabled domain plus the health engine, and supervises them.
pub struct SyncService {
    config: Config,
    pool: PgPool,
    requested: Vec<Domain>,
}

impl SyncService {
    /// `requested` restricts the domains to run; empty means every configured domain.
    pub fn new(config: Config, pool: PgPool, requested: Vec<Domain>) -> Self {
        Self {
            config,
            pool,
            requested,
        }
    }

    /// Domains that are requested and have an upstream configured.
    pub fn enabled_domains(&self) -> Vec<Domain> {
        Domain::ALL
            .into_iter()
            .filter(|domain| self.requested.is_empty() || self.requested.contains(domain))
            .filter(|domain| {
                let configured = match domain {
                    Domain::BlockSigners | Domain::CometTxs => true,
                    Domain::NetworkBalances => self.config.balances_url.is_some(),
                    Domain::AssetPrices => self.config.prices_url.is_some(),
                    Domain::Segments => self.config.segments_url.is_some(),
                };
                if !configured {
                    warn!(
                        event = "domain_not_configured",
                        domain = %domain,
                        "skipping domain without an upstream URL"
                    );
                }
                configured
            })
            .collect()
    }

    fn driver_config(&self) -> SyncDriverConfig {
        SyncDriverConfig {
            interval: self.config.sync_interval,
            batch_size: self.config.batch_size,
            lookback_blocks: self.config.lookback_blocks,
            fetch_concurrency: self.config.fetch_concurrency,
        }
    }

    fn fetcher(&self) -> RangeFetcher {
        RangeFetcher::new(
            fixed_interval_limiter(self.config.upstream_request_interval),
            self.config.fetch_concurrency,
        )
    }

    fn build(&self, snapshot: HealthSnapshot) -> Result<(Vec<Box<dyn DriverTask>>, HealthEngine), Error> {
        let domains = self.enabled_domains();
        if domains.is_empty() {
            return Err(Error::NoDomainsEnabled);
        }
        for gap in block_signer_gaps(&domains) {
            match gap {
                BlockSignerGap::CometTxsUnbounded => warn!(
                    event = "comet_txs_without_block_signers",
                    "comet-txs is bounded by the block-signers checkpoint and waits until it has data"
                ),
                BlockSignerGap::FreshnessUnknown => warn!(
                    event = "node_freshness_without_block_signers",
                    domains = ?domains,
                    "local chain height comes from block_signers; health stays unknown until that table has rows"
                ),
            }
        }

        let health_config = HealthConfig {
            interval: self.config.health_interval,
            thresholds: FreshnessThresholds {
                max_height_lag: self.config.node_max_height_lag,
                max_time_lag: self.config.node_max_time_lag,
            },
        };
        let engine = domains
            .iter()
            .fold(HealthEngineBuilder::new(health_config), |builder, domain| {
                builder.register(*domain)
            })
            .build(
                Arc::new(CometClient::new(self.config.authoritative_rpc_url.clone())),
                Arc::new(PgStoredChainStats::new(self.pool.clone())),
                Arc::new(PgHealthRecordSink::new(self.pool.clone())),
                snapshot,
            );

        let comet = Arc::new(CometClient::new(self.config.comet_rpc_url.clone()));
        // Both node-backed domains share one request budget.
        let comet_fetcher = self.fetcher();
        let driver_config = self.driver_config();

        let mut drivers: Vec<Box<dyn DriverTask>> = Vec::with_capacity(domains.len());
        for domain in domains {
            let health = engine.publisher(domain)?;
            let pool = self.pool.clone();
            let driver: Box<dyn DriverTask> = match domain {
                Domain::BlockSigners => Box::new(SyncDriver::new(
                    domain,
                    Arc::new(CommitSource::new(Arc::clone(&comet))),
                    SignerTransformer::new(CachedValidatorResolver::new(
                        Arc::clone(&comet),
                        self.config.validator_cache_ttl,
                        self.config.validator_cache_max_entries,
                    )),
                    PgBlockSignerStore::new(pool),
                    comet_fetcher.clone(),
                    health,
                    driver_config,
                )),
                Domain::CometTxs => Box::new(
                    SyncDriver::new(
                        domain,
                        Arc::new(BlockResultsSource::new(Arc::clone(&comet))),
                        TxTransformer,
                        PgCometTxStore::new(pool.clone()),
                        comet_fetcher.clone(),
                        health,
                        driver_config,
                    )
                    .with_upper_bound(UpperBound {
                        name: Domain::BlockSigners.as_str(),
                        source: Arc::new(PgBlockSignerStore::new(pool)),
                    }),
                ),
                Domain::NetworkBalances => Box::new(SyncDriver::new(
                    domain,
                    Arc::new(SnapshotSource::<BalanceEntry>::new(
                        self.feed(self.config.balances_url.as_deref(), "balances"),
                        Arc::clone(&comet),
                    )),
                    BalanceTransformer,
                    PgNetworkBalanceStore::new(pool),
                    self.fetcher(),
                    health,
                    driver_config,
                )),
                Domain::AssetPrices => Box::new(SyncDriver::new(
                    domain,
                    Arc::new(SnapshotSource::<PriceEntry>::new(
                        self.feed(self.config.prices_url.as_deref(), "prices"),
                        Arc::clone(&comet),
                    )),
                    PriceTransformer,
                    PgAssetPriceStore::new(pool),
                    self.fetcher(),
                    health,
                    driver_config,
                )),
                Domain::Segments => Box::new(SyncDriver::new(
                    domain,
                    Arc::new(SnapshotSource::<SegmentEntry>::new(
                        self.feed(self.config.segments_url.as_deref(), "segments"),
                        Arc::clone(&comet),
                    )),
                    SegmentTransformer,
                    PgHistorySegmentStore::new(pool),
                    self.fetcher(),
                    health,
                    driver_config,
                )),
            };
            drivers.push(driver);
        }

        Ok((drivers, engine))
    }

    fn feed(&self, template: Option<&str>, resource: &'static str) -> HeightJsonClient {
        HeightJsonClient::new(template.unwrap_or_default(), resource)
    }

    /// Runs every driver and the health engine until `cancel` fires.
    ///
    /// A task that exits early (panic) cancels the rest and is reported as an error.
    pub async fn run(self, snapshot: HealthSnapshot, cancel: CancellationToken) -> Result<(), Error> {
        let (drivers, engine) = self.build(snapshot)?;
        info!(
            event = "sync_service_started",
            domains = %drivers.iter().map(|d| d.domain().as_str()).collect::<Vec<_>>().join(","),
            "starting sync drivers and health engine"
        );

        let mut tasks = JoinSet::new();
        for driver in drivers {
            tasks.spawn(driver.run(cancel.clone()));
        }
        tasks.spawn(engine.run(cancel.clone()));

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(
                    event = "sync_service_task_failed",
                    error = %err,
                    "supervised task exited abnormally; shutting down"
                );
                cancel.cancel();
                if outcome.is_ok() {
                    outcome = Err(Error::TaskJoinError(err));
                }
            }
        }

        info!(event = "sync_service_stopped", "sync service stopped");
        outcome
    }

    /// Runs one tick of every driver concurrently, then one health tick.
    pub async fn run_once(self, snapshot: HealthSnapshot, cancel: CancellationToken) -> Result<(), Error> {
        let (drivers, engine) = self.build(snapshot)?;

        let mut tasks = JoinSet::new();
        for driver in drivers {
            let domain = driver.domain();
            let cancel = cancel.clone();
            tasks.spawn(async move { (domain, driver.run_once(cancel).await) });
        }

        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (domain, ok) = joined?;
            if !ok {
                failed.push(domain);
            }
        }

        engine.tick_once().await?;

        if failed.is_empty() {
            Ok(())
        } else {
            failed.sort();
            Err(Error::TickFailed(failed))
        }
    }
}

/// Consequences of running without the block-signers domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockSignerGap {
    CometTxsUnbounded,
    FreshnessUnknown,
}

fn block_signer_gaps(domains: &[Domain]) -> Vec<BlockSignerGap> {
    if domains.contains(&Domain::BlockSigners) {
        return Vec::new();
    }
    let mut gaps = vec![BlockSignerGap::FreshnessUnknown];
    if domains.contains(&Domain::CometTxs) {
        gaps.insert(0, BlockSignerGap::CometTxsUnbounded);
    }
    gaps
}
