use crate::build_info;
use crate::domain::Domain;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers immutable build metadata for `/metrics` scraping as a labeled gauge with value `1`.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: "chain_indexer",
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    let sub_registry = registry.sub_registry_with_prefix(prefix);
    sub_registry.register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DomainLabels {
    pub domain: &'static str,
}

impl DomainLabels {
    pub fn new(domain: Domain) -> Self {
        Self {
            domain: domain.as_str(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TickLabels {
    pub domain: &'static str,
    /// `ok`, `empty` or `failed`.
    pub outcome: &'static str,
}

impl TickLabels {
    pub fn new(domain: Domain, outcome: &'static str) -> Self {
        Self {
            domain: domain.as_str(),
            outcome,
        }
    }
}

#[derive(Clone)]
pub struct SyncMetrics {
    pub ticks_total: Family<TickLabels, Counter>,
    pub rows_upserted_total: Family<DomainLabels, Counter>,
    /// Failed heights, counted once per failed range fetch.
    pub fetch_failures_total: Family<DomainLabels, Counter>,
    /// Highest height durably flushed in this process lifetime.
    pub checkpoint_height: Family<DomainLabels, Gauge>,
    /// Upper end of the most recently resolved range.
    pub target_height: Family<DomainLabels, Gauge>,
}

impl SyncMetrics {
    fn init() -> Self {
        Self {
            ticks_total: Family::default(),
            rows_upserted_total: Family::default(),
            fetch_failures_total: Family::default(),
            checkpoint_height: Family::default(),
            target_height: Family::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "ticks",
            "Sync driver ticks by domain and outcome",
            metrics.ticks_total.clone(),
        );
        sub_registry.register(
            "rows_upserted",
            "Rows committed by the batch upsert store",
            metrics.rows_upserted_total.clone(),
        );
        sub_registry.register(
            "fetch_failures",
            "Heights that failed to fetch",
            metrics.fetch_failures_total.clone(),
        );
        sub_registry.register(
            "checkpoint_height",
            "Highest height durably committed",
            metrics.checkpoint_height.clone(),
        );
        sub_registry.register(
            "target_height",
            "Upper end of the latest resolved range",
            metrics.target_height.clone(),
        );
        metrics
    }
}

pub static SYNC_METRICS: OnceCell<SyncMetrics> = OnceCell::const_new();

#[derive(Clone)]
pub struct HealthMetrics {
    pub domain_healthy: Family<DomainLabels, Gauge>,
    pub node_height_lag: Gauge,
    pub node_time_lag_seconds: Gauge,
    pub ticks_total: Counter,
}

impl HealthMetrics {
    fn init() -> Self {
        Self {
            domain_healthy: Family::default(),
            node_height_lag: Gauge::default(),
            node_time_lag_seconds: Gauge::default(),
            ticks_total: Counter::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "domain_healthy",
            "Latest health verdict per domain (1 healthy, 0 unhealthy)",
            metrics.domain_healthy.clone(),
        );
        sub_registry.register(
            "node_height_lag",
            "Blocks between the authoritative chain tip and the locally stored tip",
            metrics.node_height_lag.clone(),
        );
        sub_registry.register(
            "node_time_lag_seconds",
            "Seconds between the authoritative block time and the locally stored block time",
            metrics.node_time_lag_seconds.clone(),
        );
        sub_registry.register(
            "ticks",
            "Health engine ticks",
            metrics.ticks_total.clone(),
        );
        metrics
    }
}

pub static HEALTH_METRICS: OnceCell<HealthMetrics> = OnceCell::const_new();
