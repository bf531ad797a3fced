pub mod freshness;
pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::Domain;
use crate::server::monitoring::{DomainLabels, HEALTH_METRICS};
use crate::sync_service::types::PersistError;

pub use freshness::{ChainStats, ChainStatsSource, FreshnessThresholds, NodeFreshness, StatsError};

/// Closed set of reasons attached to a health record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthReason {
    None,
    Unknown,
    MissingStatusFromService,
    NodeNotUpToDate,
    SyncFailed,
    InvalidRange,
}

impl HealthReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Unknown => "unknown",
            Self::MissingStatusFromService => "missingStatusFromService",
            Self::NodeNotUpToDate => "nodeNotUpToDate",
            Self::SyncFailed => "syncFailed",
            Self::InvalidRange => "invalidRange",
        }
    }
}

/// One health verdict for one domain. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthRecord {
    pub timestamp: DateTime<Utc>,
    pub domain: Domain,
    pub is_healthy: bool,
    pub reason: HealthReason,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthError {
    #[error("domain {0} is not registered with the health engine")]
    UnregisteredDomain(Domain),
    #[error("health registry lock poisoned")]
    Poisoned,
    #[error("failed to write health records: {0}")]
    Sink(#[source] PersistError),
}

/// Sole writer of health records.
pub trait HealthRecordSink: Send + Sync {
    /// Writes all records of one tick in a single transaction.
    fn write_records<'a>(&'a self, records: &'a [HealthRecord]) -> BoxFuture<'a, Result<(), PersistError>>;
}

impl<T> HealthRecordSink for Arc<T>
where
    T: HealthRecordSink + ?Sized,
{
    fn write_records<'a>(&'a self, records: &'a [HealthRecord]) -> BoxFuture<'a, Result<(), PersistError>> {
        (**self).write_records(records)
    }
}

#[derive(Debug, Clone, Copy)]
struct DomainSlot {
    pending: bool,
    is_healthy: bool,
    reason: HealthReason,
}

impl Default for DomainSlot {
    fn default() -> Self {
        Self {
            pending: false,
            is_healthy: false,
            reason: HealthReason::Unknown,
        }
    }
}

type Registry = Arc<Mutex<BTreeMap<Domain, DomainSlot>>>;

/// Push-side handle given to a sync driver.
#[derive(Clone)]
pub struct HealthPublisher {
    domain: Domain,
    registry: Registry,
}

impl HealthPublisher {
    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn publish(&self, is_healthy: bool) -> Result<(), HealthError> {
        let reason = if is_healthy {
            HealthReason::None
        } else {
            HealthReason::Unknown
        };
        self.publish_with_reason(is_healthy, reason)
    }

    pub fn publish_with_reason(&self, is_healthy: bool, reason: HealthReason) -> Result<(), HealthError> {
        let mut registry = self.registry.lock().map_err(|_| HealthError::Poisoned)?;
        let Some(slot) = registry.get_mut(&self.domain) else {
            error!(
                event = "health_publish_unregistered",
                domain = %self.domain,
                "publish for a domain the health engine does not track"
            );
            return Err(HealthError::UnregisteredDomain(self.domain));
        };
        *slot = DomainSlot {
            pending: true,
            is_healthy,
            reason,
        };
        Ok(())
    }
}

/// Verdict served on `/health`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthVerdict {
    pub evaluated_at: Option<DateTime<Utc>>,
    pub node: Option<NodeFreshness>,
    pub records: Vec<HealthRecord>,
}

impl HealthVerdict {
    pub fn all_healthy(&self) -> bool {
        self.records.iter().all(|record| record.is_healthy)
    }
}

/// Latest verdict, shared with the HTTP server.
#[derive(Clone, Default)]
pub struct HealthSnapshot {
    inner: Arc<RwLock<HealthVerdict>>,
}

impl HealthSnapshot {
    pub async fn current(&self) -> HealthVerdict {
        self.inner.read().await.clone()
    }

    async fn replace(&self, verdict: HealthVerdict) {
        *self.inner.write().await = verdict;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub interval: Duration,
    pub thresholds: FreshnessThresholds,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            thresholds: FreshnessThresholds::default(),
        }
    }
}

/// Start-up registration of the domains the engine attests.
#[derive(Default)]
pub struct HealthEngineBuilder {
    config: HealthConfig,
    domains: BTreeSet<Domain>,
}

impl HealthEngineBuilder {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            domains: BTreeSet::new(),
        }
    }

    pub fn register(mut self, domain: Domain) -> Self {
        self.domains.insert(domain);
        self
    }

    pub fn build(
        self,
        core: Arc<dyn ChainStatsSource>,
        local: Arc<dyn ChainStatsSource>,
        sink: Arc<dyn HealthRecordSink>,
        snapshot: HealthSnapshot,
    ) -> HealthEngine {
        let registry = self
            .domains
            .into_iter()
            .map(|domain| (domain, DomainSlot::default()))
            .collect();

        HealthEngine {
            registry: Arc::new(Mutex::new(registry)),
            core,
            local,
            sink,
            config: self.config,
            snapshot,
        }
    }
}

/// Periodic liveness and freshness attestation for every registered domain.
pub struct HealthEngine {
    registry: Registry,
    core: Arc<dyn ChainStatsSource>,
    local: Arc<dyn ChainStatsSource>,
    sink: Arc<dyn HealthRecordSink>,
    config: HealthConfig,
    snapshot: HealthSnapshot,
}

impl HealthEngine {
    pub fn publisher(&self, domain: Domain) -> Result<HealthPublisher, HealthError> {
        let registry = self.registry.lock().map_err(|_| HealthError::Poisoned)?;
        if !registry.contains_key(&domain) {
            return Err(HealthError::UnregisteredDomain(domain));
        }
        Ok(HealthPublisher {
            domain,
            registry: Arc::clone(&self.registry),
        })
    }

    pub fn domains(&self) -> Vec<Domain> {
        self.registry
            .lock()
            .map(|registry| registry.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Runs one health tick and returns the records written.
    ///
    /// Pending flags are read and cleared atomically at the start, so a publish that lands while
    /// the tick runs counts towards the next one.
    pub async fn tick_once(&self) -> Result<Vec<HealthRecord>, HealthError> {
        let window = self.take_window()?;
        let freshness = self.node_freshness().await;
        let timestamp = Utc::now();

        let records: Vec<HealthRecord> = window
            .into_iter()
            .map(|(domain, slot)| {
                let (is_healthy, reason) = match &freshness {
                    Err(_) => (false, HealthReason::Unknown),
                    Ok(node) if !node.up_to_date => (false, HealthReason::NodeNotUpToDate),
                    Ok(_) if !slot.pending => (false, HealthReason::MissingStatusFromService),
                    Ok(_) => (slot.is_healthy, slot.reason),
                };
                HealthRecord {
                    timestamp,
                    domain,
                    is_healthy,
                    reason,
                }
            })
            .collect();

        self.record_metrics(&records, freshness.as_ref().ok());
        self.snapshot
            .replace(HealthVerdict {
                evaluated_at: Some(timestamp),
                node: freshness.as_ref().ok().copied(),
                records: records.clone(),
            })
            .await;

        if records.is_empty() {
            return Ok(records);
        }

        self.sink
            .write_records(&records)
            .await
            .map_err(HealthError::Sink)?;

        let unhealthy = records.iter().filter(|record| !record.is_healthy).count();
        info!(
            event = "health_tick_completed",
            domains = records.len(),
            unhealthy,
            "health records written"
        );
        Ok(records)
    }

    /// Ticks every `interval` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so drivers get one window to publish.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(err) = self.tick_once().await {
                error!(
                    event = "health_tick_failed",
                    error = %err,
                    "health tick failed"
                );
            }
        }

        info!(event = "health_engine_stopped", "health engine stopped");
    }

    fn take_window(&self) -> Result<Vec<(Domain, DomainSlot)>, HealthError> {
        let mut registry = self.registry.lock().map_err(|_| HealthError::Poisoned)?;
        let window = registry
            .iter()
            .map(|(domain, slot)| (*domain, *slot))
            .collect();
        for slot in registry.values_mut() {
            slot.pending = false;
        }
        Ok(window)
    }

    async fn node_freshness(&self) -> Result<NodeFreshness, StatsError> {
        let (core, local) = tokio::join!(self.core.chain_stats(), self.local.chain_stats());
        let result = core.and_then(|core| {
            local.map(|local| NodeFreshness::evaluate(&core, &local, &self.config.thresholds))
        });

        match &result {
            Ok(node) if !node.up_to_date => warn!(
                event = "node_not_up_to_date",
                core_height = node.core_height,
                local_height = node.local_height,
                height_lag = node.height_lag,
                time_lag_seconds = node.time_lag_seconds,
                "local node is behind the authoritative chain"
            ),
            Ok(_) => {}
            Err(err) => warn!(
                event = "node_freshness_unavailable",
                error = %err,
                "could not compare local node against authoritative chain"
            ),
        }
        result
    }

    fn record_metrics(&self, records: &[HealthRecord], freshness: Option<&NodeFreshness>) {
        let Some(metrics) = HEALTH_METRICS.get() else {
            return;
        };
        metrics.ticks_total.inc();
        if let Some(node) = freshness {
            metrics.node_height_lag.set(node.height_lag);
            metrics.node_time_lag_seconds.set(node.time_lag_seconds);
        }
        for record in records {
            metrics
                .domain_healthy
                .get_or_create(&DomainLabels::new(record.domain))
                .set(i64::from(record.is_healthy));
        }
    }
}
