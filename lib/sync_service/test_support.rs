use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use futures::future::BoxFuture;

use super::source::BlockSource;
use super::store::{CheckpointSource, RowPersister, UpsertRow};
use super::transform::{RowTransformer, TransformError};
use super::types::{FetchError, FetchErrorKind, Fetched, Height, PersistError};
use super::validators::{ValidatorEntry, ValidatorListSource};
use crate::domain::Domain;
use crate::health::{
    ChainStats, ChainStatsSource, HealthConfig, HealthEngine, HealthEngineBuilder, HealthRecord,
    HealthRecordSink, HealthSnapshot, StatsError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TestRow {
    pub height: Height,
    pub key: String,
    pub value: i64,
}

pub(crate) fn test_row(height: Height, key: &str, value: i64) -> TestRow {
    TestRow {
        height,
        key: key.to_string(),
        value,
    }
}

impl UpsertRow for TestRow {
    type Key = (Height, String);

    fn natural_key(&self) -> Self::Key {
        (self.height, self.key.clone())
    }

    fn height(&self) -> Height {
        self.height
    }
}

/// Serves `rows_per_height` generated rows for every height unless a plan overrides it.
pub(crate) struct MockSource {
    tip: Height,
    earliest: Height,
    rows_per_height: usize,
    requests_per_block: u32,
    plans: Mutex<HashMap<Height, VecDeque<Result<Vec<TestRow>, FetchError>>>>,
    block_calls: Mutex<HashMap<Height, u32>>,
    earliest_calls: AtomicU32,
}

impl MockSource {
    pub(crate) fn serving_rows(tip: Height, earliest: Height, rows_per_height: usize) -> Self {
        Self {
            tip,
            earliest,
            rows_per_height,
            requests_per_block: 1,
            plans: Mutex::new(HashMap::new()),
            block_calls: Mutex::new(HashMap::new()),
            earliest_calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn with_requests_per_block(mut self, requests: u32) -> Self {
        self.requests_per_block = requests;
        self
    }

    /// Scripted responses for `height`, consumed in order before falling back to generated rows.
    pub(crate) fn with_block_plan(
        self,
        height: Height,
        responses: Vec<Result<Vec<TestRow>, FetchError>>,
    ) -> Self {
        self.plans
            .lock()
            .expect("plans mutex poisoned")
            .insert(height, responses.into_iter().collect());
        self
    }

    pub(crate) fn block_calls_for(&self, height: Height) -> u32 {
        *self
            .block_calls
            .lock()
            .expect("block_calls mutex poisoned")
            .get(&height)
            .unwrap_or(&0)
    }

    pub(crate) fn total_block_calls(&self) -> u32 {
        self.block_calls
            .lock()
            .expect("block_calls mutex poisoned")
            .values()
            .sum()
    }

    pub(crate) fn earliest_calls(&self) -> u32 {
        self.earliest_calls.load(Ordering::SeqCst)
    }

    fn generated_rows(&self, height: Height) -> Vec<TestRow> {
        (0..self.rows_per_height)
            .map(|index| {
                let key = char::from(b'a' + (index % 26) as u8).to_string();
                test_row(height, &key, height)
            })
            .collect()
    }
}

impl BlockSource for MockSource {
    type Payload = Vec<TestRow>;

    fn fetch_block<'a>(&'a self, height: Height) -> BoxFuture<'a, Result<Self::Payload, FetchError>> {
        Box::pin(async move {
            *self
                .block_calls
                .lock()
                .expect("block_calls mutex poisoned")
                .entry(height)
                .or_insert(0) += 1;

            if height > self.tip {
                return Err(FetchError::new(
                    FetchErrorKind::HttpStatus,
                    format!("height {height} is above tip {}", self.tip),
                ));
            }

            let planned = self
                .plans
                .lock()
                .expect("plans mutex poisoned")
                .get_mut(&height)
                .and_then(VecDeque::pop_front);
            planned.unwrap_or_else(|| Ok(self.generated_rows(height)))
        })
    }

    fn fetch_chain_tip<'a>(&'a self) -> BoxFuture<'a, Result<Height, FetchError>> {
        Box::pin(async move { Ok(self.tip) })
    }

    fn fetch_earliest_available<'a>(&'a self) -> BoxFuture<'a, Result<Height, FetchError>> {
        Box::pin(async move {
            self.earliest_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.earliest)
        })
    }

    fn requests_per_block(&self) -> u32 {
        self.requests_per_block
    }
}

pub(crate) struct PassthroughTransformer;

impl RowTransformer<Vec<TestRow>> for PassthroughTransformer {
    type Row = TestRow;

    fn transform<'a>(
        &'a self,
        fetched: Vec<Fetched<Vec<TestRow>>>,
    ) -> BoxFuture<'a, Result<Vec<TestRow>, TransformError>> {
        Box::pin(async move { Ok(fetched.into_iter().flat_map(|f| f.value).collect()) })
    }
}

/// In-memory table keyed by natural key, with scripted flush outcomes.
#[derive(Default)]
pub(crate) struct MemoryPersister {
    rows: Mutex<BTreeMap<(Height, String), TestRow>>,
    outcomes: Mutex<VecDeque<Result<(), PersistError>>>,
    flush_calls: AtomicU32,
}

impl MemoryPersister {
    pub(crate) fn with_outcomes(outcomes: Vec<Result<(), PersistError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Inserts rows directly, bypassing flush accounting.
    pub(crate) fn seed(&self, rows: Vec<TestRow>) {
        let mut stored = self.rows.lock().expect("rows mutex poisoned");
        for row in rows {
            stored.insert(row.natural_key(), row);
        }
    }

    pub(crate) fn rows(&self) -> Vec<TestRow> {
        self.rows
            .lock()
            .expect("rows mutex poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn row_count(&self) -> usize {
        self.rows.lock().expect("rows mutex poisoned").len()
    }

    pub(crate) fn latest(&self) -> Option<Height> {
        self.rows
            .lock()
            .expect("rows mutex poisoned")
            .values()
            .map(|row| row.height)
            .max()
    }

    pub(crate) fn flush_calls(&self) -> u32 {
        self.flush_calls.load(Ordering::SeqCst)
    }
}

impl CheckpointSource for MemoryPersister {
    fn latest_height<'a>(&'a self) -> BoxFuture<'a, Result<Option<Height>, PersistError>> {
        Box::pin(async move { Ok(self.latest()) })
    }
}

impl RowPersister<TestRow> for MemoryPersister {
    fn upsert_rows<'a>(&'a self, rows: &'a [TestRow]) -> BoxFuture<'a, Result<usize, PersistError>> {
        Box::pin(async move {
            self.flush_calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .outcomes
                .lock()
                .expect("outcomes mutex poisoned")
                .pop_front()
                .unwrap_or(Ok(()));
            next?;

            self.seed(rows.to_vec());
            Ok(rows.len())
        })
    }
}

pub(crate) struct MockValidatorList {
    validators: Vec<ValidatorEntry>,
    calls: AtomicU32,
}

impl MockValidatorList {
    pub(crate) fn new(validators: Vec<(&str, &str)>) -> Self {
        Self {
            validators: validators
                .into_iter()
                .map(|(address, public_key)| ValidatorEntry {
                    address: address.to_string(),
                    public_key: public_key.to_string(),
                })
                .collect(),
            calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ValidatorListSource for MockValidatorList {
    fn fetch_validators<'a>(&'a self) -> BoxFuture<'a, Result<Vec<ValidatorEntry>, FetchError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(self.validators.clone())
        })
    }
}

struct FixedStats(ChainStats);

impl ChainStatsSource for FixedStats {
    fn chain_stats<'a>(&'a self) -> BoxFuture<'a, Result<ChainStats, StatsError>> {
        Box::pin(async move { Ok(self.0) })
    }
}

struct DiscardSink;

impl HealthRecordSink for DiscardSink {
    fn write_records<'a>(&'a self, _records: &'a [HealthRecord]) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Health engine whose node is always up to date and whose records go nowhere.
pub(crate) fn test_health_engine(domains: &[Domain]) -> HealthEngine {
    let stats = Arc::new(FixedStats(ChainStats {
        height: 1_000,
        time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    }));
    domains
        .iter()
        .fold(HealthEngineBuilder::new(HealthConfig::default()), |builder, domain| {
            builder.register(*domain)
        })
        .build(stats.clone(), stats, Arc::new(DiscardSink), HealthSnapshot::default())
}
