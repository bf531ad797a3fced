//! Height-templated JSON feeds: network balances, asset prices and history segments.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use diesel::dsl::max;
use diesel::insert_into;
use diesel::pg::upsert::excluded;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{comet_chain_tip, comet_earliest_available, PgPool};
use crate::db::models::{AssetPrice, HistorySegment, NetworkBalance};
use crate::db::schema::{asset_prices, history_segments, network_balances};
use crate::db::{map_diesel_error, map_pool_error, MAX_ROWS_PER_STATEMENT};
use crate::sync_service::source::BlockSource;
use crate::sync_service::store::{CheckpointSource, RowPersister, UpsertRow};
use crate::sync_service::transform::{RowTransformer, TransformError};
use crate::sync_service::types::{FetchError, Fetched, Height, PersistError};
use crate::upstream::height_json::HeightSnapshot;
use crate::upstream::{CometClient, HeightJsonClient};

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BalanceEntry {
    pub asset_id: String,
    pub source: String,
    pub amount: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PriceEntry {
    pub asset_id: String,
    pub source: String,
    pub price: f64,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry {
    pub segment_index: i64,
    pub start_height: Height,
    pub end_height: Height,
    pub checkpoint_hash: String,
}

/// Fetches `HeightSnapshot<E>` from a templated URL; tip and retention come from the node.
pub struct SnapshotSource<E> {
    feed: HeightJsonClient,
    node: Arc<CometClient>,
    entries: PhantomData<fn() -> E>,
}

impl<E> SnapshotSource<E> {
    pub fn new(feed: HeightJsonClient, node: Arc<CometClient>) -> Self {
        Self {
            feed,
            node,
            entries: PhantomData,
        }
    }
}

impl<E> BlockSource for SnapshotSource<E>
where
    E: DeserializeOwned + Send + 'static,
{
    type Payload = HeightSnapshot<E>;

    fn fetch_block<'a>(&'a self, height: Height) -> BoxFuture<'a, Result<HeightSnapshot<E>, FetchError>> {
        Box::pin(async move { Ok(self.feed.get_snapshot(height).await?) })
    }

    fn fetch_chain_tip<'a>(&'a self) -> BoxFuture<'a, Result<Height, FetchError>> {
        Box::pin(comet_chain_tip(&self.node))
    }

    fn fetch_earliest_available<'a>(&'a self) -> BoxFuture<'a, Result<Height, FetchError>> {
        Box::pin(comet_earliest_available(&self.node))
    }
}

fn invalid(height: Height, message: impl Into<String>) -> TransformError {
    TransformError::InvalidPayload {
        height,
        message: message.into(),
    }
}

fn is_decimal_amount(raw: &str) -> bool {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    let mut parts = digits.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next();
    !whole.is_empty()
        && whole.bytes().all(|b| b.is_ascii_digit())
        && fraction.map_or(true, |f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()))
}

pub struct BalanceTransformer;

impl RowTransformer<HeightSnapshot<BalanceEntry>> for BalanceTransformer {
    type Row = NetworkBalance;

    fn transform<'a>(
        &'a self,
        fetched: Vec<Fetched<HeightSnapshot<BalanceEntry>>>,
    ) -> BoxFuture<'a, Result<Vec<NetworkBalance>, TransformError>> {
        Box::pin(async move {
            let mut rows = Vec::new();
            for Fetched { height, value } in fetched {
                for entry in value.entries {
                    if !is_decimal_amount(&entry.amount) {
                        return Err(invalid(height, format!("amount `{}` is not a decimal", entry.amount)));
                    }
                    rows.push(NetworkBalance {
                        time: value.time,
                        height,
                        asset_id: entry.asset_id,
                        source: entry.source,
                        amount: entry.amount,
                    });
                }
            }
            Ok(rows)
        })
    }
}

pub struct PriceTransformer;

impl RowTransformer<HeightSnapshot<PriceEntry>> for PriceTransformer {
    type Row = AssetPrice;

    fn transform<'a>(
        &'a self,
        fetched: Vec<Fetched<HeightSnapshot<PriceEntry>>>,
    ) -> BoxFuture<'a, Result<Vec<AssetPrice>, TransformError>> {
        Box::pin(async move {
            let mut rows = Vec::new();
            for Fetched { height, value } in fetched {
                for entry in value.entries {
                    if !entry.price.is_finite() {
                        return Err(invalid(height, format!("price for {} is not finite", entry.asset_id)));
                    }
                    rows.push(AssetPrice {
                        time: value.time,
                        height,
                        asset_id: entry.asset_id,
                        source: entry.source,
                        price: entry.price,
                    });
                }
            }
            Ok(rows)
        })
    }
}

pub struct SegmentTransformer;

impl RowTransformer<HeightSnapshot<SegmentEntry>> for SegmentTransformer {
    type Row = HistorySegment;

    fn transform<'a>(
        &'a self,
        fetched: Vec<Fetched<HeightSnapshot<SegmentEntry>>>,
    ) -> BoxFuture<'a, Result<Vec<HistorySegment>, TransformError>> {
        Box::pin(async move {
            let mut rows = Vec::new();
            for Fetched { height, value } in fetched {
                for entry in value.entries {
                    if entry.start_height > entry.end_height {
                        return Err(invalid(
                            height,
                            format!(
                                "segment {} spans [{}, {}]",
                                entry.segment_index, entry.start_height, entry.end_height
                            ),
                        ));
                    }
                    rows.push(HistorySegment {
                        time: value.time,
                        height,
                        segment_index: entry.segment_index,
                        start_height: entry.start_height,
                        end_height: entry.end_height,
                        checkpoint_hash: entry.checkpoint_hash,
                    });
                }
            }
            Ok(rows)
        })
    }
}

impl UpsertRow for NetworkBalance {
    type Key = (DateTime<Utc>, String, String);

    fn natural_key(&self) -> Self::Key {
        (self.time, self.asset_id.clone(), self.source.clone())
    }

    fn height(&self) -> Height {
        self.height
    }
}

impl UpsertRow for AssetPrice {
    type Key = (DateTime<Utc>, String, String);

    fn natural_key(&self) -> Self::Key {
        (self.time, self.asset_id.clone(), self.source.clone())
    }

    fn height(&self) -> Height {
        self.height
    }
}

impl UpsertRow for HistorySegment {
    type Key = (DateTime<Utc>, i64);

    fn natural_key(&self) -> Self::Key {
        (self.time, self.segment_index)
    }

    fn height(&self) -> Height {
        self.height
    }
}

pub struct PgNetworkBalanceStore {
    pool: PgPool,
}

impl PgNetworkBalanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CheckpointSource for PgNetworkBalanceStore {
    fn latest_height<'a>(&'a self) -> BoxFuture<'a, Result<Option<Height>, PersistError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            network_balances::table
                .select(max(network_balances::height))
                .first::<Option<i64>>(&mut conn)
                .await
                .map_err(map_diesel_error)
        })
    }
}

impl RowPersister<NetworkBalance> for PgNetworkBalanceStore {
    fn upsert_rows<'a>(&'a self, rows: &'a [NetworkBalance]) -> BoxFuture<'a, Result<usize, PersistError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            conn.transaction::<usize, diesel::result::Error, _>(|conn| {
                async move {
                    let mut written = 0;
                    for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
                        written += insert_into(network_balances::table)
                            .values(chunk)
                            .on_conflict((
                                network_balances::time,
                                network_balances::asset_id,
                                network_balances::source,
                            ))
                            .do_update()
                            .set((
                                network_balances::height.eq(excluded(network_balances::height)),
                                network_balances::amount.eq(excluded(network_balances::amount)),
                            ))
                            .execute(conn)
                            .await?;
                    }
                    Ok(written)
                }
                .scope_boxed()
            })
            .await
            .map_err(map_diesel_error)
        })
    }
}

pub struct PgAssetPriceStore {
    pool: PgPool,
}

impl PgAssetPriceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CheckpointSource for PgAssetPriceStore {
    fn latest_height<'a>(&'a self) -> BoxFuture<'a, Result<Option<Height>, PersistError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            asset_prices::table
                .select(max(asset_prices::height))
                .first::<Option<i64>>(&mut conn)
                .await
                .map_err(map_diesel_error)
        })
    }
}

impl RowPersister<AssetPrice> for PgAssetPriceStore {
    fn upsert_rows<'a>(&'a self, rows: &'a [AssetPrice]) -> BoxFuture<'a, Result<usize, PersistError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            conn.transaction::<usize, diesel::result::Error, _>(|conn| {
                async move {
                    let mut written = 0;
                    for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
                        written += insert_into(asset_prices::table)
                            .values(chunk)
                            .on_conflict((
                                asset_prices::time,
                                asset_prices::asset_id,
                                asset_prices::source,
                            ))
                            .do_update()
                            .set((
                                asset_prices::height.eq(excluded(asset_prices::height)),
                                asset_prices::price.eq(excluded(asset_prices::price)),
                            ))
                            .execute(conn)
                            .await?;
                    }
                    Ok(written)
                }
                .scope_boxed()
            })
            .await
            .map_err(map_diesel_error)
        })
    }
}

pub struct PgHistorySegmentStore {
    pool: PgPool,
}

impl PgHistorySegmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CheckpointSource for PgHistorySegmentStore {
    fn latest_height<'a>(&'a self) -> BoxFuture<'a, Result<Option<Height>, PersistError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            history_segments::table
                .select(max(history_segments::height))
                .first::<Option<i64>>(&mut conn)
                .await
                .map_err(map_diesel_error)
        })
    }
}

impl RowPersister<HistorySegment> for PgHistorySegmentStore {
    fn upsert_rows<'a>(&'a self, rows: &'a [HistorySegment]) -> BoxFuture<'a, Result<usize, PersistError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            conn.transaction::<usize, diesel::result::Error, _>(|conn| {
                async move {
                    let mut written = 0;
                    for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
                        written += insert_into(history_segments::table)
                            .values(chunk)
                            .on_conflict((history_segments::time, history_segments::segment_index))
                            .do_update()
                            .set((
                                history_segments::height.eq(excluded(history_segments::height)),
                                history_segments::start_height
                                    .eq(excluded(history_segments::start_height)),
                                history_segments::end_height.eq(excluded(history_segments::end_height)),
                                history_segments::checkpoint_hash
                                    .eq(excluded(history_segments::checkpoint_hash)),
                            ))
                            .execute(conn)
                            .await?;
                    }
                    Ok(written)
                }
                .scope_boxed()
            })
            .await
            .map_err(map_diesel_error)
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{
        is_decimal_amount, BalanceEntry, BalanceTransformer, PriceEntry, PriceTransformer,
        SegmentEntry, SegmentTransformer,
    };
    use crate::sync_service::transform::{RowTransformer, TransformError};
    use crate::sync_service::types::Fetched;
    use crate::upstream::height_json::HeightSnapshot;

    fn snapshot<E>(entries: Vec<E>) -> HeightSnapshot<E> {
        HeightSnapshot {
            time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            entries,
        }
    }

    #[test]
    fn decimal_amounts() {
        assert!(is_decimal_amount("1000000000000000000000"));
        assert!(is_decimal_amount("-12.5"));
        assert!(!is_decimal_amount("1e9"));
        assert!(!is_decimal_amount("12."));
        assert!(!is_decimal_amount(""));
    }

    #[tokio::test]
    async fn balances_keep_entry_identity_and_height() {
        let fetched = vec![Fetched {
            height: 40,
            value: snapshot(vec![BalanceEntry {
                asset_id: "upenumbra".to_string(),
                source: "staking".to_string(),
                amount: "1000000000000000000000".to_string(),
            }]),
        }];

        let rows = BalanceTransformer.transform(fetched).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].height, 40);
        assert_eq!(rows[0].amount, "1000000000000000000000");
    }

    #[tokio::test]
    async fn non_finite_price_is_rejected() {
        let fetched = vec![Fetched {
            height: 41,
            value: snapshot(vec![PriceEntry {
                asset_id: "atom".to_string(),
                source: "oracle".to_string(),
                price: f64::NAN,
            }]),
        }];

        let err = PriceTransformer.transform(fetched).await.unwrap_err();
        assert!(matches!(err, TransformError::InvalidPayload { height: 41, .. }));
    }

    #[tokio::test]
    async fn inverted_segment_is_rejected() {
        let fetched = vec![Fetched {
            height: 42,
            value: snapshot(vec![SegmentEntry {
                segment_index: 3,
                start_height: 100,
                end_height: 50,
                checkpoint_hash: "abc".to_string(),
            }]),
        }];

        assert!(SegmentTransformer.transform(fetched).await.is_err());
    }
}
