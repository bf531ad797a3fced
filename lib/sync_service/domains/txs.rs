use std::sync::Arc;

use chrono::{DateTime, Utc};
use diesel::dsl::max;
use diesel::insert_into;
use diesel::pg::upsert::excluded;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use futures::future::BoxFuture;

use super::{comet_chain_tip, comet_earliest_available, PgPool};
use crate::db::models::CometTx;
use crate::db::schema::comet_txs;
use crate::db::{map_diesel_error, map_pool_error, MAX_ROWS_PER_STATEMENT};
use crate::sync_service::source::BlockSource;
use crate::sync_service::store::{CheckpointSource, RowPersister, UpsertRow};
use crate::sync_service::transform::{RowTransformer, TransformError};
use crate::sync_service::types::{FetchError, Fetched, Height, PersistError};
use crate::upstream::comet::BlockResults;
use crate::upstream::CometClient;

impl UpsertRow for CometTx {
    type Key = (DateTime<Utc>, Height, i32);

    fn natural_key(&self) -> Self::Key {
        (self.time, self.height, self.tx_index)
    }

    fn height(&self) -> Height {
        self.height
    }
}

/// Transaction results of one block plus the block time from its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTxs {
    pub time: DateTime<Utc>,
    pub results: BlockResults,
}

/// Block time is not part of `/block_results`, so each height costs two node requests.
pub struct BlockResultsSource {
    client: Arc<CometClient>,
}

impl BlockResultsSource {
    pub fn new(client: Arc<CometClient>) -> Self {
        Self { client }
    }
}

impl BlockSource for BlockResultsSource {
    type Payload = BlockTxs;

    fn fetch_block<'a>(&'a self, height: Height) -> BoxFuture<'a, Result<BlockTxs, FetchError>> {
        Box::pin(async move {
            let (header, results) = tokio::try_join!(
                self.client.get_header(height),
                self.client.get_block_results(height)
            )?;
            Ok(BlockTxs {
                time: header.time,
                results,
            })
        })
    }

    fn fetch_chain_tip<'a>(&'a self) -> BoxFuture<'a, Result<Height, FetchError>> {
        Box::pin(comet_chain_tip(&self.client))
    }

    fn fetch_earliest_available<'a>(&'a self) -> BoxFuture<'a, Result<Height, FetchError>> {
        Box::pin(comet_earliest_available(&self.client))
    }
    /// `/header` and `/block_results`.
    fn requests_per_block(&self) -> u32 {
        2
    }
}

pub struct TxTransformer;

impl RowTransformer<BlockTxs> for TxTransformer {
    type Row = CometTx;

    fn transform<'a>(
        &'a self,
        fetched: Vec<Fetched<BlockTxs>>,
    ) -> BoxFuture<'a, Result<Vec<CometTx>, TransformError>> {
        Box::pin(async move {
            let mut rows = Vec::new();
            for Fetched { height, value } in fetched {
                let results = value.results.txs_results.unwrap_or_default();
                for (index, tx) in results.into_iter().enumerate() {
                    let tx_index = i32::try_from(index).map_err(|_| TransformError::InvalidPayload {
                        height,
                        message: format!("tx index {index} out of range"),
                    })?;
                    rows.push(CometTx {
                        time: value.time,
                        height,
                        tx_index,
                        code: i64::from(tx.code),
                        codespace: tx.codespace,
                        gas_wanted: tx.gas_wanted,
                        gas_used: tx.gas_used,
                    });
                }
            }
            Ok(rows)
        })
    }
}

pub struct PgCometTxStore {
    pool: PgPool,
}

impl PgCometTxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CheckpointSource for PgCometTxStore {
    fn latest_height<'a>(&'a self) -> BoxFuture<'a, Result<Option<Height>, PersistError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            comet_txs::table
                .select(max(comet_txs::height))
                .first::<Option<i64>>(&mut conn)
                .await
                .map_err(map_diesel_error)
        })
    }
}

impl RowPersister<CometTx> for PgCometTxStore {
    fn upsert_rows<'a>(&'a self, rows: &'a [CometTx]) -> BoxFuture<'a, Result<usize, PersistError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            conn.transaction::<usize, diesel::result::Error, _>(|conn| {
                async move {
                    let mut written = 0;
                    for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
                        written += insert_into(comet_txs::table)
                            .values(chunk)
                            .on_conflict((comet_txs::time, comet_txs::height, comet_txs::tx_index))
                            .do_update()
                            .set((
                                comet_txs::code.eq(excluded(comet_txs::code)),
                                comet_txs::codespace.eq(excluded(comet_txs::codespace)),
                                comet_txs::gas_wanted.eq(excluded(comet_txs::gas_wanted)),
                                comet_txs::gas_used.eq(excluded(comet_txs::gas_used)),
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
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use super::{BlockResultsSource, BlockTxs, TxTransformer};
    use crate::sync_service::source::BlockSource;
    use crate::sync_service::transform::RowTransformer;
    use crate::sync_service::types::Fetched;
    use crate::upstream::comet::{BlockResults, TxResult};
    use crate::upstream::CometClient;

    fn tx(code: u32, gas_used: i64) -> TxResult {
        TxResult {
            code,
            codespace: if code == 0 { String::new() } else { "sdk".to_string() },
            gas_wanted: 200_000,
            gas_used,
        }
    }

    #[tokio::test]
    async fn one_row_per_tx_result_in_order() {
        let time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let fetched = vec![
            Fetched {
                height: 20,
                value: BlockTxs {
                    time,
                    results: BlockResults {
                        height: 20,
                        txs_results: None,
                    },
                },
            },
            Fetched {
                height: 21,
                value: BlockTxs {
                    time,
                    results: BlockResults {
                        height: 21,
                        txs_results: Some(vec![tx(0, 90_000), tx(11, 200_000)]),
                    },
                },
            },
        ];

        let rows = TxTransformer.transform(fetched).await.unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].height, rows[0].tx_index, rows[0].code), (21, 0, 0));
        assert_eq!((rows[1].tx_index, rows[1].code, rows[1].codespace.as_str()), (1, 11, "sdk"));
    }

    #[test]
    fn header_and_results_each_take_a_permit() {
        let source = BlockResultsSource::new(Arc::new(CometClient::new("http://127.0.0.1:26657")));
        assert_eq!(source.requests_per_block(), 2);
        assert_eq!(Arc::new(source).requests_per_block(), 2);
    }
}
