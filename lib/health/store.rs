use chrono::{DateTime, Utc};
use diesel::insert_into;
use diesel::pg::upsert::excluded;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use diesel_async::pooled_connection::deadpool::Pool;
use futures::future::BoxFuture;

use super::{ChainStats, ChainStatsSource, HealthRecord, HealthRecordSink, StatsError};
use crate::db::models::HealthRecordRow;
use crate::db::schema::{block_signers, health_records};
use crate::db::{map_diesel_error, map_pool_error};
use crate::sync_service::types::PersistError;

impl From<&HealthRecord> for HealthRecordRow {
    fn from(record: &HealthRecord) -> Self {
        Self {
            time: record.timestamp,
            domain: record.domain.as_str().to_string(),
            is_healthy: record.is_healthy,
            reason: record.reason.as_str().to_string(),
        }
    }
}

pub struct PgHealthRecordSink {
    pool: Pool<AsyncPgConnection>,
}

impl PgHealthRecordSink {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }
}

impl HealthRecordSink for PgHealthRecordSink {
    fn write_records<'a>(&'a self, records: &'a [HealthRecord]) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            let rows: Vec<HealthRecordRow> = records.iter().map(HealthRecordRow::from).collect();
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            conn.transaction::<(), diesel::result::Error, _>(|conn| {
                async move {
                    insert_into(health_records::table)
                        .values(&rows)
                        .on_conflict((health_records::time, health_records::domain))
                        .do_update()
                        .set((
                            health_records::is_healthy.eq(excluded(health_records::is_healthy)),
                            health_records::reason.eq(excluded(health_records::reason)),
                        ))
                        .execute(conn)
                        .await?;
                    Ok(())
                }
                .scope_boxed()
            })
            .await
            .map_err(map_diesel_error)
        })
    }
}

/// Local side of the freshness check: the newest block recorded in `block_signers`.
pub struct PgStoredChainStats {
    pool: Pool<AsyncPgConnection>,
}

impl PgStoredChainStats {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }
}

impl ChainStatsSource for PgStoredChainStats {
    fn chain_stats<'a>(&'a self) -> BoxFuture<'a, Result<ChainStats, StatsError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            let latest = block_signers::table
                .select((block_signers::height, block_signers::time))
                .order(block_signers::height.desc())
                .first::<(i64, DateTime<Utc>)>(&mut conn)
                .await
                .optional()
                .map_err(map_diesel_error)?;

            let (height, time) = latest.ok_or(StatsError::Empty)?;
            Ok(ChainStats { height, time })
        })
    }
}
