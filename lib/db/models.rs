use chrono::{DateTime, Utc};
use diesel::prelude::*;

use super::schema::{
    asset_prices, block_signers, comet_txs, health_records, history_segments, network_balances,
};

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = block_signers)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct BlockSigner {
    pub time: DateTime<Utc>,
    pub height: i64,
    pub role: String,
    pub address: String,
    pub public_key: String,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = comet_txs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CometTx {
    pub time: DateTime<Utc>,
    pub height: i64,
    pub tx_index: i32,
    pub code: i64,
    pub codespace: String,
    pub gas_wanted: i64,
    pub gas_used: i64,
}

/// `amount` is a decimal string; balances exceed `i64` and must not lose precision.
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = network_balances)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NetworkBalance {
    pub time: DateTime<Utc>,
    pub height: i64,
    pub asset_id: String,
    pub source: String,
    pub amount: String,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = asset_prices)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AssetPrice {
    pub time: DateTime<Utc>,
    pub height: i64,
    pub asset_id: String,
    pub source: String,
    pub price: f64,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = history_segments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct HistorySegment {
    pub time: DateTime<Utc>,
    pub height: i64,
    pub segment_index: i64,
    pub start_height: i64,
    pub end_height: i64,
    pub checkpoint_hash: String,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = health_records)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct HealthRecordRow {
    pub time: DateTime<Utc>,
    pub domain: String,
    pub is_healthy: bool,
    pub reason: String,
}
