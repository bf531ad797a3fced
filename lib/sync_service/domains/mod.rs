//! Per-domain sources, transforms and Postgres persisters.

pub mod signers;
pub mod snapshots;
pub mod txs;

use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::AsyncPgConnection;

use super::types::{FetchError, Height};
use crate::upstream::CometClient;

pub type PgPool = Pool<AsyncPgConnection>;

pub(crate) async fn comet_chain_tip(client: &CometClient) -> Result<Height, FetchError> {
    Ok(client.get_status().await?.latest_block_height)
}

pub(crate) async fn comet_earliest_available(client: &CometClient) -> Result<Height, FetchError> {
    Ok(client.get_status().await?.earliest_block_height)
}
