use std::sync::Arc;

use chrono::{DateTime, Utc};
use diesel::dsl::max;
use diesel::insert_into;
use diesel::pg::upsert::excluded;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use futures::future::BoxFuture;
use tracing::debug;

use super::{comet_chain_tip, comet_earliest_available, PgPool};
use crate::db::models::BlockSigner;
use crate::db::schema::block_signers;
use crate::db::{map_diesel_error, map_pool_error, MAX_ROWS_PER_STATEMENT};
use crate::sync_service::source::BlockSource;
use crate::sync_service::store::{CheckpointSource, RowPersister, UpsertRow};
use crate::sync_service::transform::{RowTransformer, TransformError};
use crate::sync_service::types::{FetchError, Fetched, Height, PersistError};
use crate::sync_service::validators::{ResolveError, ValidatorResolver};
use crate::upstream::comet::{
    SignedHeader, BLOCK_ID_FLAG_ABSENT, BLOCK_ID_FLAG_COMMIT, BLOCK_ID_FLAG_NIL,
};
use crate::upstream::CometClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerRole {
    Proposer,
    Signer,
    Nil,
    Absent,
}

impl SignerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proposer => "proposer",
            Self::Signer => "signer",
            Self::Nil => "nil",
            Self::Absent => "absent",
        }
    }

    fn from_block_id_flag(flag: u8) -> Option<Self> {
        match flag {
            BLOCK_ID_FLAG_COMMIT => Some(Self::Signer),
            BLOCK_ID_FLAG_NIL => Some(Self::Nil),
            BLOCK_ID_FLAG_ABSENT => Some(Self::Absent),
            _ => None,
        }
    }
}

impl UpsertRow for BlockSigner {
    type Key = (DateTime<Utc>, String, String);

    fn natural_key(&self) -> Self::Key {
        (self.time, self.role.clone(), self.address.clone())
    }

    fn height(&self) -> Height {
        self.height
    }
}

/// Fetches `/commit?height=N`.
pub struct CommitSource {
    client: Arc<CometClient>,
}

impl CommitSource {
    pub fn new(client: Arc<CometClient>) -> Self {
        Self { client }
    }
}

impl BlockSource for CommitSource {
    type Payload = SignedHeader;

    fn fetch_block<'a>(&'a self, height: Height) -> BoxFuture<'a, Result<SignedHeader, FetchError>> {
        Box::pin(async move { Ok(self.client.get_commit(height).await?) })
    }

    fn fetch_chain_tip<'a>(&'a self) -> BoxFuture<'a, Result<Height, FetchError>> {
        Box::pin(comet_chain_tip(&self.client))
    }

    fn fetch_earliest_available<'a>(&'a self) -> BoxFuture<'a, Result<Height, FetchError>> {
        Box::pin(comet_earliest_available(&self.client))
    }
}

/// Turns a commit into one row for the proposer and one per attributed signature.
pub struct SignerTransformer<V> {
    resolver: V,
}

impl<V: ValidatorResolver> SignerTransformer<V> {
    pub fn new(resolver: V) -> Self {
        Self { resolver }
    }

    /// Validators that left the active set cannot be resolved any more; their rows keep an empty key.
    async fn public_key(&self, height: Height, address: &str) -> Result<String, TransformError> {
        match self.resolver.resolve(address).await {
            Ok(public_key) => Ok(public_key),
            Err(ResolveError::UnknownValidator(_)) => {
                debug!(
                    event = "signer_public_key_unknown",
                    height,
                    address,
                    "validator not in current set"
                );
                Ok(String::new())
            }
            Err(source) => Err(TransformError::ValidatorLookup { height, source }),
        }
    }

    async fn rows_for(&self, height: Height, signed: SignedHeader) -> Result<Vec<BlockSigner>, TransformError> {
        let time = signed.header.time;
        let mut rows = Vec::with_capacity(signed.commit.signatures.len() + 1);

        if !signed.header.proposer_address.is_empty() {
            let address = signed.header.proposer_address.to_ascii_uppercase();
            rows.push(BlockSigner {
                time,
                height,
                role: SignerRole::Proposer.as_str().to_string(),
                public_key: self.public_key(height, &address).await?,
                address,
            });
        }

        let mut unattributed = 0usize;
        for signature in signed.commit.signatures {
            let role = SignerRole::from_block_id_flag(signature.block_id_flag).ok_or_else(|| {
                TransformError::InvalidPayload {
                    height,
                    message: format!("unknown block_id_flag {}", signature.block_id_flag),
                }
            })?;
            if signature.validator_address.is_empty() {
                unattributed += 1;
                continue;
            }

            let address = signature.validator_address.to_ascii_uppercase();
            rows.push(BlockSigner {
                time,
                height,
                role: role.as_str().to_string(),
                public_key: self.public_key(height, &address).await?,
                address,
            });
        }

        if unattributed > 0 {
            debug!(
                event = "commit_signatures_unattributed",
                height,
                unattributed,
                "absent votes carry no validator address"
            );
        }
        Ok(rows)
    }
}

impl<V: ValidatorResolver> RowTransformer<SignedHeader> for SignerTransformer<V> {
    type Row = BlockSigner;

    fn transform<'a>(
        &'a self,
        fetched: Vec<Fetched<SignedHeader>>,
    ) -> BoxFuture<'a, Result<Vec<BlockSigner>, TransformError>> {
        Box::pin(async move {
            let mut rows = Vec::new();
            for Fetched { height, value } in fetched {
                rows.extend(self.rows_for(height, value).await?);
            }
            Ok(rows)
        })
    }
}

pub struct PgBlockSignerStore {
    pool: PgPool,
}

impl PgBlockSignerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CheckpointSource for PgBlockSignerStore {
    fn latest_height<'a>(&'a self) -> BoxFuture<'a, Result<Option<Height>, PersistError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            block_signers::table
                .select(max(block_signers::height))
                .first::<Option<i64>>(&mut conn)
                .await
                .map_err(map_diesel_error)
        })
    }
}

impl RowPersister<BlockSigner> for PgBlockSignerStore {
    fn upsert_rows<'a>(&'a self, rows: &'a [BlockSigner]) -> BoxFuture<'a, Result<usize, PersistError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            conn.transaction::<usize, diesel::result::Error, _>(|conn| {
                async move {
                    let mut written = 0;
                    for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
                        written += insert_into(block_signers::table)
                            .values(chunk)
                            .on_conflict((
                                block_signers::time,
                                block_signers::role,
                                block_signers::address,
                            ))
                            .do_update()
                            .set((
                                block_signers::height.eq(excluded(block_signers::height)),
                                block_signers::public_key.eq(excluded(block_signers::public_key)),
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
