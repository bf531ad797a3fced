use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{de_i64, get_json, UpstreamError};
use crate::health::{ChainStats, ChainStatsSource, StatsError};
use crate::sync_service::types::{FetchError, Height};
use crate::sync_service::validators::{ValidatorEntry, ValidatorListSource};

const VALIDATORS_PER_PAGE: usize = 100;
const MAX_VALIDATOR_PAGES: usize = 100;

#[derive(Deserialize, Debug)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize, Debug)]
struct RpcErrorBody {
    message: String,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusResult {
    pub sync_info: SyncInfo,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SyncInfo {
    #[serde(deserialize_with = "de_i64")]
    pub latest_block_height: Height,
    pub latest_block_time: DateTime<Utc>,
    #[serde(deserialize_with = "de_i64")]
    pub earliest_block_height: Height,
    #[serde(default)]
    pub catching_up: bool,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    #[serde(deserialize_with = "de_i64")]
    pub height: Height,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub proposer_address: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HeaderResult {
    pub header: BlockHeader,
}

/// `block_id_flag` values of a commit signature.
pub const BLOCK_ID_FLAG_ABSENT: u8 = 1;
pub const BLOCK_ID_FLAG_COMMIT: u8 = 2;
pub const BLOCK_ID_FLAG_NIL: u8 = 3;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommitSig {
    pub block_id_flag: u8,
    #[serde(default)]
    pub validator_address: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    #[serde(deserialize_with = "de_i64")]
    pub height: Height,
    #[serde(default)]
    pub signatures: Vec<CommitSig>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignedHeader {
    pub header: BlockHeader,
    pub commit: Commit,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub signed_header: SignedHeader,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxResult {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub codespace: String,
    #[serde(deserialize_with = "de_i64")]
    pub gas_wanted: i64,
    #[serde(deserialize_with = "de_i64")]
    pub gas_used: i64,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockResults {
    #[serde(deserialize_with = "de_i64")]
    pub height: Height,
    /// `null` for blocks without transactions.
    #[serde(default)]
    pub txs_results: Option<Vec<TxResult>>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PubKey {
    #[serde(rename = "type")]
    pub key_type: String,
    pub value: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    pub address: String,
    pub pub_key: PubKey,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ValidatorsResult {
    pub validators: Vec<Validator>,
    #[serde(deserialize_with = "de_i64")]
    pub total: i64,
}

/// JSON-over-HTTP client for a CometBFT node RPC.
pub struct CometClient {
    client: reqwest::Client,
    base_url: String,
}

impl CometClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: super::http_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn rpc<T: DeserializeOwned>(&self, path: &str, resource: &str) -> Result<T, UpstreamError> {
        let url = format!("{}/{}", self.base_url, path);
        let envelope: RpcEnvelope<T> = get_json(&self.client, &url, resource).await?;
        unwrap_envelope(envelope, resource)
    }

    pub async fn get_status(&self) -> Result<SyncInfo, UpstreamError> {
        let status: StatusResult = self.rpc("status", "status").await?;
        Ok(status.sync_info)
    }

    pub async fn get_commit(&self, height: Height) -> Result<SignedHeader, UpstreamError> {
        let commit: CommitResult = self
            .rpc(&format!("commit?height={height}"), &format!("commit {height}"))
            .await?;
        Ok(commit.signed_header)
    }

    pub async fn get_header(&self, height: Height) -> Result<BlockHeader, UpstreamError> {
        let header: HeaderResult = self
            .rpc(&format!("header?height={height}"), &format!("header {height}"))
            .await?;
        Ok(header.header)
    }

    pub async fn get_block_results(&self, height: Height) -> Result<BlockResults, UpstreamError> {
        self.rpc(
            &format!("block_results?height={height}"),
            &format!("block_results {height}"),
        )
        .await
    }

    /// Current validator set, following pagination.
    pub async fn get_validators(&self) -> Result<Vec<Validator>, UpstreamError> {
        let mut validators = Vec::new();
        for page in 1..=MAX_VALIDATOR_PAGES {
            let result: ValidatorsResult = self
                .rpc(
                    &format!("validators?page={page}&per_page={VALIDATORS_PER_PAGE}"),
                    "validators",
                )
                .await?;
            let received = result.validators.len();
            validators.extend(result.validators);
            if received == 0 || validators.len() as i64 >= result.total {
                break;
            }
        }
        Ok(validators)
    }
}

fn unwrap_envelope<T>(envelope: RpcEnvelope<T>, resource: &str) -> Result<T, UpstreamError> {
    if let Some(error) = envelope.error {
        let message = match error.data {
            Some(data) if !data.is_empty() => format!("{}: {data}", error.message),
            _ => error.message,
        };
        return Err(UpstreamError::Rpc {
            resource: resource.to_string(),
            message,
        });
    }
    envelope
        .result
        .ok_or_else(|| UpstreamError::ParseError(format!("{resource}: response has no result")))
}

impl ChainStatsSource for CometClient {
    fn chain_stats<'a>(&'a self) -> BoxFuture<'a, Result<ChainStats, StatsError>> {
        Box::pin(async move {
            let status = self.get_status().await.map_err(FetchError::from)?;
            Ok(ChainStats {
                height: status.latest_block_height,
                time: status.latest_block_time,
            })
        })
    }
}

impl ValidatorListSource for CometClient {
    fn fetch_validators<'a>(&'a self) -> BoxFuture<'a, Result<Vec<ValidatorEntry>, FetchError>> {
        Box::pin(async move {
            let validators = self.get_validators().await?;
            Ok(validators
                .into_iter()
                .map(|validator| ValidatorEntry {
                    address: validator.address,
                    public_key: validator.pub_key.value,
                })
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{unwrap_envelope, BlockResults, CommitResult, RpcEnvelope, StatusResult};
    use crate::upstream::UpstreamError;

    #[test]
    fn status_decodes_string_encoded_heights() {
        let envelope: RpcEnvelope<StatusResult> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":-1,"result":{"node_info":{},"sync_info":{
                "latest_block_height":"1200","latest_block_time":"2024-05-01T12:00:00.123456789Z",
                "earliest_block_height":"501","catching_up":false}}}"#,
        )
        .unwrap();

        let status = unwrap_envelope(envelope, "status").unwrap();
        assert_eq!(status.sync_info.latest_block_height, 1200);
        assert_eq!(status.sync_info.earliest_block_height, 501);
    }

    #[test]
    fn commit_decodes_signatures() {
        let envelope: RpcEnvelope<CommitResult> = serde_json::from_str(
            r#"{"result":{"canonical":true,"signed_header":{
                "header":{"height":"7","time":"2024-05-01T12:00:00Z","proposer_address":"AA01"},
                "commit":{"height":"7","round":0,"signatures":[
                    {"block_id_flag":2,"validator_address":"AA01","timestamp":"2024-05-01T12:00:01Z","signature":"c2ln"},
                    {"block_id_flag":1,"validator_address":"","timestamp":"0001-01-01T00:00:00Z","signature":null}
                ]}}}}"#,
        )
        .unwrap();

        let commit = unwrap_envelope(envelope, "commit 7").unwrap().signed_header;
        assert_eq!(commit.header.proposer_address, "AA01");
        assert_eq!(commit.commit.signatures.len(), 2);
        assert_eq!(commit.commit.signatures[1].block_id_flag, 1);
    }

    #[test]
    fn block_results_accept_null_txs() {
        let results: BlockResults =
            serde_json::from_str(r#"{"height":"9","txs_results":null}"#).unwrap();
        assert_eq!(results.txs_results, None);

        let results: BlockResults = serde_json::from_str(
            r#"{"height":"9","txs_results":[{"code":5,"codespace":"sdk","gas_wanted":"200","gas_used":"150"}]}"#,
        )
        .unwrap();
        assert_eq!(results.txs_results.unwrap()[0].gas_used, 150);
    }

    #[test]
    fn rpc_error_is_surfaced() {
        let envelope: RpcEnvelope<StatusResult> = serde_json::from_str(
            r#"{"error":{"code":-32603,"message":"Internal error","data":"height 9 is not available"}}"#,
        )
        .unwrap();

        let err = unwrap_envelope(envelope, "commit 9").unwrap_err();
        assert!(matches!(err, UpstreamError::Rpc { ref message, .. } if message.contains("not available")));
    }
}
