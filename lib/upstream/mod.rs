pub mod comet;
pub mod height_json;

use std::error::Error as StdError;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::build_info;
use crate::sync_service::types::{FetchError, FetchErrorKind};

pub use comet::CometClient;
pub use height_json::HeightJsonClient;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("unexpected HTTP status while fetching {resource}: {status}")]
    UnexpectedStatus { resource: String, status: u16 },
    #[error("rpc error while fetching {resource}: {message}")]
    Rpc { resource: String, message: String },
    #[error("parse error: {0}")]
    ParseError(String),
    #[error(transparent)]
    JsonParseError(#[from] serde_json::Error),
    #[error(transparent)]
    RequestError(#[from] reqwest::Error),
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared settings for every upstream client: identifying user agent and a request timeout.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(build_info::user_agent())
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|err| {
            tracing::warn!(
                event = "http_client_defaults",
                error = %err,
                "falling back to a default HTTP client"
            );
            reqwest::Client::new()
        })
}

/// GETs `url` and decodes the JSON body, keeping transport, status and decode failures apart.
pub(crate) async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    resource: &str,
) -> Result<T, UpstreamError> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(UpstreamError::UnexpectedStatus {
            resource: resource.to_string(),
            status: response.status().as_u16(),
        });
    }

    let body = response.text().await?;
    serde_json::from_str(&body).map_err(Into::into)
}

pub fn map_upstream_error(error: UpstreamError) -> FetchError {
    match error {
        UpstreamError::UnexpectedStatus { resource, status } => map_status_to_fetch_error(&resource, status),
        UpstreamError::Rpc { resource, message } => FetchError::new(
            FetchErrorKind::UpstreamUnavailable,
            format!("rpc error while fetching {resource}: {message}"),
        ),
        UpstreamError::RequestError(req_err) => {
            tracing::debug!(
                event = "upstream_request_error_diagnostics",
                reqwest_status = ?req_err.status().map(|status| status.as_u16()),
                reqwest_url = ?req_err.url().map(|url| url.as_str()),
                reqwest_is_timeout = req_err.is_timeout(),
                reqwest_is_connect = req_err.is_connect(),
                reqwest_error_chain = %render_error_chain(&req_err),
                "captured reqwest diagnostics"
            );

            if let Some(status) = req_err.status() {
                return map_status_to_fetch_error("upstream resource", status.as_u16());
            }
            if req_err.is_decode() {
                return FetchError::new(FetchErrorKind::Decode, format!("response decode error: {req_err}"));
            }
            FetchError::new(
                FetchErrorKind::Network,
                format!("network/transport error: {req_err}"),
            )
        }
        UpstreamError::JsonParseError(err) => {
            FetchError::new(FetchErrorKind::Decode, format!("invalid JSON payload: {err}"))
        }
        UpstreamError::ParseError(message) => {
            FetchError::new(FetchErrorKind::Decode, format!("unparseable payload: {message}"))
        }
    }
}

impl From<UpstreamError> for FetchError {
    fn from(error: UpstreamError) -> Self {
        map_upstream_error(error)
    }
}

fn map_status_to_fetch_error(resource: &str, status: u16) -> FetchError {
    match status {
        429 => FetchError::new(
            FetchErrorKind::RateLimited,
            format!("rate limited while fetching {resource}"),
        ),
        500..=599 => FetchError::new(
            FetchErrorKind::UpstreamUnavailable,
            format!("upstream server error {status} while fetching {resource}"),
        ),
        _ => FetchError::new(
            FetchErrorKind::HttpStatus,
            format!("unexpected HTTP status {status} while fetching {resource}"),
        ),
    }
}

fn render_error_chain(error: &reqwest::Error) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(next) = source {
        parts.push(next.to_string());
        source = next.source();
    }
    parts.join(" | caused_by: ")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrInt {
    String(String),
    Int(i64),
}

/// Accepts integers encoded either as JSON numbers or as decimal strings.
pub(crate) fn de_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match StringOrInt::deserialize(deserializer)? {
        StringOrInt::Int(value) => Ok(value),
        StringOrInt::String(raw) => raw.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::{map_upstream_error, UpstreamError};
    use crate::sync_service::types::FetchErrorKind;

    #[test]
    fn status_codes_map_to_fetch_kinds() {
        let kind = |status| {
            map_upstream_error(UpstreamError::UnexpectedStatus {
                resource: "commit 7".to_string(),
                status,
            })
            .kind
        };

        assert_eq!(kind(429), FetchErrorKind::RateLimited);
        assert_eq!(kind(503), FetchErrorKind::UpstreamUnavailable);
        assert_eq!(kind(404), FetchErrorKind::HttpStatus);
    }

    #[test]
    fn decode_failures_are_decode_kind() {
        let err = serde_json::from_str::<u32>("{").unwrap_err();
        assert_eq!(
            map_upstream_error(UpstreamError::JsonParseError(err)).kind,
            FetchErrorKind::Decode
        );
        assert_eq!(
            map_upstream_error(UpstreamError::ParseError("bad".into())).kind,
            FetchErrorKind::Decode
        );
    }
}
