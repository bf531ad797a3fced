use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{get_json, UpstreamError};
use crate::sync_service::types::Height;

pub const HEIGHT_PLACEHOLDER: &str = "{height}";

/// Body served by a height-templated endpoint: the entries valid at one block.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct HeightSnapshot<T> {
    pub time: DateTime<Utc>,
    #[serde(default = "Vec::new")]
    pub entries: Vec<T>,
}

/// Client for endpoints addressed by block height, e.g. `https://feed/prices?height={height}`.
pub struct HeightJsonClient {
    client: reqwest::Client,
    template: String,
    resource: &'static str,
}

impl HeightJsonClient {
    pub fn new(template: impl Into<String>, resource: &'static str) -> Self {
        Self {
            client: super::http_client(),
            template: template.into(),
            resource,
        }
    }

    pub fn url_for(&self, height: Height) -> String {
        self.template.replace(HEIGHT_PLACEHOLDER, &height.to_string())
    }

    pub async fn get_snapshot<T: DeserializeOwned>(
        &self,
        height: Height,
    ) -> Result<HeightSnapshot<T>, UpstreamError> {
        let resource = format!("{} {height}", self.resource);
        get_json(&self.client, &self.url_for(height), &resource).await
    }
}

#[cfg(test)]
mod tests {
    use super::{HeightJsonClient, HeightSnapshot};

    #[test]
    fn url_substitutes_height() {
        let client = HeightJsonClient::new("http://feed.local/prices?height={height}", "prices");
        assert_eq!(client.url_for(42), "http://feed.local/prices?height=42");
    }

    #[test]
    fn missing_entries_decode_as_empty() {
        let snapshot: HeightSnapshot<serde_json::Value> =
            serde_json::from_str(r#"{"time":"2024-05-01T12:00:00Z"}"#).unwrap();
        assert!(snapshot.entries.is_empty());
    }
}
