use std::env;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_COMET_RPC_URL: &str = "http://127.0.0.1:26657";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("{name} must contain a {{height}} placeholder, got {value}")]
    MissingHeightPlaceholder { name: String, value: String },
}

/// Process configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    /// Local node RPC used for blocks, txs, validators and the chain tip.
    pub comet_rpc_url: String,
    /// Chain statistics source used to judge local node freshness.
    pub authoritative_rpc_url: String,
    pub balances_url: Option<String>,
    pub prices_url: Option<String>,
    pub segments_url: Option<String>,
    pub sync_interval: Duration,
    pub health_interval: Duration,
    /// Default: 200
    pub batch_size: i64,
    pub lookback_blocks: i64,
    pub fetch_concurrency: usize,
    pub upstream_request_interval: Duration,
    pub node_max_height_lag: i64,
    pub node_max_time_lag: Duration,
    pub validator_cache_ttl: Duration,
    pub validator_cache_max_entries: usize,
    pub metrics_bind: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds config from an arbitrary variable lookup so parsing can be tested without touching
    /// the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_url = lookup("DATABASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;
        let comet_rpc_url = lookup("COMET_RPC_URL")
            .unwrap_or_else(|| DEFAULT_COMET_RPC_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let authoritative_rpc_url = lookup("AUTHORITATIVE_RPC_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| comet_rpc_url.clone());

        Ok(Self {
            db_url,
            comet_rpc_url,
            authoritative_rpc_url,
            balances_url: height_template(&lookup, "BALANCES_URL")?,
            prices_url: height_template(&lookup, "PRICES_URL")?,
            segments_url: height_template(&lookup, "SEGMENTS_URL")?,
            sync_interval: Duration::from_secs(positive(&lookup, "SYNC_INTERVAL_SECS", 30)?),
            health_interval: Duration::from_secs(positive(&lookup, "HEALTH_INTERVAL_SECS", 60)?),
            batch_size: positive(&lookup, "SYNC_BATCH_SIZE", 200)?,
            lookback_blocks: non_negative(&lookup, "SYNC_LOOKBACK_BLOCKS", 10_000)?,
            fetch_concurrency: positive(&lookup, "FETCH_CONCURRENCY", 32)?,
            upstream_request_interval: Duration::from_millis(positive(
                &lookup,
                "UPSTREAM_REQUEST_INTERVAL_MS",
                20,
            )?),
            node_max_height_lag: non_negative(&lookup, "NODE_MAX_HEIGHT_LAG", 900)?,
            node_max_time_lag: Duration::from_secs(non_negative::<_, u64>(
                &lookup,
                "NODE_MAX_TIME_LAG_SECS",
                600,
            )?),
            validator_cache_ttl: Duration::from_secs(positive(
                &lookup,
                "VALIDATOR_CACHE_TTL_SECS",
                3600,
            )?),
            validator_cache_max_entries: positive(&lookup, "VALIDATOR_CACHE_MAX_ENTRIES", 10_000)?,
            metrics_bind: lookup("METRICS_BIND").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
        })
    }
}

fn parse_number<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                value,
            }),
        None => Ok(default),
    }
}

fn positive<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialOrd + Default + ToString,
{
    let value = parse_number(lookup, name, default)?;
    if value <= T::default() {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn non_negative<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialOrd + Default + ToString,
{
    let value = parse_number(lookup, name, default)?;
    if value < T::default() {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn height_template<F>(lookup: &F, name: &str) -> Result<Option<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) if !value.contains("{height}") => Err(ConfigError::MissingHeightPlaceholder {
            name: name.to_string(),
            value,
        }),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigError};
    use std::collections::HashMap;
    use std::time::Duration;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let config = Config::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://x/y")]))
            .expect("config should parse");

        assert_eq!(config.batch_size, 200);
        assert_eq!(config.node_max_height_lag, 900);
        assert_eq!(config.node_max_time_lag, Duration::from_secs(600));
        assert_eq!(config.health_interval, Duration::from_secs(60));
        assert_eq!(config.authoritative_rpc_url, config.comet_rpc_url);
        assert!(config.balances_url.is_none());
    }

    #[test]
    fn missing_database_url_is_reported() {
        let err = Config::from_lookup(lookup_from(&[])).expect_err("DATABASE_URL is required");
        assert_eq!(err, ConfigError::MissingEnvVar("DATABASE_URL".to_string()));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://x/y"),
            ("SYNC_BATCH_SIZE", "0"),
        ]))
        .expect_err("zero batch size must be rejected");

        assert!(matches!(err, ConfigError::InvalidValue { ref name, .. } if name == "SYNC_BATCH_SIZE"));
    }

    #[test]
    fn node_time_lag_accepts_zero_and_rejects_negative() {
        let config = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://x/y"),
            ("NODE_MAX_TIME_LAG_SECS", "0"),
        ]))
        .expect("zero lag is a valid threshold");
        assert_eq!(config.node_max_time_lag, Duration::ZERO);

        let err = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://x/y"),
            ("NODE_MAX_TIME_LAG_SECS", "-5"),
        ]))
        .expect_err("negative lag must be rejected");
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "NODE_MAX_TIME_LAG_SECS".to_string(),
                value: "-5".to_string(),
            }
        );
    }

    #[test]
    fn domain_urls_require_height_placeholder() {
        let err = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://x/y"),
            ("PRICES_URL", "https://prices.example/latest"),
        ]))
        .expect_err("template without placeholder must be rejected");
        assert!(matches!(err, ConfigError::MissingHeightPlaceholder { .. }));

        let config = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://x/y"),
            ("PRICES_URL", "https://prices.example/at/{height}"),
        ]))
        .expect("template with placeholder is valid");
        assert_eq!(
            config.prices_url.as_deref(),
            Some("https://prices.example/at/{height}")
        );
    }
}
