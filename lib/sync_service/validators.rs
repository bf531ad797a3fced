use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, info};

use super::types::FetchError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("validator {0} is not in the active validator set")]
    UnknownValidator(String),
    #[error("failed to load validator set: {0}")]
    Fetch(#[from] FetchError),
    #[error("validator cache lock poisoned")]
    Poisoned,
}

/// Maps a consensus address to the validator's encoded public key.
pub trait ValidatorResolver: Send + Sync {
    fn resolve<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<String, ResolveError>>;
}

impl<T> ValidatorResolver for Arc<T>
where
    T: ValidatorResolver + ?Sized,
{
    fn resolve<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<String, ResolveError>> {
        (**self).resolve(address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorEntry {
    pub address: String,
    pub public_key: String,
}

/// Upstream listing of the current validator set.
pub trait ValidatorListSource: Send + Sync {
    fn fetch_validators<'a>(&'a self) -> BoxFuture<'a, Result<Vec<ValidatorEntry>, FetchError>>;
}

impl<T> ValidatorListSource for Arc<T>
where
    T: ValidatorListSource + ?Sized,
{
    fn fetch_validators<'a>(&'a self) -> BoxFuture<'a, Result<Vec<ValidatorEntry>, FetchError>> {
        (**self).fetch_validators()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cached {
    Key(String),
    /// Address absent from the last loaded set; kept so departed validators do not force reloads.
    Missing,
}

struct CacheEntry {
    value: Cached,
    inserted_at: Instant,
}

/// Bounded, TTL-expiring resolver cache.
///
/// A miss reloads the full validator set from upstream. Reloads are serialized so concurrent misses
/// trigger a single upstream call, and an address not in the loaded set is remembered as missing
/// until the TTL expires.
pub struct CachedValidatorResolver<L> {
    source: L,
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
    reload: tokio::sync::Mutex<()>,
}

impl<L> CachedValidatorResolver<L>
where
    L: ValidatorListSource,
{
    pub fn new(source: L, ttl: Duration, max_entries: usize) -> Self {
        Self {
            source,
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
            reload: tokio::sync::Mutex::new(()),
        }
    }

    fn lookup(&self, address: &str) -> Result<Option<Cached>, ResolveError> {
        let mut entries = self.entries.lock().map_err(|_| ResolveError::Poisoned)?;
        let Some(entry) = entries.get(address) else {
            return Ok(None);
        };
        if entry.inserted_at.elapsed() < self.ttl {
            return Ok(Some(entry.value.clone()));
        }
        entries.remove(address);
        Ok(None)
    }

    /// Caches the loaded set plus a `Missing` marker for `requested` when it was not in the set.
    ///
    /// Over capacity, `Missing` markers go first, then the oldest keys. The caller answers from
    /// the loaded set, so eviction never changes the result of the lookup that triggered the load.
    fn store(&self, validators: Vec<ValidatorEntry>, requested: &str, found: bool) -> Result<(), ResolveError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().map_err(|_| ResolveError::Poisoned)?;
        entries.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);

        for validator in validators {
            entries.insert(
                normalize_address(&validator.address),
                CacheEntry {
                    value: Cached::Key(validator.public_key),
                    inserted_at: now,
                },
            );
        }
        if !found {
            entries.insert(
                requested.to_string(),
                CacheEntry {
                    value: Cached::Missing,
                    inserted_at: now,
                },
            );
        }

        if entries.len() > self.max_entries {
            let mut victims: Vec<(bool, Instant, String)> = entries
                .iter()
                .map(|(address, entry)| {
                    (
                        matches!(entry.value, Cached::Key(_)),
                        entry.inserted_at,
                        address.clone(),
                    )
                })
                .collect();
            victims.sort();
            let excess = entries.len() - self.max_entries;
            for (_, _, address) in victims.into_iter().take(excess) {
                entries.remove(&address);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
impl<L> CachedValidatorResolver<L> {
    fn cached_len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }
}

fn answer(address: String, cached: Cached) -> Result<String, ResolveError> {
    match cached {
        Cached::Key(public_key) => Ok(public_key),
        Cached::Missing => Err(ResolveError::UnknownValidator(address)),
    }
}

impl<L> ValidatorResolver for CachedValidatorResolver<L>
where
    L: ValidatorListSource,
{
    fn resolve<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<String, ResolveError>> {
        Box::pin(async move {
            let address = normalize_address(address);
            if let Some(cached) = self.lookup(&address)? {
                return answer(address, cached);
            }

            let _reload = self.reload.lock().await;
            // Another task may have reloaded while this one waited.
            if let Some(cached) = self.lookup(&address)? {
                return answer(address, cached);
            }

            debug!(
                event = "validator_cache_miss",
                address = %address,
                "reloading validator set"
            );
            let validators = self.source.fetch_validators().await?;
            info!(
                event = "validator_set_loaded",
                validators = validators.len(),
                "loaded validator set"
            );
            let found = validators
                .iter()
                .find(|validator| normalize_address(&validator.address) == address)
                .map(|validator| validator.public_key.clone());
            self.store(validators, &address, found.is_some())?;

            found.ok_or(ResolveError::UnknownValidator(address))
        })
    }
}

/// Addresses are hex; upstreams disagree on case.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{CachedValidatorResolver, ResolveError, ValidatorResolver};
    use crate::sync_service::test_support::MockValidatorList;

    #[tokio::test]
    async fn miss_loads_validator_set_once() {
        let list = Arc::new(MockValidatorList::new(vec![("AA01", "key-a"), ("BB02", "key-b")]));
        let resolver = CachedValidatorResolver::new(list.clone(), Duration::from_secs(60), 100);

        assert_eq!(resolver.resolve("aa01").await.unwrap(), "key-a");
        assert_eq!(resolver.resolve("BB02").await.unwrap(), "key-b");
        assert_eq!(list.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_reload() {
        let list = Arc::new(MockValidatorList::new(vec![("AA01", "key-a")]));
        let resolver = Arc::new(CachedValidatorResolver::new(
            list.clone(),
            Duration::from_secs(60),
            100,
        ));

        let lookups = (0..8).map(|_| {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.resolve("AA01").await })
        });
        for lookup in futures::future::join_all(lookups).await {
            assert_eq!(lookup.unwrap().unwrap(), "key-a");
        }
        assert_eq!(list.calls(), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_reloaded() {
        let list = Arc::new(MockValidatorList::new(vec![("AA01", "key-a")]));
        let resolver = CachedValidatorResolver::new(list.clone(), Duration::from_millis(50), 100);

        assert_eq!(resolver.resolve("AA01").await.unwrap(), "key-a");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(resolver.resolve("AA01").await.unwrap(), "key-a");
        assert_eq!(list.calls(), 2);
    }

    #[tokio::test]
    async fn unknown_address_is_an_error() {
        let list = Arc::new(MockValidatorList::new(vec![("AA01", "key-a")]));
        let resolver = CachedValidatorResolver::new(list.clone(), Duration::from_secs(60), 100);

        let err = resolver.resolve("FF00").await.unwrap_err();
        assert_eq!(err, ResolveError::UnknownValidator("FF00".to_string()));
    }

    #[tokio::test]
    async fn departed_validator_is_remembered_until_expiry() {
        let list = Arc::new(MockValidatorList::new(vec![("AA01", "key-a")]));
        let resolver = CachedValidatorResolver::new(list.clone(), Duration::from_millis(50), 100);

        for _ in 0..5 {
            let err = resolver.resolve("cc03").await.unwrap_err();
            assert_eq!(err, ResolveError::UnknownValidator("CC03".to_string()));
        }
        assert_eq!(list.calls(), 1);
        assert_eq!(resolver.resolve("AA01").await.unwrap(), "key-a");
        assert_eq!(list.calls(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(resolver.resolve("CC03").await.is_err());
        assert_eq!(list.calls(), 2);
    }

    #[tokio::test]
    async fn cache_never_exceeds_capacity() {
        let list = Arc::new(MockValidatorList::new(vec![
            ("AA01", "key-a"),
            ("BB02", "key-b"),
            ("CC03", "key-c"),
        ]));
        let resolver = CachedValidatorResolver::new(list, Duration::from_secs(60), 2);

        for (address, key) in [("AA01", "key-a"), ("BB02", "key-b"), ("CC03", "key-c")] {
            assert_eq!(resolver.resolve(address).await.unwrap(), key);
            assert!(resolver.cached_len() <= 2);
        }
    }
}
