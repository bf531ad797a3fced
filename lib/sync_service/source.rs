use std::sync::Arc;

use futures::future::BoxFuture;

use super::types::{FetchError, Height};

/// Upstream fetch collaborator for one domain.
///
/// Implementations wrap a REST client; the trait exists so driver logic can be tested against
/// scripted responses without network access.
pub trait BlockSource: Send + Sync + 'static {
    type Payload: Send + 'static;

    /// Fetches one unit of domain data for `height`.
    fn fetch_block<'a>(&'a self, height: Height) -> BoxFuture<'a, Result<Self::Payload, FetchError>>;

    /// Fetches the current chain tip.
    fn fetch_chain_tip<'a>(&'a self) -> BoxFuture<'a, Result<Height, FetchError>>;

    /// Fetches the earliest height the upstream still retains.
    fn fetch_earliest_available<'a>(&'a self) -> BoxFuture<'a, Result<Height, FetchError>>;

    /// Upstream requests one `fetch_block` call issues. The range fetcher takes one limiter
    /// permit per request.
    fn requests_per_block(&self) -> u32 {
        1
    }
}

impl<T> BlockSource for Arc<T>
where
    T: BlockSource + ?Sized,
{
    type Payload = T::Payload;

    fn fetch_block<'a>(&'a self, height: Height) -> BoxFuture<'a, Result<Self::Payload, FetchError>> {
        (**self).fetch_block(height)
    }

    fn fetch_chain_tip<'a>(&'a self) -> BoxFuture<'a, Result<Height, FetchError>> {
        (**self).fetch_chain_tip()
    }

    fn fetch_earliest_available<'a>(&'a self) -> BoxFuture<'a, Result<Height, FetchError>> {
        (**self).fetch_earliest_available()
    }

    fn requests_per_block(&self) -> u32 {
        (**self).requests_per_block()
    }
}
