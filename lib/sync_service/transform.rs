use futures::future::BoxFuture;
use thiserror::Error;

use super::store::UpsertRow;
use super::types::{Fetched, Height};
use super::validators::ResolveError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("validator lookup failed at height {height}: {source}")]
    ValidatorLookup {
        height: Height,
        #[source]
        source: ResolveError,
    },
    #[error("invalid payload at height {height}: {message}")]
    InvalidPayload { height: Height, message: String },
}

/// Converts fetched payloads into rows for one domain.
///
/// Input arrives sorted by height; output rows must keep that order.
pub trait RowTransformer<P: Send + 'static>: Send + Sync {
    type Row: UpsertRow;

    fn transform<'a>(
        &'a self,
        fetched: Vec<Fetched<P>>,
    ) -> BoxFuture<'a, Result<Vec<Self::Row>, TransformError>>;
}
