use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::warn;

use super::types::{Height, PersistError};

/// A row with a natural key that makes re-persisting it idempotent.
pub trait UpsertRow: Clone + Send + Sync + 'static {
    type Key: Eq + Hash + Clone + fmt::Debug + Send;

    fn natural_key(&self) -> Self::Key;

    fn height(&self) -> Height;
}

/// Read side of a domain table: the highest height durably stored.
pub trait CheckpointSource: Send + Sync {
    fn latest_height<'a>(&'a self) -> BoxFuture<'a, Result<Option<Height>, PersistError>>;
}

impl<T> CheckpointSource for Arc<T>
where
    T: CheckpointSource + ?Sized,
{
    fn latest_height<'a>(&'a self) -> BoxFuture<'a, Result<Option<Height>, PersistError>> {
        (**self).latest_height()
    }
}

/// Write side of a domain table.
pub trait RowPersister<R: UpsertRow>: CheckpointSource {
    /// Upserts every row in a single transaction and returns the number of rows written.
    ///
    /// Callers guarantee that no two rows share a natural key.
    fn upsert_rows<'a>(&'a self, rows: &'a [R]) -> BoxFuture<'a, Result<usize, PersistError>>;
}

impl<R, T> RowPersister<R> for Arc<T>
where
    R: UpsertRow,
    T: RowPersister<R> + ?Sized,
{
    fn upsert_rows<'a>(&'a self, rows: &'a [R]) -> BoxFuture<'a, Result<usize, PersistError>> {
        (**self).upsert_rows(rows)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("flush of {rows_dropped} rows failed: {source}")]
pub struct FlushError {
    /// Rows discarded from the buffer; they are re-fetched on a later tick.
    pub rows_dropped: usize,
    #[source]
    pub source: PersistError,
}

/// Per-domain write buffer.
///
/// Rows accumulate with [`add`](Self::add) and are written in one transaction by
/// [`flush_upsert`](Self::flush_upsert). The buffer is emptied whether or not the flush succeeds.
pub struct BatchUpsertStore<R, P> {
    persister: P,
    buffer: Vec<R>,
}

impl<R, P> BatchUpsertStore<R, P>
where
    R: UpsertRow,
    P: RowPersister<R>,
{
    pub fn new(persister: P) -> Self {
        Self {
            persister,
            buffer: Vec::new(),
        }
    }

    pub fn add(&mut self, row: R) {
        self.buffer.push(row);
    }

    /// Writes the buffered rows and returns what was written, in insertion order after
    /// deduplication.
    pub async fn flush_upsert(&mut self) -> Result<Vec<R>, FlushError> {
        let mut rows = std::mem::take(&mut self.buffer);
        if rows.is_empty() {
            return Ok(rows);
        }

        let duplicates = dedupe_by_natural_key(&mut rows);
        if duplicates > 0 {
            warn!(
                event = "upsert_buffer_duplicates_collapsed",
                duplicates,
                remaining = rows.len(),
                "collapsed rows sharing a natural key; last occurrence kept"
            );
        }

        match self.persister.upsert_rows(&rows).await {
            Ok(_) => Ok(rows),
            Err(source) => Err(FlushError {
                rows_dropped: rows.len(),
                source,
            }),
        }
    }

    pub async fn latest_height(&self) -> Result<Option<Height>, PersistError> {
        self.persister.latest_height().await
    }
}

#[cfg(test)]
impl<R, P> BatchUpsertStore<R, P> {
    fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn persister(&self) -> &P {
        &self.persister
    }
}

/// Keeps only the last row for each natural key, preserving the relative order of survivors.
/// Returns the number of rows removed.
///
/// Postgres rejects an `ON CONFLICT DO UPDATE` statement that touches the same row twice.
pub fn dedupe_by_natural_key<R: UpsertRow>(rows: &mut Vec<R>) -> usize {
    let mut last_index: HashMap<R::Key, usize> = HashMap::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        last_index.insert(row.natural_key(), index);
    }

    let before = rows.len();
    if last_index.len() == before {
        return 0;
    }

    let mut index = 0;
    rows.retain(|row| {
        let keep = last_index.get(&row.natural_key()) == Some(&index);
        index += 1;
        keep
    });
    before - rows.len()
}
