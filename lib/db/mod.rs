pub mod models;
pub mod schema;

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::{
    pg::AsyncPgConnection,
    pooled_connection::{
        deadpool::{BuildError, Pool, PoolError},
        AsyncDieselConnectionManager,
    },
};

use crate::sync_service::types::PersistError;

/// Postgres caps one statement at 65535 bind parameters; the widest row binds 7.
pub const MAX_ROWS_PER_STATEMENT: usize = 4_000;

pub async fn build_db_pool(db_url: &str) -> Result<Pool<AsyncPgConnection>, BuildError> {
    let pool_config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    let pool = Pool::builder(pool_config).build()?;

    Ok(pool)
}

pub fn map_diesel_error(error: DieselError) -> PersistError {
    match error {
        DieselError::DatabaseError(kind, info) => match kind {
            DatabaseErrorKind::SerializationFailure
            | DatabaseErrorKind::ClosedConnection
            | DatabaseErrorKind::UnableToSendCommand => PersistError::retryable(format!(
                "transient database error ({kind:?}): {}",
                info.message()
            )),
            _ => PersistError::fatal(format!(
                "fatal database error ({kind:?}): {}",
                info.message()
            )),
        },
        DieselError::RollbackTransaction => {
            PersistError::retryable("transaction rollback requested by database".to_string())
        }
        other => PersistError::fatal(format!("fatal diesel error: {other}")),
    }
}

pub fn map_pool_error(error: PoolError) -> PersistError {
    PersistError::retryable(format!("could not check out database connection: {error}"))
}

#[cfg(test)]
mod tests {
    use diesel::result::{DatabaseErrorKind, Error as DieselError};

    use super::map_diesel_error;

    #[test]
    fn serialization_failures_are_retryable() {
        let err = DieselError::DatabaseError(
            DatabaseErrorKind::SerializationFailure,
            Box::new("could not serialize access".to_string()),
        );
        assert!(map_diesel_error(err).is_retryable());
    }

    #[test]
    fn constraint_violations_are_fatal() {
        let err = DieselError::DatabaseError(
            DatabaseErrorKind::CheckViolation,
            Box::new("amount must be non-negative".to_string()),
        );
        assert!(!map_diesel_error(err).is_retryable());
        assert!(!map_diesel_error(DieselError::NotFound).is_retryable());
    }
}
