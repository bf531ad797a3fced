use thiserror::Error;
use tokio::task::JoinError;

use crate::domain::Domain;
use crate::health::HealthError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no domains enabled; configure an upstream or adjust --domains")]
    NoDomainsEnabled,

    #[error(transparent)]
    Health(#[from] HealthError),

    #[error("Task join error: {0}")]
    TaskJoinError(#[from] JoinError),

    #[error("sync tick failed for: {}", .0.iter().map(|d| d.as_str()).collect::<Vec<_>>().join(", "))]
    TickFailed(Vec<Domain>),
}
