use std::time::Duration;

use thiserror::Error;

use crate::db::StoreError;
use crate::job::Stage;

/// Everything that can end a job. None of these are recovered from locally;
/// retries happen below this level, on `StoreError`.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid key range: start {start}, total {total}")]
    InvalidRange { start: i64, total: i64 },

    #[error("cannot establish store session")]
    StoreUnavailable(#[source] StoreError),

    #[error("bulk write of {rows} rows failed during {stage}")]
    BatchWrite {
        stage: Stage,
        rows: usize,
        #[source]
        source: StoreError,
    },

    #[error("query failed during {stage}")]
    Query {
        stage: Stage,
        #[source]
        source: StoreError,
    },

    #[error("verification mismatch: {0}")]
    VerificationMismatch(String),

    #[error("{stage} exceeded its deadline of {limit:?}")]
    DeadlineExceeded { stage: Stage, limit: Duration },

    #[error("{stage} aborted after another worker failed")]
    Aborted { stage: Stage },

    #[error("worker panicked during {stage}")]
    WorkerPanicked { stage: Stage },

    #[error("row has {actual} columns, schema has {expected}")]
    RowShape { expected: usize, actual: usize },

    #[error("cannot spawn worker thread")]
    Spawn(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<toml::de::Error> for JobError {
    fn from(e: toml::de::Error) -> Self {
        JobError::Config(e.to_string())
    }
}
