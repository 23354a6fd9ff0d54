use std::thread;

use tracing::debug;

use crate::db::{Row, DB};
use crate::error::JobError;
use crate::job::Stage;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::workloads::Workload;

/// Applies [`Workload::transform`] to every row, splitting the work across
/// up to `workers` scoped threads. Output order matches input order.
pub fn transform_all<U: Workload>(
    workload: &U,
    rows: &[Row],
    workers: usize,
) -> Result<Vec<Row>, JobError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let chunk = rows.len().div_ceil(workers.max(1));
    let parts: Vec<Result<Vec<Row>, JobError>> = thread::scope(|s| {
        let handles: Vec<_> = rows
            .chunks(chunk)
            .map(|part| {
                s.spawn(move || {
                    part.iter()
                        .map(|row| workload.transform(row))
                        .collect::<Result<Vec<Row>, JobError>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or(Err(JobError::WorkerPanicked {
                    stage: Stage::Updating,
                }))
            })
            .collect()
    });

    let mut ret = Vec::with_capacity(rows.len());
    for part in parts {
        ret.extend(part?);
    }
    Ok(ret)
}

/// Submits `rows` as bulk updates of at most `batch_size` rows each. Returns
/// the number of rows updated.
pub fn bulk_update<T: DB>(
    db: &mut T,
    table: &str,
    rows: &[Row],
    batch_size: usize,
    retry: &RetryPolicy,
) -> Result<usize, JobError> {
    if batch_size == 0 {
        return Err(JobError::Config("batchsize must be positive".to_string()));
    }
    for chunk in rows.chunks(batch_size) {
        retry_with_backoff(retry, "bulk update", || db.bulk_update(table, chunk)).map_err(
            |source| JobError::BatchWrite {
                stage: Stage::Updating,
                rows: chunk.len(),
                source,
            },
        )?;
        debug!(rows = chunk.len(), "flushed update batch");
    }
    Ok(rows.len())
}
