//! Fixed-size batching between the record stream and the store.
//!
//! Rows accumulate in a buffer that never grows past `batch_size`. A full
//! buffer is handed to the flush callback as one bulk call and cleared;
//! [`BatchLoader::finish`] flushes whatever partial batch is left.

use std::ops::AddAssign;

use crate::db::Row;
use crate::error::JobError;

pub const DEFAULT_BATCH_SIZE: usize = 10_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub rows: u64,
    pub flushes: u64,
}

impl AddAssign for LoadStats {
    fn add_assign(&mut self, rhs: Self) {
        self.rows += rhs.rows;
        self.flushes += rhs.flushes;
    }
}

pub struct BatchLoader<F>
where
    F: FnMut(&[Row]) -> Result<(), JobError>,
{
    buffer: Vec<Row>,
    batch_size: usize,
    flush: F,
    stats: LoadStats,
}

impl<F> BatchLoader<F>
where
    F: FnMut(&[Row]) -> Result<(), JobError>,
{
    pub fn new(batch_size: usize, flush: F) -> Result<Self, JobError> {
        if batch_size == 0 {
            return Err(JobError::Config("batchsize must be positive".to_string()));
        }
        Ok(BatchLoader {
            buffer: Vec::with_capacity(batch_size),
            batch_size,
            flush,
            stats: LoadStats::default(),
        })
    }

    pub fn push(&mut self, row: Row) -> Result<(), JobError> {
        self.buffer.push(row);
        if self.buffer.len() == self.batch_size {
            self.flush_buffer()?;
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<(), JobError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        (self.flush)(&self.buffer)?;
        self.stats.rows += self.buffer.len() as u64;
        self.stats.flushes += 1;
        self.buffer.clear();
        Ok(())
    }

    /// Flushes the trailing partial batch, if any.
    pub fn finish(mut self) -> Result<LoadStats, JobError> {
        self.flush_buffer()?;
        Ok(self.stats)
    }

    /// Drains `rows` through the buffer and finishes. Stops at the first
    /// failed flush.
    pub fn load<I>(mut self, rows: I) -> Result<LoadStats, JobError>
    where
        I: IntoIterator<Item = Row>,
    {
        for row in rows {
            self.push(row)?;
        }
        self.finish()
    }
}
