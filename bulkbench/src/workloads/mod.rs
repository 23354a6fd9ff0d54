use std::ops::Range;

use toml::Table;

use crate::client::ClientProperties;
use crate::db::{Predicate, Row, Schema};
use crate::error::JobError;
use crate::CoreProperties;

mod sfmta;
pub use sfmta::SfmtaWorkload;
#[cfg(test)]
pub use sfmta::SFMTA_SCHEMA;

pub trait Workload: 'static + std::marker::Send + std::marker::Sync + Sized {
    fn new(
        core_props: &CoreProperties,
        client_props: &ClientProperties,
        props: &Table,
    ) -> Result<Self, JobError>;

    fn table(&self) -> &str;

    fn schema(&self) -> &'static Schema;

    /// The synthetic record for primary key `key`.
    fn build_row(&self, key: i64) -> Row;

    /// Matches every freshly generated row.
    fn seed_predicate(&self) -> Predicate;

    /// True when every generated row matches [`Workload::seed_predicate`],
    /// so the pre-update scan must return every inserted key.
    fn seeded(&self) -> bool;

    /// Matches every row after [`Workload::transform`].
    fn target_predicate(&self) -> Predicate;

    /// Pure rewrite of one scanned row. Column order and every column other
    /// than the rewritten one are carried over unchanged.
    fn transform(&self, row: &Row) -> Result<Row, JobError>;
}

/// Contiguous primary-key range `[start, start + total)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyRange {
    start: i64,
    total: i64,
}

impl KeyRange {
    pub fn new(start: i64, total: i64) -> Result<Self, JobError> {
        if start < 0 || total <= 0 || start.checked_add(total).is_none() {
            return Err(JobError::InvalidRange { start, total });
        }
        Ok(KeyRange { start, total })
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn keys(&self) -> Range<i64> {
        self.start..self.start + self.total
    }

    /// Splits into at most `parts` disjoint contiguous sub-ranges covering
    /// `self` in ascending order. Earlier parts take the remainder, one key
    /// each.
    pub fn split(&self, parts: u32) -> Vec<KeyRange> {
        let parts = i64::from(parts.max(1)).min(self.total);
        let mut ret = Vec::with_capacity(parts as usize);
        let mut start = self.start;
        for i in 0..parts {
            let total = self.total / parts + if i < self.total % parts { 1 } else { 0 };
            ret.push(KeyRange { start, total });
            start += total;
        }
        ret
    }
}

/// Lazily generates one row per key of `range`, in ascending key order.
pub fn records<U: Workload>(workload: &U, range: KeyRange) -> impl Iterator<Item = Row> + '_ {
    range.keys().map(move |key| workload.build_row(key))
}
