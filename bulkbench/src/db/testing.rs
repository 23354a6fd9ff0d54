//! Fault-injecting store for tests. Wraps the in-process mutex store and
//! reads its knobs from the property table, so a whole job can be driven
//! against it.

use std::thread;
use std::time::Duration;

use toml::Table;

use crate::db::{Predicate, Row, Schema, StdBTreeMapMutex, StoreError, DB};

pub struct FlakyStore {
    inner: StdBTreeMapMutex,
    insert_transient: i64,
    insert_fail_at: Option<i64>,
    insert_delay: Duration,
    drop_inserts: bool,
    drop_updates: bool,
    query_delay: Duration,
    insert_calls: i64,
    pub insert_batches: Vec<usize>,
    pub update_batches: Vec<usize>,
}

fn int(props: &Table, key: &str) -> Option<i64> {
    props.get(key).and_then(|v| v.as_integer())
}

fn flag(props: &Table, key: &str) -> bool {
    props.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn millis(props: &Table, key: &str) -> Duration {
    Duration::from_millis(int(props, key).unwrap_or(0).max(0) as u64)
}

fn injected() -> StoreError {
    StoreError::SchemaMismatch("injected failure".to_string())
}

impl DB for FlakyStore {
    fn new(props: &Table) -> Result<Self, StoreError> {
        if flag(props, "flakyconnectfail") {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(FlakyStore {
            inner: StdBTreeMapMutex::new(props)?,
            insert_transient: int(props, "flakyinserttransient").unwrap_or(0),
            insert_fail_at: int(props, "flakyinsertfailat"),
            insert_delay: millis(props, "flakyinsertdelayms"),
            drop_inserts: flag(props, "flakydropinserts"),
            drop_updates: flag(props, "flakydropupdates"),
            query_delay: millis(props, "flakyquerydelayms"),
            insert_calls: 0,
            insert_batches: Vec::new(),
            update_batches: Vec::new(),
        })
    }

    fn create_table(&mut self, table: &str, schema: &'static Schema) -> Result<(), StoreError> {
        self.inner.create_table(table, schema)
    }

    fn bulk_insert(&mut self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        self.insert_calls += 1;
        if self.insert_calls <= self.insert_transient {
            return Err(StoreError::Unavailable("tablet server busy".to_string()));
        }
        if self.insert_fail_at.is_some_and(|n| self.insert_calls >= n) {
            return Err(injected());
        }
        if !self.insert_delay.is_zero() {
            thread::sleep(self.insert_delay);
        }
        // Acknowledges the whole batch but stores all but its last row.
        let applied = if self.drop_inserts && !rows.is_empty() {
            &rows[..rows.len() - 1]
        } else {
            rows
        };
        self.inner.bulk_insert(table, applied)?;
        self.insert_batches.push(rows.len());
        Ok(())
    }

    fn query(&mut self, table: &str, predicate: &Predicate) -> Result<Vec<Row>, StoreError> {
        if !self.query_delay.is_zero() {
            thread::sleep(self.query_delay);
        }
        self.inner.query(table, predicate)
    }

    fn bulk_update(&mut self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        let applied = if self.drop_updates && !rows.is_empty() {
            &rows[..rows.len() - 1]
        } else {
            rows
        };
        self.inner.bulk_update(table, applied)?;
        self.update_batches.push(rows.len());
        Ok(())
    }
}
