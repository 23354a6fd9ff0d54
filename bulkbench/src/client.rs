use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use serde::Deserialize;
use toml::Table;
use tracing::debug;

use crate::batch::{BatchLoader, LoadStats, DEFAULT_BATCH_SIZE};
use crate::db::{Row, DB};
use crate::error::JobError;
use crate::job::Stage;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::workloads::{self, KeyRange, Workload};

/// One insert worker. Owns its store handle and its slice of the key range;
/// nothing is shared with other clients except the progress counter it
/// publishes and the abort flag it watches.
pub struct Client<T: DB, U: Workload> {
    props: ClientProperties,

    db: T,
    workload: Arc<U>,

    range: KeyRange,
    retry: RetryPolicy,

    progress: Arc<AtomicU64>,
    abort: Arc<AtomicBool>,
}

impl<T: DB, U: Workload> Client<T, U> {
    pub fn new(
        client_props: ClientProperties,
        db: T,
        workload: Arc<U>,
        range: KeyRange,
        abort: Arc<AtomicBool>,
    ) -> Result<Self, JobError> {
        let retry = client_props.retry_policy()?;
        Ok(Client {
            props: client_props,
            db,
            workload,
            range,
            retry,
            progress: Arc::new(AtomicU64::new(0)),
            abort,
        })
    }

    pub fn progress(&self) -> Arc<AtomicU64> {
        self.progress.clone()
    }

    pub fn range(&self) -> KeyRange {
        self.range
    }

    /// Generates this client's records and bulk-inserts them in batches.
    pub fn setup_initial_data(&mut self) -> Result<LoadStats, JobError> {
        let db = &mut self.db;
        let workload = &*self.workload;
        let retry = &self.retry;
        let progress = &self.progress;
        let abort = &self.abort;
        let table = workload.table();

        let loader = BatchLoader::new(self.props.batch_size, |rows: &[Row]| {
            if abort.load(Ordering::Acquire) {
                return Err(JobError::Aborted {
                    stage: Stage::Inserting,
                });
            }
            retry_with_backoff(retry, "bulk insert", || db.bulk_insert(table, rows)).map_err(
                |source| JobError::BatchWrite {
                    stage: Stage::Inserting,
                    rows: rows.len(),
                    source,
                },
            )?;
            progress.fetch_add(rows.len() as u64, Ordering::Relaxed);
            debug!(rows = rows.len(), "flushed insert batch");
            Ok(())
        })?;
        let stats = loader.load(workloads::records(workload, self.range))?;
        debug!(
            start = self.range.start(),
            total = self.range.total(),
            flushes = stats.flushes,
            "client finished"
        );
        Ok(stats)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct ClientProperties {
    #[serde(rename = "insertstart", default = "default_insert_start")]
    pub insert_start: i64,

    #[serde(rename = "recordcount", default = "default_record_count")]
    pub record_count: i64,

    #[serde(rename = "batchsize", default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(rename = "retries", default = "default_retries")]
    pub retries: usize,

    #[serde(rename = "retrybackoffms", default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(rename = "retrymaxbackoffms", default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,

    #[serde(rename = "retrymultiplier", default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
}

impl ClientProperties {
    pub fn parse(props: Table) -> Result<Self, toml::de::Error> {
        props.try_into()
    }

    pub fn key_range(&self) -> Result<KeyRange, JobError> {
        KeyRange::new(self.insert_start, self.record_count)
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, JobError> {
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            return Err(JobError::Config(format!(
                "retrymultiplier must be at least 1, got {}",
                self.retry_multiplier
            )));
        }
        Ok(RetryPolicy {
            max_retries: self.retries,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            backoff_multiplier: self.retry_multiplier,
        })
    }
}

fn default_insert_start() -> i64 {
    0
}
fn default_record_count() -> i64 {
    0
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_retries() -> usize {
    3
}
fn default_retry_backoff_ms() -> u64 {
    100
}
fn default_retry_max_backoff_ms() -> u64 {
    5_000
}
fn default_retry_multiplier() -> f64 {
    2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::FlakyStore;
    use crate::db::{Predicate, Value};
    use crate::workloads::SfmtaWorkload;
    use crate::CoreProperties;

    fn props(table: &str, extra: &[(&str, toml::Value)]) -> Table {
        let mut props = Table::new();
        props.insert("table".to_string(), toml::Value::from(table));
        props.insert("recordcount".to_string(), toml::Value::from(25));
        props.insert("batchsize".to_string(), toml::Value::from(10));
        props.insert("retrybackoffms".to_string(), toml::Value::from(0));
        for (k, v) in extra {
            props.insert(k.to_string(), v.clone());
        }
        props
    }

    fn client(props: &Table, abort: Arc<AtomicBool>) -> Client<FlakyStore, SfmtaWorkload> {
        let core_props: CoreProperties = props.clone().try_into().unwrap();
        let client_props = ClientProperties::parse(props.clone()).unwrap();
        let workload = SfmtaWorkload::new(&core_props, &client_props, props).unwrap();
        let mut db = FlakyStore::new(props).unwrap();
        db.create_table(workload.table(), workload.schema()).unwrap();
        let range = client_props.key_range().unwrap();
        Client::new(client_props, db, Arc::new(workload), range, abort).unwrap()
    }

    #[test]
    fn defaults() {
        let p = ClientProperties::parse(Table::new()).unwrap();
        assert_eq!(p.batch_size, 10_000);
        assert_eq!(p.insert_start, 0);
        assert!(matches!(p.key_range(), Err(JobError::InvalidRange { .. })));
        assert_eq!(p.retry_policy().unwrap().max_retries, 3);
    }

    #[test]
    fn rejects_shrinking_backoff() {
        let mut p = ClientProperties::parse(Table::new()).unwrap();
        p.retry_multiplier = 0.5;
        assert!(matches!(p.retry_policy(), Err(JobError::Config(_))));
    }

    #[test]
    fn inserts_all_records_in_batches() {
        let props = props("client_inserts_all", &[]);
        let mut c = client(&props, Arc::new(AtomicBool::new(false)));
        let stats = c.setup_initial_data().unwrap();
        assert_eq!(stats, LoadStats { rows: 25, flushes: 3 });
        assert_eq!(c.db.insert_batches, vec![10, 10, 5]);
        assert_eq!(c.progress().load(Ordering::Relaxed), 25);

        let rows = c
            .db
            .query("client_inserts_all", &Predicate::eq("speed", Value::Float32(4.0)))
            .unwrap();
        assert_eq!(rows.len(), 25);
    }

    #[test]
    fn transient_insert_failures_are_retried() {
        let props = props(
            "client_transient",
            &[("flakyinserttransient", toml::Value::from(2))],
        );
        let mut c = client(&props, Arc::new(AtomicBool::new(false)));
        let stats = c.setup_initial_data().unwrap();
        assert_eq!(stats.rows, 25);
    }

    #[test]
    fn failed_flush_is_fatal() {
        let props = props(
            "client_fatal",
            &[("flakyinsertfailat", toml::Value::from(2))],
        );
        let mut c = client(&props, Arc::new(AtomicBool::new(false)));
        let err = c.setup_initial_data().unwrap_err();
        assert!(matches!(
            err,
            JobError::BatchWrite {
                stage: Stage::Inserting,
                rows: 10,
                ..
            }
        ));
        assert_eq!(c.progress().load(Ordering::Relaxed), 10);
    }

    #[test]
    fn abort_flag_stops_before_next_flush() {
        let props = props("client_abort", &[]);
        let mut c = client(&props, Arc::new(AtomicBool::new(true)));
        assert!(matches!(
            c.setup_initial_data(),
            Err(JobError::Aborted {
                stage: Stage::Inserting
            })
        ));
        assert!(c.db.insert_batches.is_empty());
    }
}
