use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::db::{rows_bit_eq, Predicate, Row, Schema, DB};
use crate::error::JobError;
use crate::job::Stage;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::workloads::{KeyRange, Workload};

/// Rows echoed at debug level after each scan.
const SAMPLE_ROWS: usize = 20;

/// Materializes every row of `table` matching `predicate`.
pub fn predicate_scan<T: DB>(
    db: &mut T,
    table: &str,
    predicate: &Predicate,
    retry: &RetryPolicy,
    stage: Stage,
) -> Result<Vec<Row>, JobError> {
    let rows = retry_with_backoff(retry, "query", || db.query(table, predicate))
        .map_err(|source| JobError::Query { stage, source })?;
    debug!(%stage, table, %predicate, rows = rows.len(), "scan complete");
    for row in rows.iter().take(SAMPLE_ROWS) {
        debug!(%stage, ?row, "scanned row");
    }
    Ok(rows)
}

fn mismatch(msg: String) -> JobError {
    JobError::VerificationMismatch(msg)
}

fn keyed<'a>(schema: &Schema, rows: &'a [Row]) -> Result<HashMap<i64, &'a Row>, JobError> {
    let mut ret = HashMap::with_capacity(rows.len());
    for row in rows {
        let key = schema
            .key(row)
            .ok_or_else(|| mismatch(format!("row without primary key: {:?}", row)))?;
        if ret.insert(key, row).is_some() {
            return Err(mismatch(format!("key {} returned twice", key)));
        }
    }
    Ok(ret)
}

/// Fails unless the pre-update scan returned a row for every key of `range`.
pub fn check_coverage(schema: &Schema, rows: &[Row], range: KeyRange) -> Result<(), JobError> {
    let found: HashSet<i64> = rows.iter().filter_map(|row| schema.key(row)).collect();
    let mut missing = range.keys().filter(|key| !found.contains(key));
    if let Some(first) = missing.next() {
        return Err(mismatch(format!(
            "{} of {} inserted keys missing from the pre-update scan, first missing key {}",
            1 + missing.count(),
            range.total(),
            first
        )));
    }
    Ok(())
}

/// Re-scans on the target value and checks the result against the update.
///
/// `scanned` is the pre-update scan, `updated` the rows submitted for update.
/// The post-update scan must return exactly the updated keys, each row equal
/// to its updated row bit-for-bit, and none of those keys may still match the
/// seed value. Returns the number of verified rows.
pub fn verify<T: DB, U: Workload>(
    db: &mut T,
    workload: &U,
    retry: &RetryPolicy,
    scanned: &[Row],
    updated: &[Row],
) -> Result<usize, JobError> {
    let schema = workload.schema();
    let table = workload.table();
    let post = predicate_scan(
        db,
        table,
        &workload.target_predicate(),
        retry,
        Stage::ScanningPost,
    )?;

    if post.len() != scanned.len() {
        return Err(mismatch(format!(
            "post-update scan returned {} rows, pre-update scan returned {}",
            post.len(),
            scanned.len()
        )));
    }

    let expected = keyed(schema, updated)?;
    let actual = keyed(schema, &post)?;
    for (key, row) in &actual {
        match expected.get(key) {
            None => return Err(mismatch(format!("unexpected key {} after update", key))),
            Some(want) if !rows_bit_eq(want, row) => {
                return Err(mismatch(format!(
                    "key {} reads back as {:?}, expected {:?}",
                    key, row, want
                )));
            }
            Some(_) => {}
        }
    }
    if let Some(key) = expected.keys().find(|k| !actual.contains_key(*k)) {
        return Err(mismatch(format!("key {} lost its update", key)));
    }

    let residual = predicate_scan(
        db,
        table,
        &workload.seed_predicate(),
        retry,
        Stage::ScanningPost,
    )?;
    let stale: HashSet<i64> = residual
        .iter()
        .filter_map(|row| schema.key(row))
        .filter(|key| expected.contains_key(key))
        .collect();
    if !stale.is_empty() {
        return Err(mismatch(format!(
            "{} updated keys still match {}",
            stale.len(),
            workload.seed_predicate()
        )));
    }

    info!(rows = actual.len(), "verification passed");
    Ok(actual.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientProperties;
    use crate::db::testing::FlakyStore;
    use crate::db::Value;
    use crate::update;
    use crate::workloads::{records, SfmtaWorkload};
    use crate::CoreProperties;
    use toml::Table;

    fn setup(table: &str, extra: &[(&str, toml::Value)]) -> (FlakyStore, SfmtaWorkload) {
        let mut props = Table::new();
        props.insert("table".to_string(), toml::Value::from(table));
        for (k, v) in extra {
            props.insert(k.to_string(), v.clone());
        }
        let core_props: CoreProperties = props.clone().try_into().unwrap();
        let client_props = ClientProperties::parse(props.clone()).unwrap();
        let workload = SfmtaWorkload::new(&core_props, &client_props, &props).unwrap();
        let mut db = FlakyStore::new(&props).unwrap();
        db.create_table(table, workload.schema()).unwrap();
        let rows: Vec<Row> = records(&workload, KeyRange::new(0, 50).unwrap()).collect();
        db.bulk_insert(table, &rows).unwrap();
        (db, workload)
    }

    fn scan_and_update(db: &mut FlakyStore, w: &SfmtaWorkload) -> (Vec<Row>, Vec<Row>) {
        let retry = RetryPolicy::none();
        let scanned =
            predicate_scan(db, w.table(), &w.seed_predicate(), &retry, Stage::ScanningPre)
                .unwrap();
        let updated = update::transform_all(w, &scanned, 2).unwrap();
        update::bulk_update(db, w.table(), &updated, 20, &retry).unwrap();
        (scanned, updated)
    }

    #[test]
    fn verifies_a_complete_update() {
        let (mut db, w) = setup("scan_complete", &[]);
        let (scanned, updated) = scan_and_update(&mut db, &w);
        assert_eq!(scanned.len(), 50);
        let n = verify(&mut db, &w, &RetryPolicy::none(), &scanned, &updated).unwrap();
        assert_eq!(n, 50);
    }

    #[test]
    fn detects_lost_update() {
        let (mut db, w) = setup(
            "scan_lost_update",
            &[("flakydropupdates", toml::Value::from(true))],
        );
        let (scanned, updated) = scan_and_update(&mut db, &w);
        let err = verify(&mut db, &w, &RetryPolicy::none(), &scanned, &updated).unwrap_err();
        assert!(matches!(err, JobError::VerificationMismatch(_)));
    }

    #[test]
    fn detects_field_drift() {
        let (mut db, w) = setup("scan_drift", &[]);
        let (scanned, mut updated) = scan_and_update(&mut db, &w);
        updated[3][1] = Value::Int32(match updated[3][1] {
            Value::Int32(v) => v.wrapping_add(1),
            _ => 0,
        });
        let err = verify(&mut db, &w, &RetryPolicy::none(), &scanned, &updated).unwrap_err();
        assert!(matches!(err, JobError::VerificationMismatch(_)));
    }

    #[test]
    fn coverage_accepts_every_inserted_key() {
        let (mut db, w) = setup("scan_coverage", &[]);
        let (scanned, _) = scan_and_update(&mut db, &w);
        check_coverage(w.schema(), &scanned, KeyRange::new(0, 50).unwrap()).unwrap();
    }

    #[test]
    fn coverage_detects_lost_insert() {
        let (mut db, w) = setup(
            "scan_lost_insert",
            &[("flakydropinserts", toml::Value::from(true))],
        );
        let (scanned, _) = scan_and_update(&mut db, &w);
        assert_eq!(scanned.len(), 49);
        let range = KeyRange::new(0, 50).unwrap();
        match check_coverage(w.schema(), &scanned, range).unwrap_err() {
            JobError::VerificationMismatch(msg) => {
                assert!(msg.contains("1 of 50"), "{}", msg);
                assert!(msg.contains("first missing key 49"), "{}", msg);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn query_failure_is_reported_with_stage() {
        let mut db = FlakyStore::new(&Table::new()).unwrap();
        let err = predicate_scan(
            &mut db,
            "scan_missing_table",
            &Predicate::eq("speed", Value::Float32(4.0)),
            &RetryPolicy::none(),
            Stage::ScanningPre,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            JobError::Query {
                stage: Stage::ScanningPre,
                ..
            }
        ));
    }
}
