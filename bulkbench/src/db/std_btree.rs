use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::Lazy;
use toml::Table;

use crate::db::{Predicate, Row, Schema, StoreError, DB};

struct StoredTable {
    schema: &'static Schema,
    rows: BTreeMap<i64, Row>,
}

type TableSet = HashMap<String, StoredTable>;

static MUTEX_INSTANCE: Lazy<Arc<Mutex<TableSet>>> =
    Lazy::new(|| Arc::new(Mutex::new(HashMap::new())));

static RWLOCK_INSTANCE: Lazy<Arc<RwLock<TableSet>>> =
    Lazy::new(|| Arc::new(RwLock::new(HashMap::new())));

/// In-process store behind a single mutex. Every handle sees the same
/// process-global tables.
pub struct StdBTreeMapMutex {
    db: Arc<Mutex<TableSet>>,
}

/// Same as [`StdBTreeMapMutex`], but queries only take a read lock.
pub struct StdBTreeMapRwLock {
    db: Arc<RwLock<TableSet>>,
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("store lock poisoned".to_string())
}

fn create_table(
    tables: &mut TableSet,
    name: &str,
    schema: &'static Schema,
) -> Result<(), StoreError> {
    match tables.get(name) {
        Some(existing) if existing.schema != schema => Err(StoreError::SchemaMismatch(format!(
            "table {} already exists with a different schema",
            name
        ))),
        Some(_) => Ok(()),
        None => {
            tables.insert(
                name.to_string(),
                StoredTable {
                    schema,
                    rows: BTreeMap::new(),
                },
            );
            Ok(())
        }
    }
}

fn table_mut<'a>(tables: &'a mut TableSet, name: &str) -> Result<&'a mut StoredTable, StoreError> {
    tables
        .get_mut(name)
        .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
}

// Validates the whole batch before touching the table, so a rejected batch
// leaves no trace.
fn batch_keys(table: &StoredTable, rows: &[Row]) -> Result<Vec<i64>, StoreError> {
    let mut keys = Vec::with_capacity(rows.len());
    for row in rows {
        table.schema.check(row)?;
        let key = table
            .schema
            .key(row)
            .ok_or_else(|| StoreError::SchemaMismatch("row without primary key".to_string()))?;
        keys.push(key);
    }
    Ok(keys)
}

fn insert_rows(tables: &mut TableSet, name: &str, rows: &[Row]) -> Result<(), StoreError> {
    let table = table_mut(tables, name)?;
    let keys = batch_keys(table, rows)?;
    let mut seen = HashSet::with_capacity(keys.len());
    for key in &keys {
        if table.rows.contains_key(key) || !seen.insert(*key) {
            return Err(StoreError::DuplicateKey(*key));
        }
    }
    for (key, row) in keys.into_iter().zip(rows) {
        table.rows.insert(key, row.clone());
    }
    Ok(())
}

fn update_rows(tables: &mut TableSet, name: &str, rows: &[Row]) -> Result<(), StoreError> {
    let table = table_mut(tables, name)?;
    let keys = batch_keys(table, rows)?;
    if let Some(key) = keys.iter().find(|k| !table.rows.contains_key(k)) {
        return Err(StoreError::MissingKey(*key));
    }
    for (key, row) in keys.into_iter().zip(rows) {
        table.rows.insert(key, row.clone());
    }
    Ok(())
}

fn query_rows(
    tables: &TableSet,
    name: &str,
    predicate: &Predicate,
) -> Result<Vec<Row>, StoreError> {
    let table = tables
        .get(name)
        .ok_or_else(|| StoreError::UnknownTable(name.to_string()))?;
    let idx = table
        .schema
        .index_of(&predicate.column)
        .ok_or_else(|| StoreError::UnknownColumn(predicate.column.clone()))?;
    Ok(table
        .rows
        .values()
        .filter(|row| row[idx] == predicate.value)
        .cloned()
        .collect())
}

impl DB for StdBTreeMapMutex {
    fn new(_: &Table) -> Result<Self, StoreError> {
        Ok(StdBTreeMapMutex {
            db: MUTEX_INSTANCE.clone(),
        })
    }

    fn create_table(&mut self, table: &str, schema: &'static Schema) -> Result<(), StoreError> {
        let mut x = self.db.lock().map_err(|_| poisoned())?;
        create_table(&mut x, table, schema)
    }

    fn bulk_insert(&mut self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        let mut x = self.db.lock().map_err(|_| poisoned())?;
        insert_rows(&mut x, table, rows)
    }

    fn query(&mut self, table: &str, predicate: &Predicate) -> Result<Vec<Row>, StoreError> {
        let x = self.db.lock().map_err(|_| poisoned())?;
        query_rows(&x, table, predicate)
    }

    fn bulk_update(&mut self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        let mut x = self.db.lock().map_err(|_| poisoned())?;
        update_rows(&mut x, table, rows)
    }
}

impl DB for StdBTreeMapRwLock {
    fn new(_: &Table) -> Result<Self, StoreError> {
        Ok(StdBTreeMapRwLock {
            db: RWLOCK_INSTANCE.clone(),
        })
    }

    fn create_table(&mut self, table: &str, schema: &'static Schema) -> Result<(), StoreError> {
        let mut x = self.db.write().map_err(|_| poisoned())?;
        create_table(&mut x, table, schema)
    }

    fn bulk_insert(&mut self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        let mut x = self.db.write().map_err(|_| poisoned())?;
        insert_rows(&mut x, table, rows)
    }

    fn query(&mut self, table: &str, predicate: &Predicate) -> Result<Vec<Row>, StoreError> {
        let x = self.db.read().map_err(|_| poisoned())?;
        query_rows(&x, table, predicate)
    }

    fn bulk_update(&mut self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        let mut x = self.db.write().map_err(|_| poisoned())?;
        update_rows(&mut x, table, rows)
    }
}
