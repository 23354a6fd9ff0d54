use std::fmt;

use thiserror::Error;
use toml::Table;

mod std_btree;
pub use std_btree::{StdBTreeMapMutex, StdBTreeMapRwLock};

#[cfg(test)]
pub mod testing;

/// A single cell as it travels between the harness and the store.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Int64(i64),
    Int32(i32),
    Float32(f32),
    Null,
}

impl Value {
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Int64(_) => Some(ColumnType::Int64),
            Value::Int32(_) => Some(ColumnType::Int32),
            Value::Float32(_) => Some(ColumnType::Float32),
            Value::Null => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Equality on the stored representation. Floats compare by bit pattern,
    /// so `-0.0` differs from `0.0`.
    pub fn bit_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float32(a), Value::Float32(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int64(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Null => write!(f, "NULL"),
        }
    }
}

/// Fixed-width tuple laid out in schema column order.
pub type Row = Vec<Value>;

pub fn rows_bit_eq(a: &Row, b: &Row) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.bit_eq(y))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Int64,
    Int32,
    Float32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
}

/// Table layout. Column 0 is always the non-null `Int64` primary key.
#[derive(Debug, PartialEq, Eq)]
pub struct Schema {
    columns: &'static [Column],
}

impl Schema {
    pub const fn new(columns: &'static [Column]) -> Self {
        Schema { columns }
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn key(&self, row: &Row) -> Option<i64> {
        row.first().and_then(Value::as_i64)
    }

    pub fn check(&self, row: &Row) -> Result<(), StoreError> {
        if row.len() != self.columns.len() {
            return Err(StoreError::SchemaMismatch(format!(
                "row has {} columns, expected {}",
                row.len(),
                self.columns.len()
            )));
        }
        for (column, value) in self.columns.iter().zip(row) {
            match value.column_type() {
                Some(ty) if ty == column.ty => {}
                None if column.nullable => {}
                _ => {
                    return Err(StoreError::SchemaMismatch(format!(
                        "column {} ({:?}{}) cannot hold {:?}",
                        column.name,
                        column.ty,
                        if column.nullable { ", nullable" } else { "" },
                        value
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Equality predicate `column = value`.
#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub value: Value,
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Predicate {
            column: column.into(),
            value,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.column, self.value)
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("table '{0}' does not exist")]
    UnknownTable(String),

    #[error("column '{0}' does not exist")]
    UnknownColumn(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("primary key {0} already exists")]
    DuplicateKey(i64),

    #[error("primary key {0} does not exist")]
    MissingKey(i64),
}

impl StoreError {
    /// Transient failures worth another attempt; everything else would fail
    /// the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Client-side view of the tabular store. One value is one connection; a
/// handle is never shared between threads.
pub trait DB: 'static + Send + Sized {
    fn new(props: &Table) -> Result<Self, StoreError>;

    /// Creates `table` if absent. An existing table must have the same schema.
    fn create_table(&mut self, table: &str, schema: &'static Schema) -> Result<(), StoreError>;

    /// All-or-nothing: either every row is inserted or none is.
    fn bulk_insert(&mut self, table: &str, rows: &[Row]) -> Result<(), StoreError>;

    fn query(&mut self, table: &str, predicate: &Predicate) -> Result<Vec<Row>, StoreError>;

    /// Overwrites non-key columns of existing rows located by primary key.
    /// All-or-nothing, like `bulk_insert`.
    fn bulk_update(&mut self, table: &str, rows: &[Row]) -> Result<(), StoreError>;
}
