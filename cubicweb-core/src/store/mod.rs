//! System source: the SQL database holding entity tables, join tables and
//! the system tables.
//!
//! Everything above this layer goes through [`SystemSource`], with `?`
//! placeholders in statements.

pub mod entities;
pub mod massive;
pub mod serialize;
pub mod sqlite;

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::{SQL_PREFIX, Schema};
use crate::sql::{Dialect, schema_to_sql, system::system_tables_sql};

pub use sqlite::SqliteSource;

/// A single SQL value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r}"),
            Self::Text(s) => f.write_str(s),
            Self::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

pub type Row = Vec<SqlValue>;

/// SQL access used by schema serialization, migrations and checks.
pub trait SystemSource: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Run one statement, returning the number of changed rows.
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    /// Run several `;`-separated statements without parameters.
    fn execute_batch(&self, sql: &str) -> Result<()>;

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Run one statement of unknown kind: rows when it yields columns.
    fn run(&self, sql: &str) -> Result<Option<Vec<Row>>>;

    fn begin(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
    fn in_transaction(&self) -> bool;

    fn table_names(&self) -> Result<BTreeSet<String>>;
    fn table_columns(&self, table: &str) -> Result<Vec<String>>;

    /// Every index on `table` as (name, definition when exposed).
    fn index_definitions(&self, table: &str) -> Result<Vec<(String, Option<String>)>>;

    /// Write a native copy of the whole database to `dest`.
    fn dump(&self, dest: &Path) -> Result<()>;

    /// Replace the whole database with a native copy.
    fn load_dump(&self, src: &Path) -> Result<()>;

    // ── Provided ──────────────────────────────────────────────────

    /// Index names on `table`, primary key indexes excluded.
    fn index_names(&self, table: &str) -> Result<BTreeSet<String>> {
        let dialect = self.dialect();
        Ok(self
            .index_definitions(table)?
            .into_iter()
            .filter(|(name, sql)| !dialect.is_primary_key_index(name, sql.as_deref()))
            .map(|(name, _)| name)
            .collect())
    }

    fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    fn query_i64(&self, sql: &str, params: &[SqlValue]) -> Result<Option<i64>> {
        Ok(self
            .query_one(sql, params)?
            .and_then(|row| row.into_iter().next())
            .and_then(|v| v.as_i64()))
    }

    /// First column of every row.
    fn query_column(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlValue>> {
        Ok(self
            .query(sql, params)?
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect())
    }

    fn has_table(&self, table: &str) -> Result<bool> {
        Ok(self.table_names()?.contains(table))
    }
}

/// Create system tables and the schema tables of a fresh database.
pub fn init_repository(source: &dyn SystemSource, schema: &Schema) -> Result<()> {
    let dialect = source.dialect();
    for stmt in system_tables_sql(dialect)
        .into_iter()
        .chain(schema_to_sql(dialect, schema, &[], &[], SQL_PREFIX))
    {
        source.execute(&stmt, &[])?;
    }
    tracing::info!(dialect = %dialect, "Repository tables created");
    Ok(())
}
