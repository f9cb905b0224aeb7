use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::backup::Progress;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, DatabaseName, ToSql, params_from_iter};
use tracing::trace;

use crate::error::{Result, StoreError};
use crate::sql::Dialect;

use super::{Row, SqlValue, SystemSource};

/// SQLite-backed system source.
#[derive(Debug)]
pub struct SqliteSource {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteSource {
    /// Open (or create) a database file.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(StoreError::Sqlite)?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::Sqlite)?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn configure(conn: &Connection) -> Result<()> {
        // References to `entities` stay unenforced: dangling rows are what
        // the integrity checker repairs.
        conn.execute_batch(
            "PRAGMA foreign_keys = OFF;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -16000;",
        )
        .map_err(StoreError::Sqlite)?;
        // Ignored for in-memory databases.
        let _ = conn.execute_batch("PRAGMA journal_mode = WAL;");
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        Ok(self.conn.lock().map_err(|_| StoreError::Poisoned)?)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::from(rusqlite::types::Null),
            Self::Integer(i) => ToSqlOutput::from(*i),
            Self::Real(r) => ToSqlOutput::from(*r),
            Self::Text(s) => ToSqlOutput::from(s.as_str()),
            Self::Blob(b) => ToSqlOutput::from(b.as_slice()),
        })
    }
}

fn value_from(v: ValueRef<'_>) -> SqlValue {
    match v {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(r) => SqlValue::Real(r),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

fn collect_rows(stmt: &mut rusqlite::Statement<'_>, params: &[SqlValue]) -> rusqlite::Result<Vec<Row>> {
    let ncols = stmt.column_count();
    let rows = stmt.query_map(params_from_iter(params), |row| {
        (0..ncols)
            .map(|i| row.get_ref(i).map(value_from))
            .collect::<rusqlite::Result<Row>>()
    })?;
    rows.collect()
}

impl SystemSource for SqliteSource {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        trace!(sql, "execute");
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql).map_err(StoreError::Sqlite)?;
        Ok(stmt
            .execute(params_from_iter(params))
            .map_err(StoreError::Sqlite)?)
    }

    fn execute_batch(&self, sql: &str) -> Result<()> {
        trace!(sql, "execute batch");
        self.conn()?.execute_batch(sql).map_err(StoreError::Sqlite)?;
        Ok(())
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        trace!(sql, "query");
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql).map_err(StoreError::Sqlite)?;
        Ok(collect_rows(&mut stmt, params).map_err(StoreError::Sqlite)?)
    }

    fn run(&self, sql: &str) -> Result<Option<Vec<Row>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(StoreError::Sqlite)?;
        if stmt.column_count() == 0 {
            stmt.execute([]).map_err(StoreError::Sqlite)?;
            return Ok(None);
        }
        Ok(Some(collect_rows(&mut stmt, &[]).map_err(StoreError::Sqlite)?))
    }

    // ── Transactions ──────────────────────────────────────────────

    fn begin(&self) -> Result<()> {
        self.execute_batch("BEGIN IMMEDIATE")
    }

    fn commit(&self) -> Result<()> {
        self.execute_batch("COMMIT")
    }

    fn rollback(&self) -> Result<()> {
        let conn = self.conn()?;
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK").map_err(StoreError::Sqlite)?;
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.conn().is_ok_and(|c| !c.is_autocommit())
    }

    // ── Introspection ─────────────────────────────────────────────

    fn table_names(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .query_column(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                &[],
            )?
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let sql = format!("PRAGMA table_info(\"{}\")", table.replace('"', "\"\""));
        Ok(self
            .query(&sql, &[])?
            .into_iter()
            .filter_map(|row| row.get(1).and_then(SqlValue::as_str).map(str::to_string))
            .collect())
    }

    fn index_definitions(&self, table: &str) -> Result<Vec<(String, Option<String>)>> {
        Ok(self
            .query(
                "SELECT name, sql FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 ORDER BY name",
                &[SqlValue::from(table)],
            )?
            .into_iter()
            .filter_map(|row| {
                let name = row.first()?.as_str()?.to_string();
                let sql = row.get(1).and_then(SqlValue::as_str).map(str::to_string);
                Some((name, sql))
            })
            .collect())
    }

    // ── Native dumps ──────────────────────────────────────────────

    fn dump(&self, dest: &Path) -> Result<()> {
        self.conn()?
            .backup(DatabaseName::Main, dest, None)
            .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    fn load_dump(&self, src: &Path) -> Result<()> {
        self.conn()?
            .restore(DatabaseName::Main, src, None::<fn(Progress)>)
            .map_err(StoreError::Sqlite)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_roundtrip_through_sqlite() {
        let source = SqliteSource::in_memory().unwrap();
        source
            .execute("CREATE TABLE t (a INTEGER, b TEXT, c REAL, d BLOB)", &[])
            .unwrap();
        source
            .execute(
                "INSERT INTO t VALUES (?1, ?2, ?3, ?4)",
                &[
                    SqlValue::from(7i64),
                    SqlValue::from("x"),
                    SqlValue::from(1.5),
                    SqlValue::Blob(vec![1, 2]),
                ],
            )
            .unwrap();
        source
            .execute("INSERT INTO t VALUES (NULL, NULL, NULL, NULL)", &[])
            .unwrap();
        let rows = source.query("SELECT a, b, c, d FROM t ORDER BY a", &[]).unwrap();
        assert_eq!(rows[0], vec![SqlValue::Null; 4]);
        assert_eq!(
            rows[1],
            vec![
                SqlValue::Integer(7),
                SqlValue::Text("x".into()),
                SqlValue::Real(1.5),
                SqlValue::Blob(vec![1, 2])
            ]
        );
    }

    #[test]
    fn references_are_not_enforced() {
        let source = SqliteSource::in_memory().unwrap();
        assert_eq!(source.query_i64("PRAGMA foreign_keys", &[]).unwrap(), Some(0));
        source
            .execute_batch(
                "CREATE TABLE entities (eid INTEGER PRIMARY KEY);
                 CREATE TABLE knows_relation (eid_from INTEGER REFERENCES entities (eid));",
            )
            .unwrap();
        source
            .execute("INSERT INTO knows_relation (eid_from) VALUES (42)", &[])
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let on_disk = SqliteSource::open(&dir.path().join("db.sqlite")).unwrap();
        assert_eq!(on_disk.query_i64("PRAGMA foreign_keys", &[]).unwrap(), Some(0));
    }

    #[test]
    fn rollback_discards_changes() {
        let source = SqliteSource::in_memory().unwrap();
        source.execute("CREATE TABLE t (a INTEGER)", &[]).unwrap();
        source.begin().unwrap();
        assert!(source.in_transaction());
        source.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        source.rollback().unwrap();
        assert!(!source.in_transaction());
        assert_eq!(source.query_i64("SELECT COUNT(*) FROM t", &[]).unwrap(), Some(0));
        // no transaction open: rollback is a no-op
        source.rollback().unwrap();
    }

    #[test]
    fn run_distinguishes_queries_from_statements() {
        let source = SqliteSource::in_memory().unwrap();
        assert_eq!(source.run("CREATE TABLE t (a INTEGER)").unwrap(), None);
        let rows = source.run("SELECT COUNT(*) FROM t").unwrap().unwrap();
        assert_eq!(rows, vec![vec![SqlValue::Integer(0)]]);
    }

    #[test]
    fn introspection_hides_autoindexes() {
        let source = SqliteSource::in_memory().unwrap();
        source
            .execute_batch(
                "CREATE TABLE r (a INTEGER, b INTEGER, CONSTRAINT k PRIMARY KEY(a, b));
                 CREATE INDEX idx_r_a ON r(a);",
            )
            .unwrap();
        let defs = source.index_definitions("r").unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(
            source.index_names("r").unwrap().into_iter().collect::<Vec<_>>(),
            vec!["idx_r_a"]
        );
        assert_eq!(source.table_columns("r").unwrap(), vec!["a", "b"]);
        assert!(source.has_table("r").unwrap());
    }

    #[test]
    fn dump_and_load_replace_content() {
        let tmp = tempfile::tempdir().unwrap();
        let dump = tmp.path().join("dump.sqlite");
        let source = SqliteSource::in_memory().unwrap();
        source.execute("CREATE TABLE t (a INTEGER)", &[]).unwrap();
        source.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        source.dump(&dump).unwrap();
        source.execute("DELETE FROM t", &[]).unwrap();
        source.load_dump(&dump).unwrap();
        assert_eq!(source.query_i64("SELECT COUNT(*) FROM t", &[]).unwrap(), Some(1));
    }
}
