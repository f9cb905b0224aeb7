//! Backend-specific SQL: type names, index statements, date functions and
//! the full-text index tables.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::schema::Primitive;

use super::naming::build_index_name;

/// Target database backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Sqlite,
    Postgres,
}

impl Dialect {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }

    /// Longest identifier the backend keeps without truncation.
    pub fn max_identifier_len(self) -> usize {
        match self {
            Self::Sqlite => 128,
            Self::Postgres => 63,
        }
    }

    /// Whether columns can be altered in place (type, NOT NULL). Without it,
    /// NOT NULL is never emitted so later cardinality changes need no rebuild.
    pub fn alter_column_support(self) -> bool {
        matches!(self, Self::Postgres)
    }

    pub fn sql_type(self, primitive: Primitive) -> &'static str {
        match (self, primitive) {
            (_, Primitive::String) => "text",
            (_, Primitive::Int) => "integer",
            (_, Primitive::BigInt) => "bigint",
            (_, Primitive::Float) => "float",
            (_, Primitive::Decimal) => "decimal",
            (_, Primitive::Boolean) => "boolean",
            (_, Primitive::Date) => "date",
            (_, Primitive::Time) => "time",
            (_, Primitive::Datetime) => "timestamp",
            (_, Primitive::Interval) => "interval",
            (_, Primitive::Bytes | Primitive::Password) => "bytea",
            (Self::Sqlite, Primitive::TZDatetime) => "tzdatetime",
            (Self::Sqlite, Primitive::TZTime) => "tztime",
            (Self::Postgres, Primitive::TZDatetime) => "timestamp with time zone",
            (Self::Postgres, Primitive::TZTime) => "time with time zone",
        }
    }

    pub fn boolean_value(self, value: bool) -> &'static str {
        match (self, value) {
            (Self::Sqlite, true) => "1",
            (Self::Sqlite, false) => "0",
            (Self::Postgres, true) => "TRUE",
            (Self::Postgres, false) => "FALSE",
        }
    }

    pub fn current_date(self) -> &'static str {
        match self {
            Self::Sqlite => "DATE('now')",
            Self::Postgres => "CURRENT_DATE",
        }
    }

    pub fn current_timestamp(self) -> &'static str {
        match self {
            Self::Sqlite => "DATETIME('now')",
            Self::Postgres => "CURRENT_TIMESTAMP",
        }
    }

    // ── Indexes ───────────────────────────────────────────────────

    /// Name of the single-column index created by [`Self::create_index`].
    pub fn index_name(self, table: &str, column: &str, unique: bool) -> String {
        let prefix = if unique { "key_" } else { "idx_" };
        build_index_name(table, &[column], prefix, self.max_identifier_len())
    }

    pub fn create_index(self, table: &str, column: &str, unique: bool) -> String {
        let name = self.index_name(table, column, unique);
        match (self, unique) {
            (Self::Postgres, true) => {
                format!("ALTER TABLE {table} ADD CONSTRAINT {name} UNIQUE({column})")
            }
            (Self::Sqlite, true) => format!("CREATE UNIQUE INDEX {name} ON {table}({column})"),
            (_, false) => format!("CREATE INDEX {name} ON {table}({column})"),
        }
    }

    pub fn drop_index(self, table: &str, column: &str, unique: bool) -> String {
        let name = self.index_name(table, column, unique);
        match (self, unique) {
            (Self::Postgres, true) => format!("ALTER TABLE {table} DROP CONSTRAINT {name}"),
            _ => format!("DROP INDEX {name}"),
        }
    }

    pub fn create_multicol_unique_index(self, table: &str, columns: &[String], name: &str) -> String {
        let columns = columns.join(", ");
        match self {
            Self::Postgres => format!("ALTER TABLE {table} ADD CONSTRAINT {name} UNIQUE({columns})"),
            Self::Sqlite => format!("CREATE UNIQUE INDEX {name} ON {table}({columns})"),
        }
    }

    pub fn drop_multicol_unique_index(self, table: &str, name: &str) -> String {
        match self {
            Self::Postgres => format!("ALTER TABLE {table} DROP CONSTRAINT {name}"),
            Self::Sqlite => format!("DROP INDEX {name}"),
        }
    }

    /// Whether an introspected index only backs a primary key. `sql` is the
    /// index definition when the backend exposes one.
    pub fn is_primary_key_index(self, name: &str, sql: Option<&str>) -> bool {
        match self {
            Self::Sqlite => sql.is_none() || name.starts_with("sqlite_autoindex_"),
            Self::Postgres => {
                name.ends_with("_pkey") || sql.is_some_and(|s| s.contains("PRIMARY KEY"))
            }
        }
    }

    // ── Column alteration ─────────────────────────────────────────

    pub fn add_column(self, table: &str, column: &str, definition: &str) -> String {
        format!("ALTER TABLE {table} ADD COLUMN {column} {definition}")
    }

    pub fn drop_column(self, table: &str, column: &str) -> String {
        format!("ALTER TABLE {table} DROP COLUMN {column}")
    }

    pub fn rename_table(self, old: &str, new: &str) -> String {
        format!("ALTER TABLE {old} RENAME TO {new}")
    }

    pub fn rename_column(self, table: &str, old: &str, new: &str) -> String {
        format!("ALTER TABLE {table} RENAME COLUMN {old} TO {new}")
    }

    /// In-place type and nullability change, when supported.
    pub fn change_column(self, table: &str, column: &str, sqltype: &str, not_null: bool) -> Option<Vec<String>> {
        if !self.alter_column_support() {
            return None;
        }
        let nullability = if not_null { "SET NOT NULL" } else { "DROP NOT NULL" };
        Some(vec![
            format!("ALTER TABLE {table} ALTER COLUMN {column} TYPE {sqltype}"),
            format!("ALTER TABLE {table} ALTER COLUMN {column} {nullability}"),
        ])
    }

    // ── Full-text index ───────────────────────────────────────────

    /// Statements creating the `appears` word index.
    pub fn fti_sql(self) -> Vec<String> {
        match self {
            Self::Sqlite => vec![
                "CREATE TABLE appears (\n  uid INTEGER NOT NULL REFERENCES entities (eid),\n  words TEXT NOT NULL\n)".into(),
                "CREATE INDEX appears_uid ON appears (uid)".into(),
            ],
            Self::Postgres => vec![
                "CREATE TABLE appears (\n  uid INTEGER PRIMARY KEY NOT NULL REFERENCES entities (eid) ON DELETE CASCADE,\n  words tsvector,\n  weight FLOAT DEFAULT 1.0\n)".into(),
                "CREATE INDEX appears_words_idx ON appears USING gin(words)".into(),
            ],
        }
    }

    /// Indexes created by [`Self::fti_sql`], as (name, table, columns).
    pub fn fti_indexes(self) -> Vec<(&'static str, &'static str, &'static [&'static str])> {
        match self {
            Self::Sqlite => vec![("appears_uid", "appears", &["uid"])],
            Self::Postgres => vec![("appears_words_idx", "appears", &["words"])],
        }
    }
}

impl FromStr for Dialect {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(ConfigError::Invalid(format!("unknown database driver {other:?}"))),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_maps_differ_on_time_zones() {
        assert_eq!(Dialect::Postgres.sql_type(Primitive::TZDatetime), "timestamp with time zone");
        assert_eq!(Dialect::Sqlite.sql_type(Primitive::TZDatetime), "tzdatetime");
        assert_eq!(Dialect::Sqlite.sql_type(Primitive::String), "text");
        assert_eq!(Dialect::Postgres.sql_type(Primitive::Bytes), "bytea");
    }

    #[test]
    fn unique_indexes_are_constraints_on_postgres() {
        let pg = Dialect::Postgres.create_index("cw_Person", "cw_name", true);
        assert!(pg.starts_with("ALTER TABLE cw_Person ADD CONSTRAINT key_"));
        assert!(pg.ends_with("UNIQUE(cw_name)"));
        let lite = Dialect::Sqlite.create_index("cw_Person", "cw_name", true);
        assert!(lite.starts_with("CREATE UNIQUE INDEX key_"));
        let plain = Dialect::Sqlite.create_index("cw_Person", "cw_name", false);
        assert!(plain.starts_with("CREATE INDEX idx_"));
    }

    #[test]
    fn postgres_names_fit_identifier_limit() {
        let name = Dialect::Postgres.index_name("cw_Person", "cw_name", false);
        assert!(name.len() <= 63);
    }

    #[test]
    fn primary_key_heuristics() {
        assert!(Dialect::Sqlite.is_primary_key_index("sqlite_autoindex_x_1", None));
        assert!(!Dialect::Sqlite.is_primary_key_index("idx_abc", Some("CREATE INDEX idx_abc ON t(c)")));
        assert!(Dialect::Postgres.is_primary_key_index("entities_pkey", Some("CREATE UNIQUE INDEX entities_pkey ON entities USING btree (eid)")));
        assert!(!Dialect::Postgres.is_primary_key_index("idx_abc", Some("CREATE INDEX idx_abc ON t USING btree (c)")));
    }

    #[test]
    fn parses_driver_names() {
        assert_eq!("PostgreSQL".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert!("mysql".parse::<Dialect>().is_err());
    }
}
