// Tables every repository has besides the schema tables.

use super::Dialect;

/// Indexes on system tables, as (name, table, columns).
pub const SYSTEM_INDICES: [(&str, &str, &[&str]); 2] = [
    ("entities_type_idx", "entities", &["type"]),
    ("entities_extid_idx", "entities", &["extid"]),
];

/// The `entities` registry, the eid counter and the word index.
pub fn system_tables_sql(dialect: Dialect) -> Vec<String> {
    let mut stmts = vec![
        "CREATE TABLE entities (\n  eid INTEGER PRIMARY KEY NOT NULL,\n  type VARCHAR(64) NOT NULL,\n  asource VARCHAR(128) NOT NULL,\n  extid VARCHAR(256)\n)".to_string(),
    ];
    for (name, table, columns) in SYSTEM_INDICES {
        stmts.push(format!("CREATE INDEX {name} ON {table}({})", columns.join(", ")));
    }
    stmts.push("CREATE TABLE entities_id_seq (\n  last INTEGER NOT NULL\n)".to_string());
    stmts.push("INSERT INTO entities_id_seq (last) VALUES (0)".to_string());
    stmts.extend(dialect.fti_sql());
    stmts
}

/// Tables created by [`system_tables_sql`].
pub const SYSTEM_TABLES: [&str; 3] = ["entities", "entities_id_seq", "appears"];
