//! SQL generation: dialects, deterministic naming, schema DDL and the
//! index set the schema implies.

pub mod ddl;
pub mod dialect;
pub mod indexes;
pub mod naming;
pub mod system;

pub use ddl::{
    check_constraint, eschema_sql_def, eschema_to_sql, grant_schema, rschema_to_sql,
    schema_diff, schema_to_sql, type_from_rdef,
};
pub use dialect::Dialect;
pub use indexes::{IndexMap, expected_indexes};
pub use naming::build_index_name;
