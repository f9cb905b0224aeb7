// Indexes the schema expects to find in the database.

use std::collections::BTreeMap;

use crate::schema::Schema;

use super::Dialect;
use super::ddl::relation_pkey_name;
use super::naming::{build_index_name, unique_index_name};
use super::system::SYSTEM_INDICES;

/// Index name to (table, columns), primary-key-only indexes excluded.
pub type IndexMap = BTreeMap<String, (String, Vec<String>)>;

pub fn expected_indexes(dialect: Dialect, schema: &Schema, prefix: &str) -> IndexMap {
    let mut indexes = IndexMap::new();
    let mut add = |name: String, table: &str, columns: &[&str]| {
        indexes.insert(
            name,
            (
                table.to_string(),
                columns.iter().map(|c| (*c).to_string()).collect(),
            ),
        );
    };
    for (name, table, columns) in SYSTEM_INDICES {
        add(name.to_string(), table, columns);
    }
    for (name, table, columns) in dialect.fti_indexes() {
        add(name.to_string(), table, columns);
    }

    for rtype in schema.relation_types() {
        if rtype.rule.is_some() {
            continue;
        }
        if rtype.is_final || rtype.inlined {
            for rdef in rtype.rdefs.values() {
                let table = format!("{prefix}{}", rdef.subject);
                let column = format!("{prefix}{}", rdef.rtype);
                if rdef.is_unique() {
                    add(dialect.index_name(&table, &column, true), &table, &[&column]);
                }
                if rtype.inlined || rdef.indexed {
                    add(dialect.index_name(&table, &column, false), &table, &[&column]);
                }
            }
        } else {
            let table = rtype.table();
            let max = dialect.max_identifier_len();
            if dialect == Dialect::Postgres {
                add(relation_pkey_name(dialect, &rtype.name), &table, &["eid_from", "eid_to"]);
            }
            add(build_index_name(&table, &["eid_from"], "idx_", max), &table, &["eid_from"]);
            add(build_index_name(&table, &["eid_to"], "idx_", max), &table, &["eid_to"]);
        }
    }

    for etype in schema.user_entity_types() {
        let table = format!("{prefix}{}", etype.name);
        for attrs in &etype.unique_together {
            let columns: Vec<String> = attrs.iter().map(|a| format!("{prefix}{a}")).collect();
            let refs: Vec<&str> = columns.iter().map(String::as_str).collect();
            add(
                unique_index_name(&etype.name, attrs, dialect.max_identifier_len()),
                &table,
                &refs,
            );
        }
    }
    indexes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        Constraint, EntityType, RelationDefinition, RelationType, SQL_PREFIX,
    };
    use crate::sql::ddl::schema_to_sql;

    fn schema() -> Schema {
        let mut schema = Schema::new();
        schema.add_entity_type(EntityType::new("Tag")).unwrap();
        schema.add_relation_type(RelationType::new("label")).unwrap();
        schema
            .add_relation_definition(
                RelationDefinition::new("Tag", "label", "String").with_constraint(Constraint::Unique),
            )
            .unwrap();
        schema.add_relation_type(RelationType::new("tags")).unwrap();
        schema
            .add_relation_definition(RelationDefinition::new("Tag", "tags", "Tag"))
            .unwrap();
        schema
    }

    #[test]
    fn postgres_expects_join_table_keys() {
        let pg = expected_indexes(Dialect::Postgres, &schema(), SQL_PREFIX);
        let lite = expected_indexes(Dialect::Sqlite, &schema(), SQL_PREFIX);
        assert_eq!(pg.len(), lite.len() + 1);
        assert!(pg.contains_key(&relation_pkey_name(Dialect::Postgres, "tags")));
        assert!(lite.contains_key("appears_uid"));
        assert!(pg.contains_key("appears_words_idx"));
    }

    #[test]
    fn every_generated_index_is_expected() {
        let schema = schema();
        let expected = expected_indexes(Dialect::Sqlite, &schema, SQL_PREFIX);
        for stmt in schema_to_sql(Dialect::Sqlite, &schema, &[], &[], SQL_PREFIX) {
            if let Some(rest) = stmt
                .strip_prefix("CREATE UNIQUE INDEX ")
                .or_else(|| stmt.strip_prefix("CREATE INDEX "))
            {
                let name = rest.split_whitespace().next().unwrap();
                assert!(expected.contains_key(name), "{name} not expected");
            }
        }
    }
}
