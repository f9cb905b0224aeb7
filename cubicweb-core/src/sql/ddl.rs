//! Schema to DDL translation.
//!
//! Every non-final entity type gets a `cw_<Type>` table holding its
//! attributes and inlined relations; every stored non-inlined relation type
//! gets a `<name>_relation` join table. Output is a list of standalone
//! statements, deterministic for a given schema and dialect.

use similar::TextDiff;

use crate::schema::{
    BoundValue, Constraint, Literal, Primitive, RelationDefinition, RelationType, Schema,
};

use super::Dialect;
use super::naming::{build_index_name, check_constraint_name, unique_index_name};

fn skipped(names: &[&str], name: &str) -> bool {
    names.contains(&name)
}

fn literal_sql(dialect: Dialect, value: &Literal) -> String {
    match value {
        Literal::Bool(b) => dialect.boolean_value(*b).to_string(),
        other => other.to_sql(),
    }
}

fn bound_sql(dialect: Dialect, value: &BoundValue, prefix: &str) -> String {
    match value {
        BoundValue::Literal(lit) => literal_sql(dialect, lit),
        BoundValue::Attribute(attr) => format!("{prefix}{attr}"),
        BoundValue::Now => dialect.current_timestamp().to_string(),
        BoundValue::Today => dialect.current_date().to_string(),
    }
}

/// SQL type of an attribute: `varchar(N)` for size-bounded strings, the
/// dialect mapping otherwise. Inlined relations are integers.
pub fn type_from_rdef(dialect: Dialect, rdef: &RelationDefinition) -> String {
    match rdef.primitive() {
        Some(Primitive::String) => match rdef.max_size() {
            Some(max) => format!("varchar({max})"),
            None => dialect.sql_type(Primitive::String).to_string(),
        },
        Some(p) => dialect.sql_type(p).to_string(),
        None => "integer".to_string(),
    }
}

/// Full column definition of an attribute. With `creating` unset, only the
/// bare type is returned, as needed to alter an existing column.
pub fn column_sql(dialect: Dialect, rdef: &RelationDefinition, creating: bool) -> String {
    let mut sql = type_from_rdef(dialect, rdef);
    if !creating {
        return sql;
    }
    if rdef.uid {
        sql.push_str(" PRIMARY KEY REFERENCES entities (eid)");
        return sql;
    }
    if rdef.cardinality.subject.is_mandatory() && dialect.alter_column_support() {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = default_sql(dialect, rdef) {
        sql.push_str(" DEFAULT ");
        sql.push_str(&default);
    }
    sql
}

/// SQL literal of an attribute default, for the types that support one.
pub fn default_sql(dialect: Dialect, rdef: &RelationDefinition) -> Option<String> {
    match (rdef.primitive()?, rdef.default.as_ref()?) {
        (Primitive::Boolean, Literal::Bool(b)) => Some(dialect.boolean_value(*b).to_string()),
        (Primitive::String, Literal::Text(_))
        | (
            Primitive::Int | Primitive::BigInt | Primitive::Float | Primitive::Decimal,
            Literal::Int(_) | Literal::Float(_),
        ) => rdef.default.as_ref().map(|d| literal_sql(dialect, d)),
        _ => None,
    }
}

/// CHECK constraint for `constraint`, as (name, expression). Constraint
/// kinds without an SQL counterpart yield `None`.
pub fn check_constraint(
    dialect: Dialect,
    rdef: &RelationDefinition,
    constraint: &Constraint,
    prefix: &str,
) -> Option<(String, String)> {
    let column = format!("{prefix}{}", rdef.rtype);
    let expression = match constraint {
        Constraint::Boundary { op, value } => {
            format!("{column} {} {}", op.as_str(), bound_sql(dialect, value, prefix))
        }
        Constraint::Interval { min, max } => {
            let mut parts = Vec::new();
            if let Some(min) = min {
                parts.push(format!("{column} >= {}", bound_sql(dialect, min, prefix)));
            }
            if let Some(max) = max {
                parts.push(format!("{column} <= {}", bound_sql(dialect, max, prefix)));
            }
            if parts.is_empty() {
                return None;
            }
            parts.join(" AND ")
        }
        Constraint::StaticVocabulary { values } => {
            let mut rendered: Vec<String> = values.iter().map(|v| literal_sql(dialect, v)).collect();
            rendered.sort();
            format!("{column} IN ({})", rendered.join(", "))
        }
        _ => return None,
    };
    let name = check_constraint_name(
        &rdef.subject,
        &rdef.rtype,
        constraint.kind_name(),
        &constraint.serialize(),
        dialect.max_identifier_len(),
    );
    Some((name, expression))
}

/// Column name and definition of every column of `etype`'s table:
/// attributes in order, then inlined relations by name.
pub fn eschema_sql_def(
    dialect: Dialect,
    schema: &Schema,
    etype: &str,
    skip_relations: &[&str],
    prefix: &str,
) -> Vec<(String, String)> {
    let mut defs: Vec<(String, String)> = schema
        .attributes(etype)
        .into_iter()
        .filter(|d| !skipped(skip_relations, &d.rtype))
        .map(|d| (format!("{prefix}{}", d.rtype), column_sql(dialect, d, true)))
        .collect();
    defs.extend(
        schema
            .inlined_relations(etype)
            .into_iter()
            .filter(|r| !skipped(skip_relations, &r.name))
            .map(|r| {
                (
                    format!("{prefix}{}", r.name),
                    "integer REFERENCES entities (eid)".to_string(),
                )
            }),
    );
    defs
}

/// `CREATE TABLE` statement of `etype`, named `table`.
pub fn entity_table_sql(
    dialect: Dialect,
    schema: &Schema,
    etype: &str,
    skip_relations: &[&str],
    prefix: &str,
    table: &str,
) -> String {
    let defs = eschema_sql_def(dialect, schema, etype, skip_relations, prefix);
    let mut lines = vec![format!("CREATE TABLE {table}(")];
    for (i, (column, sqltype)) in defs.iter().enumerate() {
        let sep = if i + 1 < defs.len() { "," } else { "" };
        lines.push(format!(" {column} {sqltype}{sep}"));
    }
    for rdef in schema.attributes(etype) {
        if skipped(skip_relations, &rdef.rtype) {
            continue;
        }
        for constraint in &rdef.constraints {
            if let Some((name, check)) = check_constraint(dialect, rdef, constraint, prefix) {
                lines.push(format!(", CONSTRAINT {name} CHECK({check})"));
            }
        }
    }
    lines.push(")".to_string());
    lines.join("\n")
}

/// Index statements of `etype`'s table: plain indexes for indexed
/// attributes and inlined relations, unique indexes for unique attributes
/// and for each unique-together group.
pub fn entity_index_sql(
    dialect: Dialect,
    schema: &Schema,
    etype: &str,
    skip_relations: &[&str],
    prefix: &str,
) -> Vec<String> {
    let table = format!("{prefix}{etype}");
    let mut stmts = Vec::new();
    for rdef in schema.attributes(etype) {
        if skipped(skip_relations, &rdef.rtype) {
            continue;
        }
        let column = format!("{prefix}{}", rdef.rtype);
        if rdef.indexed {
            stmts.push(dialect.create_index(&table, &column, false));
        }
        if rdef.is_unique() {
            stmts.push(dialect.create_index(&table, &column, true));
        }
    }
    for rtype in schema.inlined_relations(etype) {
        if !skipped(skip_relations, &rtype.name) {
            stmts.push(dialect.create_index(&table, &format!("{prefix}{}", rtype.name), false));
        }
    }
    if let Some(entity) = schema.entity(etype) {
        for attrs in &entity.unique_together {
            let columns: Vec<String> = attrs.iter().map(|a| format!("{prefix}{a}")).collect();
            let name = unique_index_name(etype, attrs, dialect.max_identifier_len());
            stmts.push(dialect.create_multicol_unique_index(&table, &columns, &name));
        }
    }
    stmts
}

/// Table and index statements of one entity type.
pub fn eschema_to_sql(
    dialect: Dialect,
    schema: &Schema,
    etype: &str,
    skip_relations: &[&str],
    prefix: &str,
) -> Vec<String> {
    let table = format!("{prefix}{etype}");
    let mut stmts = vec![entity_table_sql(dialect, schema, etype, skip_relations, prefix, &table)];
    stmts.extend(entity_index_sql(dialect, schema, etype, skip_relations, prefix));
    stmts
}

/// Name of the primary key index of a join table.
pub fn relation_pkey_name(dialect: Dialect, rtype: &str) -> String {
    build_index_name(
        &format!("{rtype}_relation"),
        &["eid_from", "eid_to"],
        "key_",
        dialect.max_identifier_len(),
    )
}

/// Join table of a relation type and its two lookup indexes.
pub fn rschema_to_sql(dialect: Dialect, rtype: &str) -> Vec<String> {
    let table = format!("{rtype}_relation");
    let pkey = relation_pkey_name(dialect, rtype);
    vec![
        format!(
            "CREATE TABLE {table} (\n  eid_from INTEGER NOT NULL REFERENCES entities (eid),\n  eid_to INTEGER NOT NULL REFERENCES entities (eid),\n  CONSTRAINT {pkey} PRIMARY KEY(eid_from, eid_to)\n)"
        ),
        dialect.create_index(&table, "eid_from", false),
        dialect.create_index(&table, "eid_to", false),
    ]
}

pub fn rschema_has_table(rtype: &RelationType, skip_relations: &[&str]) -> bool {
    rtype.has_table() && !skipped(skip_relations, &rtype.name)
}

/// DDL for the whole schema: entity tables by type name, then join tables
/// by relation name.
pub fn schema_to_sql(
    dialect: Dialect,
    schema: &Schema,
    skip_entities: &[&str],
    skip_relations: &[&str],
    prefix: &str,
) -> Vec<String> {
    let mut stmts = Vec::new();
    for etype in schema.user_entity_types() {
        if !skipped(skip_entities, &etype.name) {
            stmts.extend(eschema_to_sql(dialect, schema, &etype.name, skip_relations, prefix));
        }
    }
    for rtype in schema.relation_types() {
        if rschema_has_table(rtype, skip_relations) {
            stmts.extend(rschema_to_sql(dialect, &rtype.name));
        }
    }
    stmts
}

/// Ownership and privilege statements for every schema table.
pub fn grant_schema(
    schema: &Schema,
    user: &str,
    set_owner: bool,
    skip_entities: &[&str],
    prefix: &str,
) -> Vec<String> {
    let mut tables: Vec<String> = schema
        .user_entity_types()
        .filter(|e| !skipped(skip_entities, &e.name))
        .map(|e| format!("{prefix}{}", e.name))
        .collect();
    tables.extend(
        schema
            .relation_types()
            .filter(|r| rschema_has_table(r, &[]))
            .map(RelationType::table),
    );
    let mut stmts = Vec::new();
    for table in tables {
        if set_owner {
            stmts.push(format!("ALTER TABLE {table} OWNER to {user}"));
        }
        stmts.push(format!("GRANT ALL ON {table} TO {user}"));
    }
    stmts
}

/// Unified diff between the DDL of two schemas.
pub fn schema_diff(dialect: Dialect, from: &Schema, to: &Schema, labels: (&str, &str), prefix: &str) -> String {
    let render = |schema: &Schema| {
        let mut text = schema_to_sql(dialect, schema, &[], &[], prefix).join(";\n");
        text.push_str(";\n");
        text
    };
    let (old, new) = (render(from), render(to));
    TextDiff::from_lines(&old, &new)
        .unified_diff()
        .context_radius(3)
        .header(labels.0, labels.1)
        .to_string()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::schema::{BoundOp, EntityType, RelationType, SQL_PREFIX};

    fn person_schema() -> Schema {
        let mut schema = Schema::new();
        schema.add_entity_type(EntityType::new("Person")).unwrap();
        schema.add_entity_type(EntityType::new("Company")).unwrap();
        schema.add_relation_type(RelationType::new("name")).unwrap();
        schema
            .add_relation_definition(
                RelationDefinition::new("Person", "name", "String")
                    .with_cardinality("11".parse().unwrap())
                    .with_constraint(Constraint::Size {
                        min: None,
                        max: Some(64),
                    }),
            )
            .unwrap();
        schema.add_relation_type(RelationType::new("age")).unwrap();
        schema
            .add_relation_definition(
                RelationDefinition::new("Person", "age", "Int").with_constraint(
                    Constraint::Boundary {
                        op: BoundOp::Ge,
                        value: BoundValue::Literal(Literal::Int(0)),
                    },
                ),
            )
            .unwrap();
        let mut works_for = RelationType::new("works_for");
        works_for.inlined = true;
        schema.add_relation_type(works_for).unwrap();
        schema
            .add_relation_definition(
                RelationDefinition::new("Person", "works_for", "Company")
                    .with_cardinality("?*".parse().unwrap()),
            )
            .unwrap();
        schema.add_relation_type(RelationType::new("knows")).unwrap();
        schema
            .add_relation_definition(RelationDefinition::new("Person", "knows", "Person"))
            .unwrap();
        schema
    }

    #[test]
    fn person_table_on_postgres() {
        let stmts = eschema_to_sql(Dialect::Postgres, &person_schema(), "Person", &[], SQL_PREFIX);
        insta::assert_snapshot!(stmts.join(";\n"));
    }

    #[test]
    fn person_table_on_sqlite_has_no_not_null() {
        let stmts = eschema_to_sql(Dialect::Sqlite, &person_schema(), "Person", &[], SQL_PREFIX);
        assert!(stmts[0].contains(" cw_name varchar(64),"));
        assert!(!stmts[0].contains("NOT NULL"));
        assert!(stmts[0].contains(" cw_works_for integer REFERENCES entities (eid)\n"));
        assert!(stmts[0].contains("CHECK(cw_age >= 0)"));
        assert_eq!(stmts.len(), 2, "one index for the inlined relation");
    }

    #[test]
    fn join_tables_have_pkey_and_two_indexes() {
        let stmts = rschema_to_sql(Dialect::Sqlite, "knows");
        assert_eq!(stmts.len(), 3);
        assert!(stmts[0].starts_with("CREATE TABLE knows_relation ("));
        assert!(stmts[0].contains("PRIMARY KEY(eid_from, eid_to)"));
        assert!(stmts[1].ends_with("ON knows_relation(eid_from)"));
        assert!(stmts[2].ends_with("ON knows_relation(eid_to)"));
    }

    #[test]
    fn schema_sql_is_deterministic_and_skips_inlined() {
        let schema = person_schema();
        let a = schema_to_sql(Dialect::Sqlite, &schema, &[], &[], SQL_PREFIX);
        let b = schema_to_sql(Dialect::Sqlite, &schema.clone(), &[], &[], SQL_PREFIX);
        assert_eq!(a, b);
        assert!(a.iter().any(|s| s.starts_with("CREATE TABLE knows_relation")));
        assert!(!a.iter().any(|s| s.contains("works_for_relation")));
        assert!(!a.iter().any(|s| s.contains("name_relation")));
        assert!(a[0].starts_with("CREATE TABLE cw_Company("));
    }

    #[test]
    fn skipped_elements_are_left_out() {
        let schema = person_schema();
        let stmts = schema_to_sql(Dialect::Sqlite, &schema, &["Company"], &["age", "knows"], SQL_PREFIX);
        assert!(!stmts.iter().any(|s| s.contains("cw_Company")));
        assert!(!stmts.iter().any(|s| s.contains("cw_age")));
        assert!(!stmts.iter().any(|s| s.contains("knows_relation")));
    }

    #[test]
    fn vocabulary_check_is_sorted_and_quoted() {
        let rdef = RelationDefinition::new("Doc", "state", "String");
        let cstr = Constraint::StaticVocabulary {
            values: vec![
                Literal::Text("published".into()),
                Literal::Text("draft".into()),
                Literal::Text("can't".into()),
            ],
        };
        let (name, check) = check_constraint(Dialect::Sqlite, &rdef, &cstr, SQL_PREFIX).unwrap();
        assert!(name.starts_with("cstr"));
        assert_eq!(check, "cw_state IN ('can''t', 'draft', 'published')");
    }

    #[test]
    fn interval_and_dynamic_bounds() {
        let rdef = RelationDefinition::new("Event", "start", "Date");
        let cstr = Constraint::Interval {
            min: Some(BoundValue::Attribute("created".into())),
            max: Some(BoundValue::Today),
        };
        let (_, check) = check_constraint(Dialect::Postgres, &rdef, &cstr, SQL_PREFIX).unwrap();
        assert_eq!(check, "cw_start >= cw_created AND cw_start <= CURRENT_DATE");
        let (_, check) = check_constraint(
            Dialect::Sqlite,
            &rdef,
            &Constraint::Boundary {
                op: BoundOp::Lt,
                value: BoundValue::Now,
            },
            SQL_PREFIX,
        )
        .unwrap();
        assert_eq!(check, "cw_start < DATETIME('now')");
        assert!(check_constraint(Dialect::Sqlite, &rdef, &Constraint::Unique, SQL_PREFIX).is_none());
    }

    #[test]
    fn defaults_are_rendered_per_type() {
        let mut flag = RelationDefinition::new("T", "active", "Boolean");
        flag.default = Some(Literal::Bool(true));
        assert_eq!(column_sql(Dialect::Sqlite, &flag, true), "boolean DEFAULT 1");
        assert_eq!(column_sql(Dialect::Postgres, &flag, true), "boolean DEFAULT TRUE");
        let mut label = RelationDefinition::new("T", "label", "String");
        label.default = Some(Literal::Text("n/a".into()));
        assert_eq!(column_sql(Dialect::Sqlite, &label, true), "text DEFAULT 'n/a'");
        assert_eq!(column_sql(Dialect::Sqlite, &label, false), "text");
        let mut when = RelationDefinition::new("T", "when", "Date");
        when.default = Some(Literal::Text("2020-01-01".into()));
        assert_eq!(column_sql(Dialect::Sqlite, &when, true), "date");
    }

    #[test]
    fn unique_together_uses_entity_name_hash() {
        let mut schema = person_schema();
        schema.entity_mut("Person").unwrap().unique_together =
            vec![vec!["name".into(), "age".into()]];
        let stmts = eschema_to_sql(Dialect::Sqlite, &schema, "Person", &[], SQL_PREFIX);
        let expected = unique_index_name("Person", &["age".into(), "name".into()], 128);
        let last = stmts.last().unwrap();
        assert_eq!(last, &format!("CREATE UNIQUE INDEX {expected} ON cw_Person(cw_name, cw_age)"));
    }

    #[test]
    fn grants_cover_entity_and_join_tables() {
        let stmts = grant_schema(&person_schema(), "cubicweb", true, &[], SQL_PREFIX);
        assert!(stmts.contains(&"ALTER TABLE cw_Person OWNER to cubicweb".to_string()));
        assert!(stmts.contains(&"GRANT ALL ON knows_relation TO cubicweb".to_string()));
        let no_owner = grant_schema(&person_schema(), "cubicweb", false, &[], SQL_PREFIX);
        assert!(no_owner.iter().all(|s| s.starts_with("GRANT")));
    }

    #[test]
    fn diff_shows_added_columns() {
        let old = person_schema();
        let mut new = old.clone();
        new.add_relation_type(RelationType::new("email")).unwrap();
        new.add_relation_definition(RelationDefinition::new("Person", "email", "String"))
            .unwrap();
        let diff = schema_diff(Dialect::Sqlite, &old, &new, ("repository", "filesystem"), SQL_PREFIX);
        assert!(diff.contains("--- repository"));
        assert!(diff.contains("+ cw_email text"));
        assert!(schema_diff(Dialect::Sqlite, &old, &old, ("a", "b"), SQL_PREFIX).is_empty());
    }

    const ATTRIBUTE_TYPES: [&str; 5] = ["String", "Int", "Float", "Boolean", "Date"];

    #[derive(Debug, Clone)]
    struct Attr {
        kind: usize,
        maxsize: Option<u32>,
        vocabulary: Option<Vec<String>>,
    }

    type Relation = (usize, usize, bool);

    fn attr() -> impl Strategy<Value = Attr> {
        (
            0..ATTRIBUTE_TYPES.len(),
            proptest::option::of(1u32..300),
            proptest::option::of(proptest::collection::vec("[a-z']{1,6}", 1..4)),
        )
            .prop_map(|(kind, maxsize, vocabulary)| Attr {
                kind,
                maxsize,
                vocabulary,
            })
    }

    /// Build a schema, adding entity types in the given order. Definitions
    /// of one subject are always added in the same sequence.
    fn build(entities: &[(&String, &Vec<Attr>)], relations: &[Relation], names: &[String]) -> Schema {
        let mut schema = Schema::new();
        for (name, _) in entities {
            schema.add_entity_type(EntityType::new(format!("Z{name}"))).unwrap();
        }
        let width = entities.iter().map(|(_, attrs)| attrs.len()).max().unwrap_or(0);
        for index in 0..width {
            schema.add_relation_type(RelationType::new(format!("attr{index}"))).unwrap();
        }
        for (name, attrs) in entities {
            for (index, attr) in attrs.iter().enumerate() {
                let object = ATTRIBUTE_TYPES[attr.kind];
                let mut rdef = RelationDefinition::new(format!("Z{name}"), format!("attr{index}"), object);
                if object == "String" {
                    if let Some(max) = attr.maxsize {
                        rdef = rdef.with_constraint(Constraint::Size {
                            min: None,
                            max: Some(max),
                        });
                    }
                    if let Some(values) = &attr.vocabulary {
                        rdef = rdef.with_constraint(Constraint::StaticVocabulary {
                            values: values.iter().map(|v| Literal::Text(v.clone())).collect(),
                        });
                    }
                }
                schema.add_relation_definition(rdef).unwrap();
            }
        }
        for (index, &(subject, object, inlined)) in relations.iter().enumerate() {
            let mut rtype = RelationType::new(format!("rel{index}"));
            rtype.inlined = inlined;
            schema.add_relation_type(rtype).unwrap();
            let subject = format!("Z{}", names[subject % names.len()]);
            let object = format!("Z{}", names[object % names.len()]);
            let cardinality = if inlined { "?*" } else { "**" };
            schema
                .add_relation_definition(
                    RelationDefinition::new(subject, format!("rel{index}"), object)
                        .with_cardinality(cardinality.parse().unwrap()),
                )
                .unwrap();
        }
        schema
    }

    proptest! {
        #[test]
        fn schema_sql_does_not_depend_on_build_order(
            entities in proptest::collection::btree_map("[a-z]{3,8}", proptest::collection::vec(attr(), 0..5), 1..5),
            relations in proptest::collection::vec((0usize..8, 0usize..8, any::<bool>()), 0..4),
        ) {
            let names: Vec<String> = entities.keys().cloned().collect();
            let forward: Vec<_> = entities.iter().collect();
            let backward: Vec<_> = entities.iter().rev().collect();
            let first = build(&forward, &relations, &names);
            let again = build(&forward, &relations, &names);
            let reversed = build(&backward, &relations, &names);
            for dialect in [Dialect::Sqlite, Dialect::Postgres] {
                let sql = schema_to_sql(dialect, &first, &[], &[], SQL_PREFIX);
                prop_assert_eq!(&sql, &schema_to_sql(dialect, &again, &[], &[], SQL_PREFIX));
                prop_assert_eq!(&sql, &schema_to_sql(dialect, &reversed, &[], &[], SQL_PREFIX));
            }
        }
    }
}
