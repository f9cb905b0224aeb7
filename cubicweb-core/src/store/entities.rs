//! Entity and relation writes straight on the physical tables.
//!
//! These bypass any logical query layer: migration primitives and schema
//! serialization use them so no application-level hook is involved.

use std::collections::BTreeMap;

use chrono::Utc;
use cubicweb_deps::Version;
use tracing::{debug, warn};

use crate::error::{Result, SchemaError, StoreError};
use crate::schema::{SQL_PREFIX, Schema};

use super::{SqlValue, SystemSource};

/// Name of the source every locally created entity belongs to.
pub const SYSTEM_SOURCE: &str = "system";

/// Prefix of the properties recording installed cube versions.
pub const VERSION_PROPERTY_PREFIX: &str = "system.version.";

/// Current time as stored in `TZDatetime` columns.
pub fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Allocate the next entity identifier.
pub fn next_eid(source: &dyn SystemSource) -> Result<i64> {
    source.execute("UPDATE entities_id_seq SET last = last + 1", &[])?;
    source
        .query_i64("SELECT last FROM entities_id_seq", &[])?
        .ok_or_else(|| StoreError::UnknownEntity(0).into())
}

/// Type recorded in `entities` for `eid`.
pub fn entity_type(source: &dyn SystemSource, eid: i64) -> Result<Option<String>> {
    Ok(source
        .query_one("SELECT type FROM entities WHERE eid = ?", &[eid.into()])?
        .and_then(|row| row.into_iter().next())
        .and_then(|v| v.as_str().map(str::to_string)))
}

fn column_of(schema: &Schema, etype: &str, name: &str) -> Result<String> {
    let stored = schema.attribute(etype, name).is_some()
        || schema
            .inlined_relations(etype)
            .iter()
            .any(|r| r.name == name);
    if stored {
        Ok(format!("{SQL_PREFIX}{name}"))
    } else {
        Err(SchemaError::UnknownRelationDefinition {
            subject: etype.to_string(),
            rtype: name.to_string(),
            object: "?".to_string(),
        }
        .into())
    }
}

/// Column values of a new `etype` row: the given attribute (or inlined
/// relation) values plus identifier, dates and `cwuri`.
pub fn entity_row(
    schema: &Schema,
    etype: &str,
    eid: i64,
    values: &[(&str, SqlValue)],
) -> Result<BTreeMap<String, SqlValue>> {
    match schema.entity(etype) {
        Some(e) if !e.is_final => {}
        _ => return Err(SchemaError::UnknownEntityType(etype.to_string()).into()),
    }
    let mut row: BTreeMap<String, SqlValue> = BTreeMap::new();
    for (name, value) in values {
        row.insert(column_of(schema, etype, name)?, value.clone());
    }
    row.insert(format!("{SQL_PREFIX}eid"), eid.into());
    let stamp = now();
    for meta in ["creation_date", "modification_date"] {
        if schema.attribute(etype, meta).is_some() {
            row.entry(format!("{SQL_PREFIX}{meta}"))
                .or_insert_with(|| stamp.clone().into());
        }
    }
    if schema.attribute(etype, "cwuri").is_some() {
        row.entry(format!("{SQL_PREFIX}cwuri")).or_insert_with(|| "".into());
    }
    Ok(row)
}

/// `INSERT` statement and parameters of an entity row.
pub fn insert_row_sql(etype: &str, row: BTreeMap<String, SqlValue>) -> (String, Vec<SqlValue>) {
    let columns: Vec<&str> = row.keys().map(String::as_str).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {SQL_PREFIX}{etype} ({}) VALUES ({placeholders})",
        columns.join(", ")
    );
    (sql, row.into_values().collect())
}

pub fn register_entity(source: &dyn SystemSource, eid: i64, etype: &str) -> Result<()> {
    source.execute(
        "INSERT INTO entities (eid, type, asource, extid) VALUES (?, ?, ?, NULL)",
        &[eid.into(), etype.into(), SYSTEM_SOURCE.into()],
    )?;
    Ok(())
}

/// Insert an entity with the given attribute (or inlined relation) values.
/// Identifier, dates, `cwuri` and the `is`/`is_instance_of`/`cw_source`
/// relations are filled in.
pub fn create_entity(
    source: &dyn SystemSource,
    schema: &Schema,
    etype: &str,
    values: &[(&str, SqlValue)],
) -> Result<i64> {
    // validate before consuming an eid
    entity_row(schema, etype, 0, values)?;
    let eid = next_eid(source)?;
    let row = entity_row(schema, etype, eid, values)?;
    register_entity(source, eid, etype)?;
    let (sql, params) = insert_row_sql(etype, row);
    source.execute(&sql, &params)?;
    add_metadata_relations(source, Some(eid))?;
    debug!(eid, etype, "Entity created");
    Ok(eid)
}

/// Add the missing `is`, `is_instance_of` and `cw_source` rows of one
/// entity, or of every entity when `eid` is `None`. Rows whose target
/// (`CWEType` or `CWSource` entity) does not exist yet are left out.
pub fn add_metadata_relations(source: &dyn SystemSource, eid: Option<i64>) -> Result<usize> {
    let tables = source.table_names()?;
    let restrict = if eid.is_some() { " AND e.eid = ?" } else { "" };
    let params: Vec<SqlValue> = eid.into_iter().map(SqlValue::from).collect();
    let mut added = 0;
    for rtype in ["is", "is_instance_of"] {
        let table = format!("{rtype}_relation");
        if !tables.contains(&table) || !tables.contains("cw_CWEType") {
            continue;
        }
        let sql = format!(
            "INSERT INTO {table} (eid_from, eid_to) \
             SELECT e.eid, t.cw_eid FROM entities AS e, cw_CWEType AS t \
             WHERE t.cw_name = e.type{restrict} \
             AND NOT EXISTS (SELECT 1 FROM {table} AS r WHERE r.eid_from = e.eid AND r.eid_to = t.cw_eid)"
        );
        added += source.execute(&sql, &params)?;
    }
    if tables.contains("cw_source_relation") && tables.contains("cw_CWSource") {
        let sql = format!(
            "INSERT INTO cw_source_relation (eid_from, eid_to) \
             SELECT e.eid, s.cw_eid FROM entities AS e, cw_CWSource AS s \
             WHERE s.cw_name = e.asource{restrict} \
             AND NOT EXISTS (SELECT 1 FROM cw_source_relation AS r WHERE r.eid_from = e.eid)"
        );
        added += source.execute(&sql, &params)?;
    }
    Ok(added)
}

/// Update attribute values; `modification_date` is refreshed.
pub fn set_attributes(
    source: &dyn SystemSource,
    schema: &Schema,
    eid: i64,
    values: &[(&str, SqlValue)],
) -> Result<()> {
    let etype = entity_type(source, eid)?.ok_or(StoreError::UnknownEntity(eid))?;
    let mut assignments = Vec::new();
    let mut params = Vec::new();
    for (name, value) in values {
        assignments.push(format!("{} = ?", column_of(schema, &etype, name)?));
        params.push(value.clone());
    }
    if schema.attribute(&etype, "modification_date").is_some() {
        assignments.push(format!("{SQL_PREFIX}modification_date = ?"));
        params.push(now().into());
    }
    if assignments.is_empty() {
        return Ok(());
    }
    params.push(eid.into());
    let sql = format!(
        "UPDATE {SQL_PREFIX}{etype} SET {} WHERE {SQL_PREFIX}eid = ?",
        assignments.join(", ")
    );
    source.execute(&sql, &params)?;
    Ok(())
}

/// Delete an entity and everything pointing to it: join table rows,
/// inlined references and word index entries.
pub fn delete_entity(source: &dyn SystemSource, schema: &Schema, eid: i64) -> Result<()> {
    let etype = entity_type(source, eid)?.ok_or(StoreError::UnknownEntity(eid))?;
    let tables = source.table_names()?;
    for rtype in schema.relation_types() {
        if rtype.has_table() {
            let table = rtype.table();
            if tables.contains(&table) {
                source.execute(
                    &format!("DELETE FROM {table} WHERE eid_from = ? OR eid_to = ?"),
                    &[eid.into(), eid.into()],
                )?;
            }
        } else if rtype.inlined && !rtype.is_final {
            for subject in rtype.subjects() {
                let table = format!("{SQL_PREFIX}{subject}");
                if tables.contains(&table) {
                    source.execute(
                        &format!(
                            "UPDATE {table} SET {col} = NULL WHERE {col} = ?",
                            col = rtype.column()
                        ),
                        &[eid.into()],
                    )?;
                }
            }
        }
    }
    source.execute("DELETE FROM appears WHERE uid = ?", &[eid.into()])?;
    let table = format!("{SQL_PREFIX}{etype}");
    if tables.contains(&table) {
        source.execute(
            &format!("DELETE FROM {table} WHERE {SQL_PREFIX}eid = ?"),
            &[eid.into()],
        )?;
    }
    source.execute("DELETE FROM entities WHERE eid = ?", &[eid.into()])?;
    debug!(eid, etype, "Entity deleted");
    Ok(())
}

/// Link two entities. Adding an existing link is a no-op.
pub fn relate(
    source: &dyn SystemSource,
    schema: &Schema,
    subject: i64,
    rtype: &str,
    object: i64,
) -> Result<()> {
    let relation = schema
        .relation(rtype)
        .ok_or_else(|| SchemaError::UnknownRelationType(rtype.to_string()))?;
    if relation.inlined {
        let etype = entity_type(source, subject)?.ok_or(StoreError::UnknownEntity(subject))?;
        source.execute(
            &format!(
                "UPDATE {SQL_PREFIX}{etype} SET {} = ? WHERE {SQL_PREFIX}eid = ?",
                relation.column()
            ),
            &[object.into(), subject.into()],
        )?;
        return Ok(());
    }
    if !relation.has_table() {
        return Err(SchemaError::Invalid {
            element: rtype.to_string(),
            message: "relation is not stored".into(),
        }
        .into());
    }
    let table = relation.table();
    let sql = format!(
        "INSERT INTO {table} (eid_from, eid_to) SELECT ?, ? \
         WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE eid_from = ? AND eid_to = ?)"
    );
    source.execute(&sql, &[subject.into(), object.into(), subject.into(), object.into()])?;
    if relation.symmetric && subject != object {
        source.execute(&sql, &[object.into(), subject.into(), object.into(), subject.into()])?;
    }
    Ok(())
}

/// Remove a link; unknown links are ignored.
pub fn unrelate(
    source: &dyn SystemSource,
    schema: &Schema,
    subject: i64,
    rtype: &str,
    object: i64,
) -> Result<()> {
    let relation = schema
        .relation(rtype)
        .ok_or_else(|| SchemaError::UnknownRelationType(rtype.to_string()))?;
    if relation.inlined {
        let etype = entity_type(source, subject)?.ok_or(StoreError::UnknownEntity(subject))?;
        source.execute(
            &format!(
                "UPDATE {SQL_PREFIX}{etype} SET {col} = NULL WHERE {SQL_PREFIX}eid = ? AND {col} = ?",
                col = relation.column()
            ),
            &[subject.into(), object.into()],
        )?;
        return Ok(());
    }
    let sql = format!("DELETE FROM {} WHERE eid_from = ? AND eid_to = ?", relation.table());
    source.execute(&sql, &[subject.into(), object.into()])?;
    if relation.symmetric {
        source.execute(&sql, &[object.into(), subject.into()])?;
    }
    Ok(())
}

/// Identifier of the `etype` entity whose `attribute` equals `value`.
pub fn find_eid(
    source: &dyn SystemSource,
    etype: &str,
    attribute: &str,
    value: impl Into<SqlValue>,
) -> Result<Option<i64>> {
    source.query_i64(
        &format!("SELECT {SQL_PREFIX}eid FROM {SQL_PREFIX}{etype} WHERE {SQL_PREFIX}{attribute} = ?"),
        &[value.into()],
    )
}

/// Objects linked to `subject` through the join table of `rtype`.
pub fn related(source: &dyn SystemSource, subject: i64, rtype: &str) -> Result<Vec<i64>> {
    Ok(source
        .query_column(
            &format!("SELECT eid_to FROM {rtype}_relation WHERE eid_from = ? ORDER BY eid_to"),
            &[subject.into()],
        )?
        .iter()
        .filter_map(SqlValue::as_i64)
        .collect())
}

// ── Properties ────────────────────────────────────────────────────

pub fn get_property(source: &dyn SystemSource, key: &str) -> Result<Option<String>> {
    Ok(source
        .query_one(
            "SELECT cw_value FROM cw_CWProperty WHERE cw_pkey = ?",
            &[key.into()],
        )?
        .and_then(|row| row.into_iter().next())
        .and_then(|v| v.as_str().map(str::to_string)))
}

/// Create or update a `CWProperty`.
pub fn set_property(source: &dyn SystemSource, schema: &Schema, key: &str, value: &str) -> Result<()> {
    match find_eid(source, "CWProperty", "pkey", key)? {
        Some(eid) => set_attributes(source, schema, eid, &[("value", value.into())]),
        None => create_entity(
            source,
            schema,
            "CWProperty",
            &[("pkey", key.into()), ("value", value.into())],
        )
        .map(|_| ()),
    }
}

/// Installed version of every cube, from the `system.version.*` properties.
pub fn installed_versions(source: &dyn SystemSource) -> Result<BTreeMap<String, Version>> {
    let rows = source.query(
        "SELECT cw_pkey, cw_value FROM cw_CWProperty WHERE cw_pkey LIKE 'system.version.%'",
        &[],
    )?;
    let mut versions = BTreeMap::new();
    for row in rows {
        let (Some(key), Some(value)) = (
            row.first().and_then(SqlValue::as_str),
            row.get(1).and_then(SqlValue::as_str),
        ) else {
            continue;
        };
        let Some(cube) = key.strip_prefix(VERSION_PROPERTY_PREFIX) else {
            continue;
        };
        match value.parse::<Version>() {
            Ok(version) => {
                versions.insert(cube.to_string(), version);
            }
            Err(e) => warn!(cube, %e, "Ignoring unparsable installed version"),
        }
    }
    Ok(versions)
}

pub fn set_installed_version(
    source: &dyn SystemSource,
    schema: &Schema,
    cube: &str,
    version: Version,
) -> Result<()> {
    set_property(
        source,
        schema,
        &format!("{VERSION_PROPERTY_PREFIX}{cube}"),
        &version.to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::bootstrap::bootstrap_schema;
    use crate::store::{SqliteSource, init_repository};

    fn repo() -> (SqliteSource, Schema) {
        let schema = bootstrap_schema().unwrap();
        let source = SqliteSource::in_memory().unwrap();
        init_repository(&source, &schema).unwrap();
        (source, schema)
    }

    #[test]
    fn eids_are_sequential() {
        let (source, _) = repo();
        assert_eq!(next_eid(&source).unwrap(), 1);
        assert_eq!(next_eid(&source).unwrap(), 2);
    }

    #[test]
    fn created_entity_gets_metadata() {
        let (source, schema) = repo();
        let etype = create_entity(&source, &schema, "CWEType", &[("name", "CWGroup".into())]).unwrap();
        let group = create_entity(&source, &schema, "CWGroup", &[("name", "users".into())]).unwrap();
        assert_eq!(entity_type(&source, group).unwrap().as_deref(), Some("CWGroup"));
        assert_eq!(related(&source, group, "is").unwrap(), vec![etype]);
        assert_eq!(related(&source, group, "is_instance_of").unwrap(), vec![etype]);
        let created = source
            .query_one("SELECT cw_creation_date FROM cw_CWGroup WHERE cw_eid = ?", &[group.into()])
            .unwrap()
            .unwrap();
        assert!(!created[0].is_null());
    }

    #[test]
    fn unknown_attribute_is_refused() {
        let (source, schema) = repo();
        let err = create_entity(&source, &schema, "CWGroup", &[("nope", 1i64.into())]).unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert!(create_entity(&source, &schema, "String", &[]).is_err());
    }

    #[test]
    fn relate_is_idempotent_and_delete_cleans_links() {
        let (source, schema) = repo();
        let g = create_entity(&source, &schema, "CWGroup", &[("name", "managers".into())]).unwrap();
        let t = create_entity(&source, &schema, "CWEType", &[("name", "Note".into())]).unwrap();
        relate(&source, &schema, t, "read_permission", g).unwrap();
        relate(&source, &schema, t, "read_permission", g).unwrap();
        assert_eq!(related(&source, t, "read_permission").unwrap(), vec![g]);
        delete_entity(&source, &schema, g).unwrap();
        assert!(related(&source, t, "read_permission").unwrap().is_empty());
        assert_eq!(entity_type(&source, g).unwrap(), None);
        assert!(matches!(
            delete_entity(&source, &schema, g),
            Err(crate::error::CwError::Store(StoreError::UnknownEntity(_)))
        ));
    }

    #[test]
    fn inlined_relations_update_columns() {
        let (source, schema) = repo();
        let cstr = create_entity(
            &source,
            &schema,
            "CWUniqueTogetherConstraint",
            &[("name", "u".into()), ("attributes", "a,b".into())],
        )
        .unwrap();
        let t = create_entity(&source, &schema, "CWEType", &[("name", "Note".into())]).unwrap();
        relate(&source, &schema, cstr, "constraint_of", t).unwrap();
        let target = source
            .query_i64(
                "SELECT cw_constraint_of FROM cw_CWUniqueTogetherConstraint WHERE cw_eid = ?",
                &[cstr.into()],
            )
            .unwrap();
        assert_eq!(target, Some(t));
        delete_entity(&source, &schema, t).unwrap();
        let target = source
            .query_i64(
                "SELECT cw_constraint_of FROM cw_CWUniqueTogetherConstraint WHERE cw_eid = ?",
                &[cstr.into()],
            )
            .unwrap();
        assert_eq!(target, None);
    }

    #[test]
    fn versions_are_stored_as_properties() {
        let (source, schema) = repo();
        set_installed_version(&source, &schema, "blog", Version::new(1, 2, 0)).unwrap();
        set_installed_version(&source, &schema, "blog", Version::new(1, 3, 0)).unwrap();
        set_property(&source, &schema, "system.version.broken", "x.y").unwrap();
        let versions = installed_versions(&source).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions["blog"], Version::new(1, 3, 0));
        assert_eq!(
            get_property(&source, "system.version.blog").unwrap().as_deref(),
            Some("1.3.0")
        );
    }
}
