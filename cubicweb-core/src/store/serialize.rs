//! Persisted copy of the schema.
//!
//! The installed schema lives in the database as `CWEType`, `CWRType`,
//! `CWAttribute`, `CWRelation`, `CWConstraint` and
//! `CWUniqueTogetherConstraint` rows, with permissions as
//! `<action>_permission` links to `CWGroup` and `RQLExpression` entities.
//! [`serialize_schema`] writes it, [`deserialize_schema`] reads it back.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::error::{Result, SchemaError};
use crate::schema::bootstrap::{DEFAULT_GROUPS, bootstrap_schema};
use crate::schema::{
    Constraint, EntityType, ExpressionKind, Literal, PermissionAction, PermissionRule,
    Permissions, RelationDefinition, RelationType, Role, Schema,
};
use crate::sql::naming::unique_index_name;

use super::entities::{
    SYSTEM_SOURCE, add_metadata_relations, create_entity, delete_entity, find_eid,
};
use super::{Row, SqlValue, SystemSource};

// ── Lookups ───────────────────────────────────────────────────────

pub fn eschema_eid(source: &dyn SystemSource, name: &str) -> Result<Option<i64>> {
    find_eid(source, "CWEType", "name", name)
}

pub fn rschema_eid(source: &dyn SystemSource, name: &str) -> Result<Option<i64>> {
    find_eid(source, "CWRType", "name", name)
}

/// Persisted definition of `subject rtype object`, as (eid, mirror type).
pub fn rdef_eid(
    source: &dyn SystemSource,
    subject: &str,
    rtype: &str,
    object: &str,
) -> Result<Option<(i64, &'static str)>> {
    for mirror in ["CWAttribute", "CWRelation"] {
        let sql = format!(
            "SELECT d.cw_eid FROM cw_{mirror} AS d \
             JOIN cw_CWEType AS s ON d.cw_from_entity = s.cw_eid \
             JOIN cw_CWRType AS r ON d.cw_relation_type = r.cw_eid \
             JOIN cw_CWEType AS o ON d.cw_to_entity = o.cw_eid \
             WHERE s.cw_name = ? AND r.cw_name = ? AND o.cw_name = ?"
        );
        if let Some(eid) = source.query_i64(&sql, &[subject.into(), rtype.into(), object.into()])? {
            return Ok(Some((eid, mirror)));
        }
    }
    Ok(None)
}

fn flag(row: &Row, i: usize) -> bool {
    row.get(i).and_then(SqlValue::as_i64).is_some_and(|v| v != 0)
}

fn text(row: &Row, i: usize) -> Option<String> {
    row.get(i).and_then(SqlValue::as_str).map(str::to_string)
}

fn integer(row: &Row, i: usize) -> Option<i64> {
    row.get(i).and_then(SqlValue::as_i64)
}

// ── Permissions ───────────────────────────────────────────────────

/// Rules granted for `action` on the schema element `eid`.
pub fn permission_rules(
    source: &dyn SystemSource,
    eid: i64,
    action: PermissionAction,
) -> Result<BTreeSet<PermissionRule>> {
    let table = format!("{}_relation", action.relation_name());
    let mut rules = BTreeSet::new();
    let groups = source.query_column(
        &format!(
            "SELECT g.cw_name FROM {table} AS p JOIN cw_CWGroup AS g ON p.eid_to = g.cw_eid \
             WHERE p.eid_from = ?"
        ),
        &[eid.into()],
    )?;
    rules.extend(
        groups
            .iter()
            .filter_map(SqlValue::as_str)
            .map(PermissionRule::group),
    );
    let expressions = source.query(
        &format!(
            "SELECT x.cw_exprtype, x.cw_expression, x.cw_mainvars FROM {table} AS p \
             JOIN cw_RQLExpression AS x ON p.eid_to = x.cw_eid WHERE p.eid_from = ?"
        ),
        &[eid.into()],
    )?;
    for row in expressions {
        let kind = text(&row, 0)
            .as_deref()
            .and_then(ExpressionKind::from_name)
            .ok_or_else(|| SchemaError::Corrupted(format!("bad expression type on {eid}")))?;
        rules.insert(PermissionRule::Expression {
            kind,
            expression: text(&row, 1).unwrap_or_default(),
            mainvars: text(&row, 2).unwrap_or_default(),
        });
    }
    Ok(rules)
}

/// Grant `rule` for `action` on `eid`. Unknown groups are skipped with a
/// warning.
pub fn grant(
    source: &dyn SystemSource,
    schema: &Schema,
    eid: i64,
    action: PermissionAction,
    rule: &PermissionRule,
) -> Result<()> {
    let target = match rule {
        PermissionRule::Group(name) => match find_eid(source, "CWGroup", "name", name.as_str())? {
            Some(group) => group,
            None => {
                warn!(group = %name, "Unknown group, permission not granted");
                return Ok(());
            }
        },
        PermissionRule::Expression {
            kind,
            expression,
            mainvars,
        } => create_entity(
            source,
            schema,
            "RQLExpression",
            &[
                ("exprtype", kind.as_str().into()),
                ("expression", expression.as_str().into()),
                ("mainvars", mainvars.as_str().into()),
            ],
        )?,
    };
    super::entities::relate(source, schema, eid, &action.relation_name(), target)
}

/// Withdraw `rule` for `action` on `eid`; expressions are deleted.
pub fn revoke(
    source: &dyn SystemSource,
    schema: &Schema,
    eid: i64,
    action: PermissionAction,
    rule: &PermissionRule,
) -> Result<()> {
    let table = format!("{}_relation", action.relation_name());
    match rule {
        PermissionRule::Group(name) => {
            source.execute(
                &format!(
                    "DELETE FROM {table} WHERE eid_from = ? AND eid_to IN \
                     (SELECT cw_eid FROM cw_CWGroup WHERE cw_name = ?)"
                ),
                &[eid.into(), name.as_str().into()],
            )?;
        }
        PermissionRule::Expression {
            kind, expression, ..
        } => {
            let matching = source.query_column(
                &format!(
                    "SELECT x.cw_eid FROM {table} AS p JOIN cw_RQLExpression AS x \
                     ON p.eid_to = x.cw_eid WHERE p.eid_from = ? \
                     AND x.cw_exprtype = ? AND x.cw_expression = ?"
                ),
                &[eid.into(), kind.as_str().into(), expression.as_str().into()],
            )?;
            for x in matching.iter().filter_map(SqlValue::as_i64) {
                delete_entity(source, schema, x)?;
            }
        }
    }
    Ok(())
}

fn set_permissions(
    source: &dyn SystemSource,
    schema: &Schema,
    eid: i64,
    permissions: &Permissions,
    actions: &[PermissionAction],
) -> Result<()> {
    for action in actions {
        for rule in permissions.get(*action) {
            grant(source, schema, eid, *action, rule)?;
        }
    }
    Ok(())
}

fn read_permissions(
    source: &dyn SystemSource,
    eid: i64,
    actions: &[PermissionAction],
) -> Result<Permissions> {
    let mut permissions = Permissions::new();
    for action in actions {
        permissions.set(*action, permission_rules(source, eid, *action)?);
    }
    Ok(permissions)
}

/// Actions applicable to a relation definition.
pub fn rdef_actions(rdef: &RelationDefinition) -> &'static [PermissionAction] {
    if rdef.is_attribute() {
        &PermissionAction::ATTRIBUTE
    } else {
        &PermissionAction::RELATION
    }
}

// ── Writing ───────────────────────────────────────────────────────

/// Persist one entity type with its permissions and unique-together groups.
pub fn serialize_entity_type(source: &dyn SystemSource, schema: &Schema, etype: &EntityType) -> Result<i64> {
    let eid = create_entity(
        source,
        schema,
        "CWEType",
        &[
            ("name", etype.name.as_str().into()),
            ("description", etype.description.as_str().into()),
            ("final", etype.is_final.into()),
        ],
    )?;
    if !etype.is_final {
        set_permissions(source, schema, eid, &etype.permissions, &PermissionAction::ENTITY)?;
        for attrs in &etype.unique_together {
            serialize_unique_together(source, schema, eid, &etype.name, attrs)?;
        }
    }
    debug!(etype = %etype.name, eid, "Entity type persisted");
    Ok(eid)
}

pub fn serialize_unique_together(
    source: &dyn SystemSource,
    schema: &Schema,
    etype_eid: i64,
    etype: &str,
    attrs: &[String],
) -> Result<i64> {
    let name = unique_index_name(etype, attrs, source.dialect().max_identifier_len());
    create_entity(
        source,
        schema,
        "CWUniqueTogetherConstraint",
        &[
            ("name", name.into()),
            ("attributes", attrs.join(",").into()),
            ("constraint_of", etype_eid.into()),
        ],
    )
}

pub fn serialize_relation_type(source: &dyn SystemSource, schema: &Schema, rtype: &RelationType) -> Result<i64> {
    let eid = create_entity(
        source,
        schema,
        "CWRType",
        &[
            ("name", rtype.name.as_str().into()),
            ("description", rtype.description.as_str().into()),
            ("symmetric", rtype.symmetric.into()),
            ("inlined", rtype.inlined.into()),
            (
                "fulltext_container",
                rtype.fulltext_container.map(Role::as_str).into(),
            ),
            ("final", rtype.is_final.into()),
            ("rule", rtype.rule.clone().into()),
        ],
    )?;
    debug!(rtype = %rtype.name, eid, "Relation type persisted");
    Ok(eid)
}

pub fn serialize_constraint(
    source: &dyn SystemSource,
    schema: &Schema,
    rdef_eid: i64,
    constraint: &Constraint,
) -> Result<i64> {
    let eid = create_entity(
        source,
        schema,
        "CWConstraint",
        &[
            ("cstrtype", constraint.kind_name().into()),
            ("value", constraint.serialize().into()),
        ],
    )?;
    super::entities::relate(source, schema, rdef_eid, "constrained_by", eid)?;
    Ok(eid)
}

pub fn literal_json(value: &Literal) -> Result<String> {
    serde_json::to_string(value).map_err(|e| SchemaError::Corrupted(e.to_string()).into())
}

/// Persist one relation definition. Its subject, relation type and object
/// must already be persisted.
pub fn serialize_rdef(source: &dyn SystemSource, schema: &Schema, rdef: &RelationDefinition) -> Result<i64> {
    let missing = |name: &str| SchemaError::Corrupted(format!("{name} is not persisted"));
    let subject = eschema_eid(source, &rdef.subject)?.ok_or_else(|| missing(&rdef.subject))?;
    let object = eschema_eid(source, &rdef.object)?.ok_or_else(|| missing(&rdef.object))?;
    let rtype = rschema_eid(source, &rdef.rtype)?.ok_or_else(|| missing(&rdef.rtype))?;
    let mut values: Vec<(&str, SqlValue)> = vec![
        ("cardinality", rdef.cardinality.to_string().into()),
        ("ordernum", i64::from(rdef.order).into()),
        ("description", rdef.description.as_str().into()),
        ("from_entity", subject.into()),
        ("relation_type", rtype.into()),
        ("to_entity", object.into()),
    ];
    let mirror = if rdef.is_attribute() {
        values.extend([
            ("indexed", rdef.indexed.into()),
            ("fulltextindexed", rdef.fulltextindexed.into()),
            ("internationalizable", rdef.internationalizable.into()),
            (
                "defaultval",
                rdef.default.as_ref().map(literal_json).transpose()?.into(),
            ),
        ]);
        "CWAttribute"
    } else {
        "CWRelation"
    };
    let eid = create_entity(source, schema, mirror, &values)?;
    for constraint in &rdef.constraints {
        serialize_constraint(source, schema, eid, constraint)?;
    }
    set_permissions(source, schema, eid, &rdef.permissions, rdef_actions(rdef))?;
    Ok(eid)
}

/// Create the default groups and the system source when missing.
pub fn serialize_defaults(source: &dyn SystemSource, schema: &Schema) -> Result<()> {
    for group in DEFAULT_GROUPS {
        if find_eid(source, "CWGroup", "name", group)?.is_none() {
            create_entity(source, schema, "CWGroup", &[("name", group.into())])?;
        }
    }
    if find_eid(source, "CWSource", "name", SYSTEM_SOURCE)?.is_none() {
        create_entity(
            source,
            schema,
            "CWSource",
            &[("name", SYSTEM_SOURCE.into()), ("type", "native".into())],
        )?;
    }
    Ok(())
}

/// Persist the whole schema into a freshly initialized database.
pub fn serialize_schema(source: &dyn SystemSource, schema: &Schema) -> Result<()> {
    serialize_defaults(source, schema)?;
    for etype in schema.entity_types() {
        serialize_entity_type(source, schema, etype)?;
    }
    for rtype in schema.relation_types() {
        serialize_relation_type(source, schema, rtype)?;
    }
    for rdef in schema.rdefs() {
        serialize_rdef(source, schema, rdef)?;
    }
    let fixed = add_metadata_relations(source, None)?;
    info!(
        entity_types = schema.entity_types().count(),
        relation_types = schema.relation_types().count(),
        metadata = fixed,
        "Schema serialized"
    );
    Ok(())
}

// ── Reading ───────────────────────────────────────────────────────

fn read_constraints(source: &dyn SystemSource, rdef_eid: i64) -> Result<Vec<Constraint>> {
    let rows = source.query(
        "SELECT c.cw_cstrtype, c.cw_value FROM constrained_by_relation AS cb \
         JOIN cw_CWConstraint AS c ON cb.eid_to = c.cw_eid \
         WHERE cb.eid_from = ? ORDER BY c.cw_eid",
        &[rdef_eid.into()],
    )?;
    rows.iter()
        .map(|row| {
            let value = text(row, 1).unwrap_or_default();
            Constraint::deserialize(&value).ok_or_else(|| {
                SchemaError::Corrupted(format!(
                    "unreadable {} constraint {value:?}",
                    text(row, 0).unwrap_or_default()
                ))
                .into()
            })
        })
        .collect()
}

/// Rebuild the installed schema from its persisted rows.
pub fn deserialize_schema(source: &dyn SystemSource) -> Result<Schema> {
    let mut schema = Schema::new();

    let etypes = source.query(
        "SELECT cw_eid, cw_name, cw_description, cw_final FROM cw_CWEType ORDER BY cw_name",
        &[],
    )?;
    for row in &etypes {
        if flag(row, 3) {
            continue;
        }
        let (Some(eid), Some(name)) = (integer(row, 0), text(row, 1)) else {
            return Err(SchemaError::Corrupted("CWEType row without name".into()).into());
        };
        let mut etype = EntityType::new(name);
        etype.description = text(row, 2).unwrap_or_default();
        etype.permissions = read_permissions(source, eid, &PermissionAction::ENTITY)?;
        schema.add_entity_type(etype)?;
    }

    let unique = source.query(
        "SELECT e.cw_name, u.cw_attributes FROM cw_CWUniqueTogetherConstraint AS u \
         JOIN cw_CWEType AS e ON u.cw_constraint_of = e.cw_eid ORDER BY u.cw_eid",
        &[],
    )?;
    for row in &unique {
        let (Some(etype), Some(attrs)) = (text(row, 0), text(row, 1)) else {
            continue;
        };
        if let Some(entity) = schema.entity_mut(&etype) {
            entity
                .unique_together
                .push(attrs.split(',').map(str::to_string).collect());
        }
    }

    let rtypes = source.query(
        "SELECT cw_name, cw_description, cw_symmetric, cw_inlined, cw_fulltext_container, cw_rule \
         FROM cw_CWRType ORDER BY cw_name",
        &[],
    )?;
    for row in &rtypes {
        let Some(name) = text(row, 0) else {
            return Err(SchemaError::Corrupted("CWRType row without name".into()).into());
        };
        let mut rtype = RelationType::new(name);
        rtype.description = text(row, 1).unwrap_or_default();
        rtype.symmetric = flag(row, 2);
        rtype.inlined = flag(row, 3);
        rtype.fulltext_container = text(row, 4).as_deref().and_then(Role::from_name);
        rtype.rule = text(row, 5);
        schema.add_relation_type(rtype)?;
    }

    for mirror in ["CWAttribute", "CWRelation"] {
        let attribute = mirror == "CWAttribute";
        let extra = if attribute {
            ", d.cw_indexed, d.cw_fulltextindexed, d.cw_internationalizable, d.cw_defaultval"
        } else {
            ""
        };
        let sql = format!(
            "SELECT d.cw_eid, s.cw_name, r.cw_name, o.cw_name, d.cw_cardinality, \
             d.cw_ordernum, d.cw_description{extra} FROM cw_{mirror} AS d \
             JOIN cw_CWEType AS s ON d.cw_from_entity = s.cw_eid \
             JOIN cw_CWRType AS r ON d.cw_relation_type = r.cw_eid \
             JOIN cw_CWEType AS o ON d.cw_to_entity = o.cw_eid \
             ORDER BY d.cw_ordernum, d.cw_eid"
        );
        for row in source.query(&sql, &[])? {
            let (Some(eid), Some(subject), Some(rtype), Some(object), Some(card)) = (
                integer(&row, 0),
                text(&row, 1),
                text(&row, 2),
                text(&row, 3),
                text(&row, 4),
            ) else {
                return Err(SchemaError::Corrupted(format!("incomplete {mirror} row")).into());
            };
            let mut rdef = RelationDefinition::new(subject, rtype, object);
            rdef.cardinality = card.parse()?;
            rdef.order = integer(&row, 5)
                .and_then(|o| u32::try_from(o).ok())
                .unwrap_or(0);
            rdef.description = text(&row, 6).unwrap_or_default();
            rdef.uid = rdef.rtype == crate::schema::EID;
            if attribute {
                rdef.indexed = flag(&row, 7);
                rdef.fulltextindexed = flag(&row, 8);
                rdef.internationalizable = flag(&row, 9);
                rdef.default = match text(&row, 10) {
                    Some(json) => Some(
                        serde_json::from_str(&json)
                            .map_err(|e| SchemaError::Corrupted(format!("default {json:?}: {e}")))?,
                    ),
                    None => None,
                };
            }
            rdef.constraints = read_constraints(source, eid)?;
            rdef.permissions = read_permissions(source, eid, rdef_actions(&rdef))?;
            schema.add_relation_definition(rdef)?;
        }
    }
    schema.adopt_meta_templates(&bootstrap_schema()?);
    debug!(entity_types = schema.entity_types().count(), "Schema deserialized");
    Ok(schema)
}

// ── Removal ───────────────────────────────────────────────────────

/// Delete a persisted definition with its constraints and expressions.
pub fn delete_rdef(source: &dyn SystemSource, schema: &Schema, subject: &str, rtype: &str, object: &str) -> Result<bool> {
    let Some((eid, _)) = rdef_eid(source, subject, rtype, object)? else {
        return Ok(false);
    };
    delete_rdef_row(source, schema, eid)?;
    Ok(true)
}

fn delete_rdef_row(source: &dyn SystemSource, schema: &Schema, eid: i64) -> Result<()> {
    delete_element(source, schema, eid)?;
    let constraints = source.query_column(
        "SELECT eid_to FROM constrained_by_relation WHERE eid_from = ?",
        &[eid.into()],
    )?;
    for cstr in constraints.iter().filter_map(SqlValue::as_i64) {
        delete_entity(source, schema, cstr)?;
    }
    delete_entity(source, schema, eid)
}

/// Delete the expressions owned by a schema element.
fn delete_element(source: &dyn SystemSource, schema: &Schema, eid: i64) -> Result<()> {
    for action in PermissionAction::ENTITY {
        let table = format!("{}_relation", action.relation_name());
        let owned = source.query_column(
            &format!(
                "SELECT p.eid_to FROM {table} AS p JOIN cw_RQLExpression AS x \
                 ON p.eid_to = x.cw_eid WHERE p.eid_from = ?"
            ),
            &[eid.into()],
        )?;
        for x in owned.iter().filter_map(SqlValue::as_i64) {
            delete_entity(source, schema, x)?;
        }
    }
    Ok(())
}

/// Delete a persisted entity type, its definitions and unique-together groups.
pub fn delete_entity_type(source: &dyn SystemSource, schema: &Schema, name: &str) -> Result<bool> {
    let Some(eid) = eschema_eid(source, name)? else {
        return Ok(false);
    };
    for mirror in ["CWAttribute", "CWRelation"] {
        let rdefs = source.query_column(
            &format!(
                "SELECT cw_eid FROM cw_{mirror} WHERE cw_from_entity = ? OR cw_to_entity = ?"
            ),
            &[eid.into(), eid.into()],
        )?;
        for rdef in rdefs.iter().filter_map(SqlValue::as_i64) {
            delete_rdef_row(source, schema, rdef)?;
        }
    }
    let groups = source.query_column(
        "SELECT cw_eid FROM cw_CWUniqueTogetherConstraint WHERE cw_constraint_of = ?",
        &[eid.into()],
    )?;
    for group in groups.iter().filter_map(SqlValue::as_i64) {
        delete_entity(source, schema, group)?;
    }
    delete_element(source, schema, eid)?;
    delete_entity(source, schema, eid)?;
    Ok(true)
}

/// Delete a persisted relation type and all of its definitions.
pub fn delete_relation_type(source: &dyn SystemSource, schema: &Schema, name: &str) -> Result<bool> {
    let Some(eid) = rschema_eid(source, name)? else {
        return Ok(false);
    };
    for mirror in ["CWAttribute", "CWRelation"] {
        let rdefs = source.query_column(
            &format!("SELECT cw_eid FROM cw_{mirror} WHERE cw_relation_type = ?"),
            &[eid.into()],
        )?;
        for rdef in rdefs.iter().filter_map(SqlValue::as_i64) {
            delete_rdef_row(source, schema, rdef)?;
        }
    }
    delete_entity(source, schema, eid)?;
    Ok(true)
}
