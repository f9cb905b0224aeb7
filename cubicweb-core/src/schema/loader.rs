//! Cube schema files (`schema.toml`).
//!
//! ```toml
//! [entity.Person]
//! description = "a physical person"
//! unique_together = [["firstname", "lastname"]]
//!
//! [[entity.Person.attribute]]
//! name = "lastname"
//! type = "String"
//! required = true
//! maxsize = 64
//!
//! [relation.works_for]
//! subject = "Person"
//! object = ["Company", "Association"]
//! cardinality = "?*"
//! inlined = true
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::SchemaError;

use super::{
    BoundOp, BoundValue, Cardinality, Constraint, EntityType, ExpressionKind, Literal,
    PermissionAction, PermissionRule, Permissions, RelationDefinition, RelationType, Role, Schema,
};

/// Names of the elements a schema file declared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefinedNames {
    pub entities: Vec<String>,
    pub relations: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchemaFile {
    #[serde(default)]
    entity: BTreeMap<String, EntityDef>,
    #[serde(default)]
    relation: BTreeMap<String, RelationDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EntityDef {
    #[serde(default)]
    description: String,
    #[serde(default)]
    unique_together: Vec<Vec<String>>,
    permissions: Option<PermissionsDef>,
    #[serde(default)]
    attribute: Vec<AttributeDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AttributeDef {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    cardinality: Option<String>,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    indexed: bool,
    #[serde(default)]
    unique: bool,
    #[serde(default)]
    fulltextindexed: bool,
    #[serde(default)]
    internationalizable: bool,
    default: Option<toml::Value>,
    maxsize: Option<u32>,
    vocabulary: Option<Vec<toml::Value>>,
    #[serde(default)]
    constraints: Vec<ConstraintDef>,
    #[serde(default)]
    description: String,
    permissions: Option<PermissionsDef>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RelationDef {
    subject: Option<OneOrMany>,
    object: Option<OneOrMany>,
    cardinality: Option<String>,
    #[serde(default)]
    inlined: bool,
    #[serde(default)]
    symmetric: bool,
    fulltext_container: Option<String>,
    rule: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    constraints: Vec<ConstraintDef>,
    permissions: Option<PermissionsDef>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ConstraintDef {
    Size {
        min: Option<u32>,
        max: Option<u32>,
    },
    Unique,
    Boundary {
        op: String,
        value: toml::Value,
    },
    Interval {
        min: Option<toml::Value>,
        max: Option<toml::Value>,
    },
    Vocabulary {
        values: Vec<toml::Value>,
    },
    Format {
        regexp: String,
    },
    Rql {
        expression: String,
        mainvars: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PermissionsDef {
    read: Option<Vec<RuleDef>>,
    add: Option<Vec<RuleDef>>,
    update: Option<Vec<RuleDef>>,
    delete: Option<Vec<RuleDef>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuleDef {
    Group(String),
    Expression {
        expression: String,
        mainvars: Option<String>,
    },
}

// ── Conversion ────────────────────────────────────────────────────

fn invalid(element: &str, message: impl Into<String>) -> SchemaError {
    SchemaError::Invalid {
        element: element.to_string(),
        message: message.into(),
    }
}

fn literal(element: &str, value: toml::Value) -> Result<Literal, SchemaError> {
    match value {
        toml::Value::Boolean(b) => Ok(Literal::Bool(b)),
        toml::Value::Integer(i) => Ok(Literal::Int(i)),
        toml::Value::Float(f) => Ok(Literal::Float(f)),
        toml::Value::String(s) => Ok(Literal::Text(s)),
        toml::Value::Datetime(d) => Ok(Literal::Text(d.to_string())),
        other => Err(invalid(element, format!("unsupported literal {other}"))),
    }
}

/// `"NOW"`, `"TODAY"`, `{ attribute = "name" }` or a plain literal.
fn bound_value(element: &str, value: toml::Value) -> Result<BoundValue, SchemaError> {
    match value {
        toml::Value::String(s) if s == "NOW" => Ok(BoundValue::Now),
        toml::Value::String(s) if s == "TODAY" => Ok(BoundValue::Today),
        toml::Value::Table(table) => match table.get("attribute") {
            Some(toml::Value::String(attr)) if table.len() == 1 => {
                Ok(BoundValue::Attribute(attr.clone()))
            }
            _ => Err(invalid(element, "bound tables need a single `attribute` key")),
        },
        other => literal(element, other).map(BoundValue::Literal),
    }
}

fn constraint(element: &str, def: ConstraintDef) -> Result<Constraint, SchemaError> {
    Ok(match def {
        ConstraintDef::Size { min, max } => Constraint::Size { min, max },
        ConstraintDef::Unique => Constraint::Unique,
        ConstraintDef::Boundary { op, value } => Constraint::Boundary {
            op: BoundOp::from_name(&op)
                .ok_or_else(|| invalid(element, format!("unknown operator {op:?}")))?,
            value: bound_value(element, value)?,
        },
        ConstraintDef::Interval { min, max } => Constraint::Interval {
            min: min.map(|v| bound_value(element, v)).transpose()?,
            max: max.map(|v| bound_value(element, v)).transpose()?,
        },
        ConstraintDef::Vocabulary { values } => Constraint::StaticVocabulary {
            values: values
                .into_iter()
                .map(|v| literal(element, v))
                .collect::<Result<_, _>>()?,
        },
        ConstraintDef::Format { regexp } => Constraint::Format { regexp },
        ConstraintDef::Rql {
            expression,
            mainvars,
        } => Constraint::Rql {
            expression,
            mainvars,
        },
    })
}

fn permissions(def: PermissionsDef, base: Permissions, kind: ExpressionKind) -> Permissions {
    let mut perms = base;
    for (action, rules) in [
        (PermissionAction::Read, def.read),
        (PermissionAction::Add, def.add),
        (PermissionAction::Update, def.update),
        (PermissionAction::Delete, def.delete),
    ] {
        let Some(rules) = rules else { continue };
        perms.set(
            action,
            rules.into_iter().map(|r| match r {
                RuleDef::Group(g) => PermissionRule::Group(g),
                RuleDef::Expression {
                    expression,
                    mainvars,
                } => PermissionRule::Expression {
                    kind,
                    expression,
                    mainvars: mainvars.unwrap_or_else(|| "X".to_string()),
                },
            }),
        );
    }
    perms
}

fn ensure_rtype(schema: &mut Schema, name: &str) -> Result<(), SchemaError> {
    if !schema.has_relation(name) {
        schema.add_relation_type(RelationType::new(name))?;
    }
    Ok(())
}

fn attribute(schema: &mut Schema, etype: &str, def: AttributeDef) -> Result<(), SchemaError> {
    let element = format!("{etype}.{}", def.name);
    let cardinality: Cardinality = match def.cardinality {
        Some(c) => c.parse()?,
        None if def.required => "11".parse()?,
        None => "?1".parse()?,
    };
    let mut rdef = RelationDefinition::new(etype, def.name.as_str(), def.kind.as_str())
        .with_cardinality(cardinality);
    if !rdef.is_attribute() {
        return Err(invalid(&element, format!("{} is not a primitive type", def.kind)));
    }
    rdef.indexed = def.indexed;
    rdef.fulltextindexed = def.fulltextindexed;
    rdef.internationalizable = def.internationalizable;
    rdef.description = def.description;
    rdef.default = def.default.map(|v| literal(&element, v)).transpose()?;
    if def.unique {
        rdef.constraints.push(Constraint::Unique);
    }
    if let Some(max) = def.maxsize {
        rdef.constraints.push(Constraint::Size {
            min: None,
            max: Some(max),
        });
    }
    if let Some(values) = def.vocabulary {
        rdef.constraints.push(Constraint::StaticVocabulary {
            values: values
                .into_iter()
                .map(|v| literal(&element, v))
                .collect::<Result<_, _>>()?,
        });
    }
    for c in def.constraints {
        rdef.constraints.push(constraint(&element, c)?);
    }
    if let Some(p) = def.permissions {
        rdef.permissions = permissions(p, rdef.permissions, ExpressionKind::Entity);
    }
    ensure_rtype(schema, &def.name)?;
    schema.add_relation_definition(rdef)
}

fn relation(schema: &mut Schema, name: &str, def: RelationDef) -> Result<(), SchemaError> {
    let fulltext_container = match def.fulltext_container.as_deref() {
        None => None,
        Some(role) => Some(
            Role::from_name(role)
                .ok_or_else(|| invalid(name, format!("unknown role {role:?}")))?,
        ),
    };
    if let Some(existing) = schema.relation_mut(name) {
        existing.inlined |= def.inlined;
        existing.symmetric |= def.symmetric;
        existing.fulltext_container = existing.fulltext_container.or(fulltext_container);
    } else {
        let mut rtype = RelationType::new(name);
        rtype.inlined = def.inlined;
        rtype.symmetric = def.symmetric;
        rtype.fulltext_container = fulltext_container;
        rtype.rule.clone_from(&def.rule);
        rtype.description.clone_from(&def.description);
        schema.add_relation_type(rtype)?;
    }
    if def.rule.is_some() {
        return Ok(());
    }
    let (Some(subjects), Some(objects)) = (def.subject, def.object) else {
        return Err(invalid(name, "subject and object are required"));
    };
    let cardinality: Cardinality = def.cardinality.as_deref().unwrap_or("**").parse()?;
    if def.inlined && !cardinality.subject.is_single() {
        return Err(invalid(name, "inlined relations need a single subject cardinality"));
    }
    let mut constraints = Vec::new();
    for c in def.constraints {
        constraints.push(constraint(name, c)?);
    }
    let perms = def
        .permissions
        .map(|p| permissions(p, Permissions::default_relation(), ExpressionKind::Relation));
    let objects = objects.into_vec();
    for subject in subjects.into_vec() {
        for object in &objects {
            let mut rdef = RelationDefinition::new(subject.as_str(), name, object.as_str())
                .with_cardinality(cardinality);
            if rdef.is_attribute() {
                return Err(invalid(name, "use an entity attribute for primitive objects"));
            }
            rdef.constraints.clone_from(&constraints);
            rdef.description.clone_from(&def.description);
            if let Some(p) = &perms {
                rdef.permissions = p.clone();
            }
            schema.add_relation_definition(rdef)?;
        }
    }
    Ok(())
}

/// Parse schema definitions from TOML text into `schema`.
pub fn load_schema_str(schema: &mut Schema, text: &str, origin: &Path) -> Result<DefinedNames, SchemaError> {
    let mut names = load_schema_texts(schema, [(text, origin)])?;
    Ok(names.pop().unwrap_or_default())
}

/// Load several schema files as one unit, returning the names each one
/// declared. Every entity type is added before any attribute or relation,
/// so a file may reference types declared by a file loaded after it.
pub fn load_schema_texts<'a>(
    schema: &mut Schema,
    sources: impl IntoIterator<Item = (&'a str, &'a Path)>,
) -> Result<Vec<DefinedNames>, SchemaError> {
    let mut files = Vec::new();
    for (text, origin) in sources {
        let file: SchemaFile = toml::from_str(text).map_err(|e| SchemaError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;
        files.push(file);
    }

    let mut all_names = Vec::with_capacity(files.len());
    let mut pending = Vec::with_capacity(files.len());
    for file in files {
        let mut names = DefinedNames::default();
        let mut attributes = Vec::new();
        for (name, def) in file.entity {
            let mut etype = EntityType::new(name.as_str());
            etype.description = def.description;
            etype.unique_together = def.unique_together;
            if let Some(p) = def.permissions {
                etype.permissions = permissions(p, etype.permissions, ExpressionKind::Entity);
            }
            schema.add_entity_type(etype)?;
            names.entities.push(name.clone());
            attributes.push((name, def.attribute));
        }
        all_names.push(names);
        pending.push((attributes, file.relation));
    }

    for (names, (attributes, relations)) in all_names.iter_mut().zip(pending) {
        for (etype, defs) in attributes {
            for def in defs {
                if !names.relations.contains(&def.name) {
                    names.relations.push(def.name.clone());
                }
                attribute(schema, &etype, def)?;
            }
        }
        for (name, def) in relations {
            relation(schema, &name, def)?;
            if !names.relations.contains(&name) {
                names.relations.push(name);
            }
        }
    }

    for names in &all_names {
        for etype in &names.entities {
            check_unique_together(schema, etype)?;
        }
    }
    Ok(all_names)
}

fn check_unique_together(schema: &Schema, etype: &str) -> Result<(), SchemaError> {
    let Some(entity) = schema.entity(etype) else {
        return Ok(());
    };
    for group in &entity.unique_together {
        for attr in group {
            let known = schema.attribute(etype, attr).is_some()
                || schema
                    .inlined_relations(etype)
                    .iter()
                    .any(|r| r.name == *attr);
            if !known {
                return Err(invalid(etype, format!("unique_together names unknown {attr:?}")));
            }
        }
    }
    Ok(())
}
