//! Built-in part of every schema: the entity types mirroring the schema
//! itself (`CWEType`, `CWRType`, ...), groups, sources, properties and the
//! meta relations every entity type carries.

use crate::error::SchemaError;

use super::{
    Cardinality, Constraint, EntityType, Literal, RelationDefinition, RelationType, Role, Schema,
};

/// Default user groups, created with every instance.
pub const DEFAULT_GROUPS: [&str; 4] = ["managers", "users", "guests", "owners"];

/// Entity types describing the schema and the instance itself.
pub const SYSTEM_TYPES: [&str; 10] = [
    "CWEType",
    "CWRType",
    "CWAttribute",
    "CWRelation",
    "CWConstraint",
    "CWUniqueTogetherConstraint",
    "CWGroup",
    "RQLExpression",
    "CWSource",
    "CWProperty",
];

/// Relations every entity has, skipped by the mandatory relation check.
pub const TYPE_RELATIONS: [&str; 2] = ["is", "is_instance_of"];

struct Builder {
    schema: Schema,
}

impl Builder {
    fn entity(&mut self, name: &str, description: &str) -> Result<(), SchemaError> {
        let mut etype = EntityType::new(name);
        etype.description = description.to_string();
        self.schema.add_entity_type(etype)
    }

    fn ensure_rtype(&mut self, name: &str) -> Result<(), SchemaError> {
        if !self.schema.has_relation(name) {
            self.schema.add_relation_type(RelationType::new(name))?;
        }
        Ok(())
    }

    fn attribute(
        &mut self,
        etype: &str,
        name: &str,
        ptype: &str,
        cardinality: &str,
    ) -> Result<&mut RelationDefinition, SchemaError> {
        self.ensure_rtype(name)?;
        let rdef =
            RelationDefinition::new(etype, name, ptype).with_cardinality(cardinality.parse()?);
        self.schema.add_relation_definition(rdef)?;
        self.schema
            .rdef_mut(etype, name, ptype)
            .ok_or_else(|| SchemaError::UnknownRelationType(name.to_string()))
    }

    fn name(&mut self, etype: &str) -> Result<(), SchemaError> {
        let rdef = self.attribute(etype, "name", "String", "11")?;
        rdef.constraints = vec![Constraint::Unique, size(64)];
        Ok(())
    }

    fn flag(&mut self, etype: &str, name: &str) -> Result<(), SchemaError> {
        self.attribute(etype, name, "Boolean", "11")?.default = Some(Literal::Bool(false));
        Ok(())
    }

    fn relation(
        &mut self,
        name: &str,
        subjects: &[&str],
        objects: &[&str],
        cardinality: &str,
        inlined: bool,
    ) -> Result<(), SchemaError> {
        self.ensure_rtype(name)?;
        if let Some(rtype) = self.schema.relation_mut(name) {
            rtype.inlined = inlined;
        }
        let cardinality: Cardinality = cardinality.parse()?;
        for subject in subjects {
            for object in objects {
                self.schema.add_relation_definition(
                    RelationDefinition::new(*subject, name, *object).with_cardinality(cardinality),
                )?;
            }
        }
        Ok(())
    }

    fn meta(&mut self, name: &str, object: &str, cardinality: &str) -> Result<(), SchemaError> {
        let template = RelationDefinition::new("*", name, object).with_cardinality(cardinality.parse()?);
        self.schema.add_meta_relation(RelationType::new(name), template)
    }
}

fn size(max: u32) -> Constraint {
    Constraint::Size {
        min: None,
        max: Some(max),
    }
}

fn vocabulary(values: &[&str]) -> Constraint {
    Constraint::StaticVocabulary {
        values: values.iter().map(|v| Literal::Text((*v).to_string())).collect(),
    }
}

/// Build the schema every instance starts from.
pub fn bootstrap_schema() -> Result<Schema, SchemaError> {
    let mut b = Builder {
        schema: Schema::new(),
    };

    b.entity("CWEType", "define an entity type")?;
    b.entity("CWRType", "define a relation type")?;
    b.entity("CWAttribute", "define a final relation")?;
    b.entity("CWRelation", "define a non final relation")?;
    b.entity("CWConstraint", "define a schema constraint")?;
    b.entity(
        "CWUniqueTogetherConstraint",
        "define a set of attributes whose values must be unique together",
    )?;
    b.entity("CWGroup", "define a user group")?;
    b.entity("RQLExpression", "define a permission expression")?;
    b.entity("CWSource", "define a data source")?;
    b.entity("CWProperty", "store an instance property")?;

    b.name("CWEType")?;
    b.attribute("CWEType", "description", "String", "?1")?;
    b.flag("CWEType", "final")?;

    b.name("CWRType")?;
    b.attribute("CWRType", "description", "String", "?1")?;
    b.flag("CWRType", "symmetric")?;
    b.flag("CWRType", "inlined")?;
    b.attribute("CWRType", "fulltext_container", "String", "?1")?.constraints = vec![vocabulary(&[
        Role::Subject.as_str(),
        Role::Object.as_str(),
    ])];
    b.flag("CWRType", "final")?;
    b.attribute("CWRType", "rule", "String", "?1")?;

    for etype in ["CWAttribute", "CWRelation"] {
        b.attribute(etype, "cardinality", "String", "11")?.constraints = vec![size(2)];
        b.attribute(etype, "ordernum", "Int", "11")?.default = Some(Literal::Int(0));
        b.attribute(etype, "description", "String", "?1")?;
    }
    b.flag("CWAttribute", "indexed")?;
    b.flag("CWAttribute", "fulltextindexed")?;
    b.flag("CWAttribute", "internationalizable")?;
    b.attribute("CWAttribute", "defaultval", "String", "?1")?;

    b.attribute("CWConstraint", "cstrtype", "String", "11")?;
    b.attribute("CWConstraint", "value", "String", "?1")?;

    b.attribute("CWUniqueTogetherConstraint", "name", "String", "11")?;
    b.attribute("CWUniqueTogetherConstraint", "attributes", "String", "11")?;

    b.name("CWGroup")?;

    b.attribute("RQLExpression", "exprtype", "String", "11")?.constraints =
        vec![vocabulary(&["ERQLExpression", "RRQLExpression"])];
    b.attribute("RQLExpression", "mainvars", "String", "?1")?;
    b.attribute("RQLExpression", "expression", "String", "11")?;

    b.name("CWSource")?;
    b.attribute("CWSource", "type", "String", "11")?;

    b.attribute("CWProperty", "pkey", "String", "11")?.constraints = vec![Constraint::Unique];
    b.attribute("CWProperty", "value", "String", "?1")?;

    let rdef_types = ["CWAttribute", "CWRelation"];
    b.relation("relation_type", &rdef_types, &["CWRType"], "1*", true)?;
    b.relation("from_entity", &rdef_types, &["CWEType"], "1*", true)?;
    b.relation("to_entity", &rdef_types, &["CWEType"], "1*", true)?;
    b.relation("constrained_by", &rdef_types, &["CWConstraint"], "*1", false)?;
    b.relation(
        "constraint_of",
        &["CWUniqueTogetherConstraint"],
        &["CWEType"],
        "1*",
        true,
    )?;

    let grantees = ["CWGroup", "RQLExpression"];
    b.relation("read_permission", &["CWEType", "CWAttribute", "CWRelation"], &grantees, "**", false)?;
    b.relation("add_permission", &["CWEType", "CWAttribute", "CWRelation"], &grantees, "**", false)?;
    b.relation("update_permission", &["CWEType", "CWAttribute"], &grantees, "**", false)?;
    b.relation("delete_permission", &["CWEType", "CWRelation"], &grantees, "**", false)?;

    let eid = RelationDefinition {
        uid: true,
        ..RelationDefinition::new("*", "eid", "Int").with_cardinality("11".parse()?)
    };
    b.schema.add_meta_relation(RelationType::new("eid"), eid)?;
    b.meta("creation_date", "TZDatetime", "11")?;
    b.meta("modification_date", "TZDatetime", "11")?;
    b.meta("cwuri", "String", "11")?;
    b.meta("is", "CWEType", "1*")?;
    b.meta("is_instance_of", "CWEType", "+*")?;
    b.meta("cw_source", "CWSource", "1*")?;

    Ok(b.schema)
}
