//! In-memory data model: entity types, relation types and the relation
//! definitions joining them.
//!
//! A [`Schema`] always contains the primitive types as final entity types.
//! A relation type whose definitions all point to primitive types is *final*
//! and its definitions are attributes, stored as columns of the subject's
//! table. Other relation types are stored either inlined (a column on the
//! subject table) or in a `<name>_relation` join table.

pub mod bootstrap;
pub mod constraints;
pub mod loader;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use constraints::{BoundOp, BoundValue, Constraint, Literal};

use crate::error::SchemaError;

/// Prefix of entity tables and of their columns.
pub const SQL_PREFIX: &str = "cw_";

/// Attribute holding the entity identifier.
pub const EID: &str = "eid";

// ── Primitive types ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Primitive {
    String,
    Password,
    Bytes,
    Int,
    BigInt,
    Float,
    Decimal,
    Boolean,
    Date,
    Time,
    Datetime,
    TZDatetime,
    TZTime,
    Interval,
}

impl Primitive {
    pub const ALL: [Self; 14] = [
        Self::String,
        Self::Password,
        Self::Bytes,
        Self::Int,
        Self::BigInt,
        Self::Float,
        Self::Decimal,
        Self::Boolean,
        Self::Date,
        Self::Time,
        Self::Datetime,
        Self::TZDatetime,
        Self::TZTime,
        Self::Interval,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "String",
            Self::Password => "Password",
            Self::Bytes => "Bytes",
            Self::Int => "Int",
            Self::BigInt => "BigInt",
            Self::Float => "Float",
            Self::Decimal => "Decimal",
            Self::Boolean => "Boolean",
            Self::Date => "Date",
            Self::Time => "Time",
            Self::Datetime => "Datetime",
            Self::TZDatetime => "TZDatetime",
            Self::TZTime => "TZTime",
            Self::Interval => "Interval",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == name)
    }
}

// ── Roles and cardinalities ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Subject,
    Object,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subject => "subject",
            Self::Object => "object",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "subject" => Some(Self::Subject),
            "object" => Some(Self::Object),
            _ => None,
        }
    }
}

/// One side of a cardinality: `1`, `?`, `+` or `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Card {
    One,
    ZeroOrOne,
    OneOrMore,
    Any,
}

impl Card {
    pub fn as_char(self) -> char {
        match self {
            Self::One => '1',
            Self::ZeroOrOne => '?',
            Self::OneOrMore => '+',
            Self::Any => '*',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            '1' => Some(Self::One),
            '?' => Some(Self::ZeroOrOne),
            '+' => Some(Self::OneOrMore),
            '*' => Some(Self::Any),
            _ => None,
        }
    }

    /// At least one related entity is required.
    pub fn is_mandatory(self) -> bool {
        matches!(self, Self::One | Self::OneOrMore)
    }

    /// At most one related entity is allowed.
    pub fn is_single(self) -> bool {
        matches!(self, Self::One | Self::ZeroOrOne)
    }
}

/// Subject and object cardinality, written as two characters (`"?*"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cardinality {
    pub subject: Card,
    pub object: Card,
}

impl Cardinality {
    pub const fn new(subject: Card, object: Card) -> Self {
        Self { subject, object }
    }

    pub fn get(self, role: Role) -> Card {
        match role {
            Role::Subject => self.subject,
            Role::Object => self.object,
        }
    }
}

impl FromStr for Cardinality {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match (
            chars.next().and_then(Card::from_char),
            chars.next().and_then(Card::from_char),
            chars.next(),
        ) {
            (Some(subject), Some(object), None) => Ok(Self { subject, object }),
            _ => Err(SchemaError::InvalidCardinality(s.to_string())),
        }
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.subject.as_char(), self.object.as_char())
    }
}

// ── Permissions ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PermissionAction {
    Read,
    Add,
    Update,
    Delete,
}

impl PermissionAction {
    pub const ENTITY: [Self; 4] = [Self::Read, Self::Add, Self::Update, Self::Delete];
    pub const ATTRIBUTE: [Self; 3] = [Self::Read, Self::Add, Self::Update];
    pub const RELATION: [Self; 3] = [Self::Read, Self::Add, Self::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ENTITY.into_iter().find(|a| a.as_str() == name)
    }

    /// Relation type linking a schema element to its granted groups and
    /// expressions for this action.
    pub fn relation_name(self) -> String {
        format!("{}_permission", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExpressionKind {
    Entity,
    Relation,
}

impl ExpressionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entity => "ERQLExpression",
            Self::Relation => "RRQLExpression",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ERQLExpression" => Some(Self::Entity),
            "RRQLExpression" => Some(Self::Relation),
            _ => None,
        }
    }
}

/// Something granting an action: a user group or a query expression.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PermissionRule {
    Group(String),
    Expression {
        kind: ExpressionKind,
        expression: String,
        mainvars: String,
    },
}

impl PermissionRule {
    pub fn group(name: &str) -> Self {
        Self::Group(name.to_string())
    }

    pub fn entity_expression(expression: &str) -> Self {
        Self::Expression {
            kind: ExpressionKind::Entity,
            expression: expression.to_string(),
            mainvars: "X".to_string(),
        }
    }
}

/// Per-action permission rules of an entity type or relation definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions {
    rules: BTreeMap<PermissionAction, BTreeSet<PermissionRule>>,
}

impl Permissions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with<I: IntoIterator<Item = PermissionRule>>(
        mut self,
        action: PermissionAction,
        rules: I,
    ) -> Self {
        self.set(action, rules);
        self
    }

    pub fn set<I: IntoIterator<Item = PermissionRule>>(
        &mut self,
        action: PermissionAction,
        rules: I,
    ) {
        self.rules.insert(action, rules.into_iter().collect());
    }

    pub fn insert(&mut self, action: PermissionAction, rule: PermissionRule) {
        self.rules.entry(action).or_default().insert(rule);
    }

    pub fn get(&self, action: PermissionAction) -> impl Iterator<Item = &PermissionRule> {
        self.rules.get(&action).into_iter().flatten()
    }

    pub fn rules(&self, action: PermissionAction) -> BTreeSet<PermissionRule> {
        self.get(action).cloned().collect()
    }

    pub fn default_entity() -> Self {
        use PermissionAction::{Add, Delete, Read, Update};
        let g = PermissionRule::group;
        Self::new()
            .with(Read, [g("managers"), g("users"), g("guests")])
            .with(Add, [g("managers"), g("users")])
            .with(Update, [g("managers"), g("owners")])
            .with(Delete, [g("managers"), g("owners")])
    }

    pub fn default_attribute() -> Self {
        use PermissionAction::{Add, Read, Update};
        let g = PermissionRule::group;
        Self::new()
            .with(Read, [g("managers"), g("users"), g("guests")])
            .with(
                Add,
                [
                    g("managers"),
                    PermissionRule::entity_expression("U has_add_permission X"),
                ],
            )
            .with(
                Update,
                [
                    g("managers"),
                    PermissionRule::entity_expression("U has_update_permission X"),
                ],
            )
    }

    pub fn default_relation() -> Self {
        use PermissionAction::{Add, Delete, Read};
        let g = PermissionRule::group;
        Self::new()
            .with(Read, [g("managers"), g("users"), g("guests")])
            .with(Add, [g("managers"), g("users")])
            .with(Delete, [g("managers"), g("users")])
    }
}

// ── Schema elements ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct EntityType {
    pub name: String,
    pub is_final: bool,
    pub description: String,
    /// Attribute groups whose combined values must be unique.
    pub unique_together: Vec<Vec<String>>,
    pub permissions: Permissions,
}

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_final: false,
            description: String::new(),
            unique_together: Vec::new(),
            permissions: Permissions::default_entity(),
        }
    }

    fn primitive(p: Primitive) -> Self {
        Self {
            name: p.as_str().to_string(),
            is_final: true,
            description: String::new(),
            unique_together: Vec::new(),
            permissions: Permissions::new(),
        }
    }

    pub fn table(&self) -> String {
        format!("{SQL_PREFIX}{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationType {
    pub name: String,
    /// Set once the first definition targets a primitive type.
    pub is_final: bool,
    pub inlined: bool,
    pub symmetric: bool,
    /// Side of the relation whose entity carries the indexed text.
    pub fulltext_container: Option<Role>,
    /// Defining rule of a computed relation; such relations are not stored.
    pub rule: Option<String>,
    pub description: String,
    pub rdefs: BTreeMap<(String, String), RelationDefinition>,
}

impl RelationType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_final: false,
            inlined: false,
            symmetric: false,
            fulltext_container: None,
            rule: None,
            description: String::new(),
            rdefs: BTreeMap::new(),
        }
    }

    /// Whether values live in a `<name>_relation` join table.
    pub fn has_table(&self) -> bool {
        !self.is_final && !self.inlined && self.rule.is_none()
    }

    pub fn table(&self) -> String {
        format!("{}_relation", self.name)
    }

    pub fn column(&self) -> String {
        format!("{SQL_PREFIX}{}", self.name)
    }

    pub fn subjects(&self) -> BTreeSet<&str> {
        self.rdefs.keys().map(|(s, _)| s.as_str()).collect()
    }

    pub fn objects(&self) -> BTreeSet<&str> {
        self.rdefs.keys().map(|(_, o)| o.as_str()).collect()
    }
}

/// A (subject, relation, object) triple with its properties.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationDefinition {
    pub subject: String,
    pub rtype: String,
    pub object: String,
    pub cardinality: Cardinality,
    pub constraints: Vec<Constraint>,
    pub indexed: bool,
    pub fulltextindexed: bool,
    pub internationalizable: bool,
    pub default: Option<Literal>,
    pub description: String,
    /// Column position among the subject's attributes; 0 lets the schema
    /// pick the next free slot.
    pub order: u32,
    /// The attribute is the entity identifier.
    pub uid: bool,
    pub permissions: Permissions,
}

impl RelationDefinition {
    pub fn new(
        subject: impl Into<String>,
        rtype: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        let object = object.into();
        let attribute = Primitive::from_name(&object).is_some();
        Self {
            subject: subject.into(),
            rtype: rtype.into(),
            cardinality: if attribute {
                Cardinality::new(Card::ZeroOrOne, Card::One)
            } else {
                Cardinality::new(Card::Any, Card::Any)
            },
            object,
            constraints: Vec::new(),
            indexed: false,
            fulltextindexed: false,
            internationalizable: false,
            default: None,
            description: String::new(),
            order: 0,
            uid: false,
            permissions: if attribute {
                Permissions::default_attribute()
            } else {
                Permissions::default_relation()
            },
        }
    }

    #[must_use]
    pub fn with_cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    #[must_use]
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn is_attribute(&self) -> bool {
        Primitive::from_name(&self.object).is_some()
    }

    pub fn primitive(&self) -> Option<Primitive> {
        Primitive::from_name(&self.object)
    }

    pub fn is_unique(&self) -> bool {
        self.constraints.iter().any(|c| matches!(c, Constraint::Unique))
    }

    pub fn max_size(&self) -> Option<u32> {
        self.constraints.iter().find_map(Constraint::max_size)
    }

    pub fn column(&self) -> String {
        format!("{SQL_PREFIX}{}", self.rtype)
    }

    pub fn key(&self) -> (String, String, String) {
        (self.subject.clone(), self.rtype.clone(), self.object.clone())
    }
}

impl fmt::Display for RelationDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject, self.rtype, self.object)
    }
}

// ── Schema ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    entities: BTreeMap<String, EntityType>,
    relations: BTreeMap<String, RelationType>,
    /// Definitions added to every non-final entity type (subject `*`).
    meta_templates: BTreeMap<String, RelationDefinition>,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema {
    /// A schema holding only the primitive types.
    pub fn new() -> Self {
        let entities = Primitive::ALL
            .into_iter()
            .map(|p| (p.as_str().to_string(), EntityType::primitive(p)))
            .collect();
        Self {
            entities,
            relations: BTreeMap::new(),
            meta_templates: BTreeMap::new(),
        }
    }

    // ── Lookup ────────────────────────────────────────────────────

    pub fn entity(&self, name: &str) -> Option<&EntityType> {
        self.entities.get(name)
    }

    pub fn entity_mut(&mut self, name: &str) -> Option<&mut EntityType> {
        self.entities.get_mut(name)
    }

    pub fn has_entity(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// All entity types, final ones included, by name.
    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.entities.values()
    }

    /// Non-final entity types, by name.
    pub fn user_entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.entities.values().filter(|e| !e.is_final)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationType> {
        self.relations.get(name)
    }

    pub fn relation_mut(&mut self, name: &str) -> Option<&mut RelationType> {
        self.relations.get_mut(name)
    }

    pub fn has_relation(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    pub fn relation_types(&self) -> impl Iterator<Item = &RelationType> {
        self.relations.values()
    }

    pub fn rdef(&self, subject: &str, rtype: &str, object: &str) -> Option<&RelationDefinition> {
        self.relations
            .get(rtype)?
            .rdefs
            .get(&(subject.to_string(), object.to_string()))
    }

    pub fn rdef_mut(
        &mut self,
        subject: &str,
        rtype: &str,
        object: &str,
    ) -> Option<&mut RelationDefinition> {
        self.relations
            .get_mut(rtype)?
            .rdefs
            .get_mut(&(subject.to_string(), object.to_string()))
    }

    /// Every relation definition, grouped by relation type name.
    pub fn rdefs(&self) -> impl Iterator<Item = &RelationDefinition> {
        self.relations.values().flat_map(|r| r.rdefs.values())
    }

    pub fn is_meta_relation(&self, rtype: &str) -> bool {
        self.meta_templates.contains_key(rtype)
    }

    /// Take over `other`'s meta relation templates for the relation types
    /// this schema already has, without applying them.
    pub fn adopt_meta_templates(&mut self, other: &Schema) {
        for (name, template) in &other.meta_templates {
            if self.relations.contains_key(name) {
                self.meta_templates.insert(name.clone(), template.clone());
            }
        }
    }

    /// Attributes of `etype` in column order, identifier first.
    pub fn attributes(&self, etype: &str) -> Vec<&RelationDefinition> {
        let mut attrs: Vec<&RelationDefinition> = self
            .rdefs()
            .filter(|d| d.subject == etype && d.is_attribute())
            .collect();
        attrs.sort_by(|a, b| (!a.uid, a.order, &a.rtype).cmp(&(!b.uid, b.order, &b.rtype)));
        attrs
    }

    pub fn attribute(&self, etype: &str, name: &str) -> Option<&RelationDefinition> {
        self.relations
            .get(name)
            .filter(|r| r.is_final)?
            .rdefs
            .iter()
            .find(|((s, _), _)| s == etype)
            .map(|(_, d)| d)
    }

    /// Non-final definitions having `etype` on the given side.
    pub fn relations_of(&self, etype: &str, role: Role) -> Vec<&RelationDefinition> {
        self.rdefs()
            .filter(|d| !d.is_attribute())
            .filter(|d| match role {
                Role::Subject => d.subject == etype,
                Role::Object => d.object == etype,
            })
            .collect()
    }

    /// Inlined relation types stored as a column of `etype`'s table.
    pub fn inlined_relations(&self, etype: &str) -> Vec<&RelationType> {
        self.relations
            .values()
            .filter(|r| r.inlined && !r.is_final && r.subjects().contains(etype))
            .collect()
    }

    /// Full-text indexed attributes of `etype`.
    pub fn fulltext_attributes(&self, etype: &str) -> Vec<&RelationDefinition> {
        self.attributes(etype)
            .into_iter()
            .filter(|d| d.fulltextindexed)
            .collect()
    }

    // ── Mutation ──────────────────────────────────────────────────

    /// Add an entity type, then give it every meta relation.
    pub fn add_entity_type(&mut self, etype: EntityType) -> Result<(), SchemaError> {
        if self.entities.contains_key(&etype.name) {
            return Err(SchemaError::Duplicate(etype.name));
        }
        let name = etype.name.clone();
        let is_final = etype.is_final;
        self.entities.insert(name.clone(), etype);
        if !is_final {
            let templates: Vec<RelationDefinition> = self.meta_templates.values().cloned().collect();
            for template in templates {
                self.apply_template(&template, &name)?;
            }
        }
        Ok(())
    }

    pub fn add_relation_type(&mut self, rtype: RelationType) -> Result<(), SchemaError> {
        if self.relations.contains_key(&rtype.name) {
            return Err(SchemaError::Duplicate(rtype.name));
        }
        let rdefs: Vec<RelationDefinition> = rtype.rdefs.values().cloned().collect();
        let mut bare = rtype;
        bare.rdefs.clear();
        self.relations.insert(bare.name.clone(), bare);
        for rdef in rdefs {
            self.add_relation_definition(rdef)?;
        }
        Ok(())
    }

    /// Add a definition to an existing relation type.
    pub fn add_relation_definition(&mut self, mut rdef: RelationDefinition) -> Result<(), SchemaError> {
        match self.entities.get(&rdef.subject) {
            None => return Err(SchemaError::UnknownEntityType(rdef.subject)),
            Some(e) if e.is_final => {
                return Err(SchemaError::Invalid {
                    element: rdef.to_string(),
                    message: "subject must not be a final type".into(),
                });
            }
            Some(_) => {}
        }
        if !self.entities.contains_key(&rdef.object) {
            return Err(SchemaError::UnknownEntityType(rdef.object));
        }
        let attribute = rdef.is_attribute();
        if rdef.order == 0 {
            rdef.order = self
                .rdefs()
                .filter(|d| d.subject == rdef.subject)
                .map(|d| d.order)
                .max()
                .unwrap_or(0)
                + 1;
        }
        let Some(rtype) = self.relations.get_mut(&rdef.rtype) else {
            return Err(SchemaError::UnknownRelationType(rdef.rtype));
        };
        if !rtype.rdefs.is_empty() && rtype.is_final != attribute {
            return Err(SchemaError::Invalid {
                element: rdef.to_string(),
                message: "cannot mix attribute and relation definitions".into(),
            });
        }
        let key = (rdef.subject.clone(), rdef.object.clone());
        if rtype.rdefs.contains_key(&key) {
            return Err(SchemaError::Duplicate(rdef.to_string()));
        }
        rtype.is_final = attribute;
        rtype.rdefs.insert(key, rdef);
        Ok(())
    }

    /// Declare a relation given to every non-final entity type.
    pub fn add_meta_relation(
        &mut self,
        rtype: RelationType,
        template: RelationDefinition,
    ) -> Result<(), SchemaError> {
        let name = rtype.name.clone();
        if !self.relations.contains_key(&name) {
            self.add_relation_type(rtype)?;
        }
        let subjects: Vec<String> = self.user_entity_types().map(|e| e.name.clone()).collect();
        for subject in &subjects {
            self.apply_template(&template, subject)?;
        }
        self.meta_templates.insert(name, template);
        Ok(())
    }

    fn apply_template(&mut self, template: &RelationDefinition, subject: &str) -> Result<(), SchemaError> {
        if !self.entities.contains_key(&template.object)
            || self.rdef(subject, &template.rtype, &template.object).is_some()
        {
            return Ok(());
        }
        let mut rdef = template.clone();
        rdef.subject = subject.to_string();
        self.add_relation_definition(rdef)
    }

    /// Remove an entity type and every definition mentioning it. Relation
    /// types left without definitions are removed too.
    pub fn remove_entity_type(&mut self, name: &str) -> Result<EntityType, SchemaError> {
        let etype = self
            .entities
            .remove(name)
            .ok_or_else(|| SchemaError::UnknownEntityType(name.to_string()))?;
        let mut emptied = Vec::new();
        for rtype in self.relations.values_mut() {
            let before = rtype.rdefs.len();
            rtype.rdefs.retain(|(s, o), _| s != name && o != name);
            if before > 0 && rtype.rdefs.is_empty() && rtype.rule.is_none() {
                emptied.push(rtype.name.clone());
            }
        }
        for rtype in emptied {
            if !self.meta_templates.contains_key(&rtype) {
                self.relations.remove(&rtype);
            }
        }
        Ok(etype)
    }

    pub fn remove_relation_type(&mut self, name: &str) -> Result<RelationType, SchemaError> {
        self.meta_templates.remove(name);
        self.relations
            .remove(name)
            .ok_or_else(|| SchemaError::UnknownRelationType(name.to_string()))
    }

    /// Remove one definition; the relation type itself is kept.
    pub fn remove_relation_definition(
        &mut self,
        subject: &str,
        rtype: &str,
        object: &str,
    ) -> Result<RelationDefinition, SchemaError> {
        self.relations
            .get_mut(rtype)
            .and_then(|r| r.rdefs.remove(&(subject.to_string(), object.to_string())))
            .ok_or_else(|| SchemaError::UnknownRelationDefinition {
                subject: subject.to_string(),
                rtype: rtype.to_string(),
                object: object.to_string(),
            })
    }

    pub fn rename_entity_type(&mut self, old: &str, new: &str) -> Result<(), SchemaError> {
        if self.entities.contains_key(new) {
            return Err(SchemaError::Duplicate(new.to_string()));
        }
        let mut etype = self
            .entities
            .remove(old)
            .ok_or_else(|| SchemaError::UnknownEntityType(old.to_string()))?;
        etype.name = new.to_string();
        self.entities.insert(new.to_string(), etype);
        let rename = |n: &String| if n == old { new.to_string() } else { n.clone() };
        for rtype in self.relations.values_mut() {
            let rdefs = std::mem::take(&mut rtype.rdefs);
            rtype.rdefs = rdefs
                .into_iter()
                .map(|((s, o), mut d)| {
                    d.subject = rename(&d.subject);
                    d.object = rename(&d.object);
                    ((rename(&s), rename(&o)), d)
                })
                .collect();
        }
        Ok(())
    }

    pub fn rename_relation_type(&mut self, old: &str, new: &str) -> Result<(), SchemaError> {
        if self.relations.contains_key(new) {
            return Err(SchemaError::Duplicate(new.to_string()));
        }
        let mut rtype = self
            .relations
            .remove(old)
            .ok_or_else(|| SchemaError::UnknownRelationType(old.to_string()))?;
        rtype.name = new.to_string();
        for rdef in rtype.rdefs.values_mut() {
            rdef.rtype = new.to_string();
        }
        self.relations.insert(new.to_string(), rtype);
        if let Some(mut template) = self.meta_templates.remove(old) {
            template.rtype = new.to_string();
            self.meta_templates.insert(new.to_string(), template);
        }
        Ok(())
    }
}
