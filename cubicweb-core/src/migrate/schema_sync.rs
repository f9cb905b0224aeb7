//! Applies schema changes to a live instance.
//!
//! [`SchemaSync`] holds the schema declared by the cubes on disk and the one
//! installed in the database. Each operation brings part of the installed
//! schema in line with the declared one, changing the tables, the persisted
//! schema rows and the in-memory copy together.
//!
//! Adding what is already installed, or dropping what is not, logs a
//! warning and returns `false`.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, info, warn};

use crate::error::{Result, SchemaError};
use crate::schema::bootstrap::SYSTEM_TYPES;
use crate::schema::loader::DefinedNames;
use crate::schema::{
    Constraint, PermissionAction, Permissions, RelationDefinition, RelationType, SQL_PREFIX, Schema,
};
use crate::sql::ddl::{check_constraint, column_sql, entity_index_sql, entity_table_sql, eschema_to_sql, rschema_to_sql};
use crate::store::entities::{delete_entity, set_attributes};
use crate::store::serialize::{
    delete_entity_type, delete_rdef, delete_relation_type, deserialize_schema, eschema_eid, grant,
    literal_json, rdef_actions, rdef_eid, revoke, rschema_eid, serialize_constraint, serialize_entity_type,
    serialize_rdef, serialize_relation_type, serialize_unique_together,
};
use crate::store::{SqlValue, SystemSource};

fn entity_table(etype: &str) -> String {
    format!("{SQL_PREFIX}{etype}")
}

fn corrupted(what: &str) -> SchemaError {
    SchemaError::Corrupted(format!("{what} is not persisted"))
}

fn constraint_keys(constraints: &[Constraint]) -> Vec<String> {
    let mut keys: Vec<String> = constraints
        .iter()
        .map(|c| format!("{}:{}", c.kind_name(), c.serialize()))
        .collect();
    keys.sort();
    keys
}

fn bare(rtype: &RelationType) -> RelationType {
    let mut bare = rtype.clone();
    bare.rdefs.clear();
    bare
}

pub struct SchemaSync<'a> {
    source: &'a dyn SystemSource,
    fs: &'a Schema,
    repo: Schema,
}

impl fmt::Debug for SchemaSync<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaSync")
            .field("fs_entity_types", &self.fs.entity_types().count())
            .field("repo_entity_types", &self.repo.entity_types().count())
            .finish_non_exhaustive()
    }
}

impl<'a> SchemaSync<'a> {
    pub fn new(source: &'a dyn SystemSource, fs: &'a Schema) -> Result<Self> {
        Ok(Self {
            source,
            fs,
            repo: deserialize_schema(source)?,
        })
    }

    /// Schema declared by the cubes.
    pub fn fs(&self) -> &'a Schema {
        self.fs
    }

    /// Schema installed in the database, as changed so far.
    pub fn repo(&self) -> &Schema {
        &self.repo
    }

    /// Re-read the installed schema, after a rollback.
    pub fn reload(&mut self) -> Result<()> {
        self.repo = deserialize_schema(self.source)?;
        Ok(())
    }

    fn execute_all(&self, statements: &[String]) -> Result<()> {
        for sql in statements {
            self.source.execute(sql, &[])?;
        }
        Ok(())
    }

    /// Recreate the table of `etype` from the installed schema, keeping the
    /// values of every column the old and new tables share.
    fn rebuild_table(&self, etype: &str) -> Result<()> {
        let dialect = self.source.dialect();
        let table = entity_table(etype);
        if !self.source.has_table(&table)? {
            return self.execute_all(&eschema_to_sql(dialect, &self.repo, etype, &[], SQL_PREFIX));
        }
        let old: BTreeSet<String> = self.source.table_columns(&table)?.into_iter().collect();
        // Index names are global; free them before the new ones are created.
        for (name, sql) in self.source.index_definitions(&table)? {
            let Some(sql) = sql else { continue };
            if !dialect.is_primary_key_index(&name, Some(&sql)) {
                self.source.execute(&format!("DROP INDEX {name}"), &[])?;
            }
        }
        let tmp = format!("{table}_old");
        self.source.execute(&dialect.rename_table(&table, &tmp), &[])?;
        self.source.execute(
            &entity_table_sql(dialect, &self.repo, etype, &[], SQL_PREFIX, &table),
            &[],
        )?;
        let common: Vec<String> = self
            .source
            .table_columns(&table)?
            .into_iter()
            .filter(|c| old.contains(c))
            .collect();
        if !common.is_empty() {
            let columns = common.join(", ");
            self.source.execute(
                &format!("INSERT INTO {table} ({columns}) SELECT {columns} FROM {tmp}"),
                &[],
            )?;
        }
        self.source.execute(&format!("DROP TABLE {tmp}"), &[])?;
        self.execute_all(&entity_index_sql(dialect, &self.repo, etype, &[], SQL_PREFIX))?;
        debug!(table, "Table rebuilt");
        Ok(())
    }

    fn create_join_table(&self, rtype: &str) -> Result<()> {
        if !self.source.has_table(&format!("{rtype}_relation"))? {
            self.execute_all(&rschema_to_sql(self.source.dialect(), rtype))?;
        }
        Ok(())
    }

    fn drop_join_table(&self, rtype: &str) -> Result<()> {
        let table = format!("{rtype}_relation");
        if self.source.has_table(&table)? {
            self.source.execute(&format!("DROP TABLE {table}"), &[])?;
        }
        Ok(())
    }

    /// Replace the persisted unique-together groups of `etype` with the
    /// installed ones.
    fn persist_unique_together(&self, etype: &str) -> Result<()> {
        let eid = eschema_eid(self.source, etype)?.ok_or_else(|| corrupted(etype))?;
        let groups = self.source.query_column(
            "SELECT cw_eid FROM cw_CWUniqueTogetherConstraint WHERE cw_constraint_of = ?",
            &[eid.into()],
        )?;
        for group in groups.iter().filter_map(SqlValue::as_i64) {
            delete_entity(self.source, &self.repo, group)?;
        }
        if let Some(entity) = self.repo.entity(etype) {
            for attrs in &entity.unique_together {
                serialize_unique_together(self.source, &self.repo, eid, etype, attrs)?;
            }
        }
        Ok(())
    }

    // ── Entity types ──────────────────────────────────────────────

    /// Install a declared entity type with the definitions linking it to
    /// installed types.
    pub fn add_entity_type(&mut self, name: &str) -> Result<bool> {
        if self.repo.has_entity(name) {
            warn!(etype = name, "Entity type already installed");
            return Ok(false);
        }
        let fs = self.fs;
        let etype = fs
            .entity(name)
            .ok_or_else(|| SchemaError::UnknownEntityType(name.to_string()))?;
        if etype.is_final {
            return Err(SchemaError::Invalid {
                element: name.to_string(),
                message: "final types cannot be added".into(),
            }
            .into());
        }
        self.repo.add_entity_type(etype.clone())?;

        let mut new_rtypes = Vec::new();
        let candidates: Vec<&RelationDefinition> =
            fs.rdefs().filter(|d| d.subject == name || d.object == name).collect();
        for rdef in candidates {
            if !self.repo.has_entity(&rdef.subject)
                || !self.repo.has_entity(&rdef.object)
                || self.repo.rdef(&rdef.subject, &rdef.rtype, &rdef.object).is_some()
            {
                continue;
            }
            if !self.repo.has_relation(&rdef.rtype) {
                let rtype = fs
                    .relation(&rdef.rtype)
                    .ok_or_else(|| SchemaError::UnknownRelationType(rdef.rtype.clone()))?;
                self.repo.add_relation_type(bare(rtype))?;
                new_rtypes.push(rdef.rtype.clone());
            }
            self.repo.add_relation_definition(rdef.clone())?;
        }

        let dialect = self.source.dialect();
        self.execute_all(&eschema_to_sql(dialect, &self.repo, name, &[], SQL_PREFIX))?;
        let rdefs: Vec<RelationDefinition> = self
            .repo
            .rdefs()
            .filter(|d| d.subject == name || d.object == name)
            .cloned()
            .collect();
        let mut rebuild = BTreeSet::new();
        for rdef in &rdefs {
            let Some(rtype) = self.repo.relation(&rdef.rtype) else {
                continue;
            };
            if rtype.has_table() {
                self.create_join_table(&rtype.name)?;
            } else if rtype.inlined && rdef.subject != name {
                let columns = self.source.table_columns(&entity_table(&rdef.subject))?;
                if !columns.contains(&rtype.column()) {
                    rebuild.insert(rdef.subject.clone());
                }
            }
        }
        for subject in &rebuild {
            self.rebuild_table(subject)?;
        }

        let entity = self
            .repo
            .entity(name)
            .ok_or_else(|| SchemaError::UnknownEntityType(name.to_string()))?;
        serialize_entity_type(self.source, &self.repo, entity)?;
        for rtype in &new_rtypes {
            if let Some(rtype) = self.repo.relation(rtype) {
                serialize_relation_type(self.source, &self.repo, &bare(rtype))?;
            }
        }
        for rdef in &rdefs {
            serialize_rdef(self.source, &self.repo, rdef)?;
        }
        info!(etype = name, relations = rdefs.len(), "Entity type added");
        Ok(true)
    }

    /// Remove an entity type with all of its entities.
    pub fn drop_entity_type(&mut self, name: &str) -> Result<bool> {
        let Some(etype) = self.repo.entity(name) else {
            warn!(etype = name, "Entity type not installed");
            return Ok(false);
        };
        if etype.is_final || SYSTEM_TYPES.contains(&name) {
            return Err(SchemaError::Invalid {
                element: name.to_string(),
                message: "built-in types cannot be dropped".into(),
            }
            .into());
        }
        let of_type = "SELECT eid FROM entities WHERE type = ?";
        let tables = self.source.table_names()?;
        for rtype in self.repo.relation_types() {
            if rtype.has_table() && tables.contains(&rtype.table()) {
                self.source.execute(
                    &format!(
                        "DELETE FROM {} WHERE eid_from IN ({of_type}) OR eid_to IN ({of_type})",
                        rtype.table()
                    ),
                    &[name.into(), name.into()],
                )?;
            } else if rtype.inlined && !rtype.is_final {
                for subject in rtype.subjects().into_iter().filter(|s| *s != name) {
                    let table = entity_table(subject);
                    if tables.contains(&table) {
                        self.source.execute(
                            &format!(
                                "UPDATE {table} SET {col} = NULL WHERE {col} IN ({of_type})",
                                col = rtype.column()
                            ),
                            &[name.into()],
                        )?;
                    }
                }
            }
        }
        self.source.execute(&format!("DELETE FROM appears WHERE uid IN ({of_type})"), &[name.into()])?;
        let removed = self.source.execute("DELETE FROM entities WHERE type = ?", &[name.into()])?;

        let touched: BTreeSet<String> = self
            .repo
            .rdefs()
            .filter(|d| d.subject == name || d.object == name)
            .map(|d| d.rtype.clone())
            .collect();
        let inlined_subjects: BTreeSet<String> = self
            .repo
            .rdefs()
            .filter(|d| d.object == name && d.subject != name)
            .filter(|d| self.repo.relation(&d.rtype).is_some_and(|r| r.inlined))
            .map(|d| d.subject.clone())
            .collect();
        self.repo.remove_entity_type(name)?;
        let emptied: Vec<String> = touched
            .into_iter()
            .filter(|r| match self.repo.relation(r) {
                None => true,
                Some(rtype) => rtype.rdefs.is_empty() && !self.repo.is_meta_relation(r),
            })
            .collect();

        for rtype in &emptied {
            self.drop_join_table(rtype)?;
        }
        let table = entity_table(name);
        if self.source.has_table(&table)? {
            self.source.execute(&format!("DROP TABLE {table}"), &[])?;
        }
        for subject in &inlined_subjects {
            self.rebuild_table(subject)?;
        }

        delete_entity_type(self.source, &self.repo, name)?;
        for rtype in &emptied {
            if self.repo.has_relation(rtype) {
                self.repo.remove_relation_type(rtype)?;
            }
            delete_relation_type(self.source, &self.repo, rtype)?;
        }
        info!(etype = name, entities = removed, "Entity type dropped");
        Ok(true)
    }

    pub fn rename_entity_type(&mut self, old: &str, new: &str) -> Result<bool> {
        if !self.repo.has_entity(old) {
            warn!(etype = old, "Entity type not installed, nothing to rename");
            return Ok(false);
        }
        if self.repo.has_entity(new) {
            return Err(SchemaError::Duplicate(new.to_string()).into());
        }
        let dialect = self.source.dialect();
        self.source
            .execute(&dialect.rename_table(&entity_table(old), &entity_table(new)), &[])?;
        self.source
            .execute("UPDATE entities SET type = ? WHERE type = ?", &[new.into(), old.into()])?;
        self.repo.rename_entity_type(old, new)?;
        // Index and check names embed the table name.
        self.rebuild_table(new)?;

        let eid = eschema_eid(self.source, old)?.ok_or_else(|| corrupted(old))?;
        set_attributes(self.source, &self.repo, eid, &[("name", new.into())])?;
        self.persist_unique_together(new)?;
        info!(old, new, "Entity type renamed");
        Ok(true)
    }

    // ── Relation types ────────────────────────────────────────────

    /// Install a declared relation type with every definition whose
    /// subject and object are installed.
    pub fn add_relation_type(&mut self, name: &str) -> Result<bool> {
        if self.repo.has_relation(name) {
            warn!(rtype = name, "Relation type already installed");
            return Ok(false);
        }
        let fs = self.fs;
        let rtype = fs
            .relation(name)
            .ok_or_else(|| SchemaError::UnknownRelationType(name.to_string()))?;
        let bare = bare(rtype);
        self.repo.add_relation_type(bare.clone())?;
        serialize_relation_type(self.source, &self.repo, &bare)?;
        let mut added = 0;
        for rdef in rtype.rdefs.values() {
            if self.repo.has_entity(&rdef.subject) && self.repo.has_entity(&rdef.object) {
                self.install_rdef(rdef.clone())?;
                added += 1;
            }
        }
        info!(rtype = name, definitions = added, "Relation type added");
        Ok(true)
    }

    pub fn drop_relation_type(&mut self, name: &str) -> Result<bool> {
        let Some(rtype) = self.repo.relation(name).cloned() else {
            warn!(rtype = name, "Relation type not installed");
            return Ok(false);
        };
        for rdef in rtype.rdefs.values() {
            self.drop_relation_definition(&rdef.subject, name, &rdef.object)?;
        }
        if self.repo.has_relation(name) {
            self.drop_join_table(name)?;
            self.repo.remove_relation_type(name)?;
            delete_relation_type(self.source, &self.repo, name)?;
        }
        info!(rtype = name, "Relation type dropped");
        Ok(true)
    }

    pub fn rename_relation_type(&mut self, old: &str, new: &str) -> Result<bool> {
        let Some(rtype) = self.repo.relation(old).cloned() else {
            warn!(rtype = old, "Relation type not installed, nothing to rename");
            return Ok(false);
        };
        if self.repo.has_relation(new) {
            return Err(SchemaError::Duplicate(new.to_string()).into());
        }
        let dialect = self.source.dialect();
        let subjects: Vec<String> = rtype.subjects().into_iter().map(str::to_string).collect();
        let in_columns = rtype.is_final || rtype.inlined;
        if rtype.has_table() && self.source.has_table(&rtype.table())? {
            self.create_join_table(new)?;
            self.source.execute(
                &format!(
                    "INSERT INTO {new}_relation (eid_from, eid_to) SELECT eid_from, eid_to FROM {}",
                    rtype.table()
                ),
                &[],
            )?;
            self.drop_join_table(old)?;
        } else if in_columns {
            for subject in &subjects {
                self.source.execute(
                    &dialect.rename_column(
                        &entity_table(subject),
                        &format!("{SQL_PREFIX}{old}"),
                        &format!("{SQL_PREFIX}{new}"),
                    ),
                    &[],
                )?;
            }
        }
        self.repo.rename_relation_type(old, new)?;
        let mut regrouped = Vec::new();
        for subject in &subjects {
            if let Some(entity) = self.repo.entity_mut(subject) {
                let mut changed = false;
                for attr in entity.unique_together.iter_mut().flatten() {
                    if attr == old {
                        *attr = new.to_string();
                        changed = true;
                    }
                }
                if changed {
                    regrouped.push(subject.clone());
                }
            }
        }
        if in_columns {
            for subject in &subjects {
                self.rebuild_table(subject)?;
            }
        }

        let eid = rschema_eid(self.source, old)?.ok_or_else(|| corrupted(old))?;
        set_attributes(self.source, &self.repo, eid, &[("name", new.into())])?;
        for subject in &regrouped {
            self.persist_unique_together(subject)?;
        }
        info!(old, new, "Relation type renamed");
        Ok(true)
    }

    // ── Relation definitions ──────────────────────────────────────

    /// Add `rdef` to the installed schema, its table and its persisted rows.
    /// The relation type must already be installed.
    fn install_rdef(&mut self, rdef: RelationDefinition) -> Result<()> {
        self.repo.add_relation_definition(rdef.clone())?;
        let rtype = self
            .repo
            .relation(&rdef.rtype)
            .ok_or_else(|| SchemaError::UnknownRelationType(rdef.rtype.clone()))?;
        if rdef.is_attribute() {
            self.rebuild_table(&rdef.subject)?;
        } else if rtype.inlined {
            let columns = self.source.table_columns(&entity_table(&rdef.subject))?;
            if !columns.contains(&rtype.column()) {
                self.rebuild_table(&rdef.subject)?;
            }
        } else if rtype.has_table() {
            self.create_join_table(&rdef.rtype)?;
        }
        serialize_rdef(self.source, &self.repo, &rdef)?;
        debug!(rdef = %rdef, "Relation definition installed");
        Ok(())
    }

    pub fn add_relation_definition(&mut self, subject: &str, rtype: &str, object: &str) -> Result<bool> {
        if self.repo.rdef(subject, rtype, object).is_some() {
            warn!(subject, rtype, object, "Relation definition already installed");
            return Ok(false);
        }
        let fs = self.fs;
        let rdef = fs
            .rdef(subject, rtype, object)
            .ok_or_else(|| SchemaError::UnknownRelationDefinition {
                subject: subject.to_string(),
                rtype: rtype.to_string(),
                object: object.to_string(),
            })?;
        for etype in [subject, object] {
            if !self.repo.has_entity(etype) {
                return Err(SchemaError::UnknownEntityType(etype.to_string()).into());
            }
        }
        if !self.repo.has_relation(rtype) {
            let declared = fs
                .relation(rtype)
                .ok_or_else(|| SchemaError::UnknownRelationType(rtype.to_string()))?;
            let bare = bare(declared);
            self.repo.add_relation_type(bare.clone())?;
            serialize_relation_type(self.source, &self.repo, &bare)?;
        }
        self.install_rdef(rdef.clone())?;
        info!(subject, rtype, object, "Relation definition added");
        Ok(true)
    }

    /// Remove a definition and its values. A relation type left without
    /// definitions goes too.
    pub fn drop_relation_definition(&mut self, subject: &str, rtype: &str, object: &str) -> Result<bool> {
        let Some(rdef) = self.repo.rdef(subject, rtype, object).cloned() else {
            warn!(subject, rtype, object, "Relation definition not installed");
            return Ok(false);
        };
        if rdef.uid {
            return Err(SchemaError::Invalid {
                element: rdef.to_string(),
                message: "the identifier cannot be dropped".into(),
            }
            .into());
        }
        let relation = self
            .repo
            .relation(rtype)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownRelationType(rtype.to_string()))?;
        let of_type = "SELECT eid FROM entities WHERE type = ?";
        if rdef.is_attribute() {
            self.repo.remove_relation_definition(subject, rtype, object)?;
            self.rebuild_table(subject)?;
        } else if relation.inlined {
            let table = entity_table(subject);
            if self.source.has_table(&table)? {
                self.source.execute(
                    &format!(
                        "UPDATE {table} SET {col} = NULL WHERE {col} IN ({of_type})",
                        col = relation.column()
                    ),
                    &[object.into()],
                )?;
            }
            self.repo.remove_relation_definition(subject, rtype, object)?;
            let still_inlined = self
                .repo
                .relation(rtype)
                .is_some_and(|r| r.subjects().contains(subject));
            if !still_inlined {
                self.rebuild_table(subject)?;
            }
        } else {
            if relation.has_table() && self.source.has_table(&relation.table())? {
                let delete = format!(
                    "DELETE FROM {} WHERE eid_from IN ({of_type}) AND eid_to IN ({of_type})",
                    relation.table()
                );
                self.source.execute(&delete, &[subject.into(), object.into()])?;
                if relation.symmetric && subject != object {
                    self.source.execute(&delete, &[object.into(), subject.into()])?;
                }
            }
            self.repo.remove_relation_definition(subject, rtype, object)?;
            if self.repo.relation(rtype).is_some_and(|r| r.rdefs.is_empty()) {
                self.drop_join_table(rtype)?;
            }
        }
        delete_rdef(self.source, &self.repo, subject, rtype, object)?;
        let emptied = self
            .repo
            .relation(rtype)
            .is_some_and(|r| r.rdefs.is_empty() && r.rule.is_none());
        if emptied && !self.repo.is_meta_relation(rtype) {
            self.repo.remove_relation_type(rtype)?;
            delete_relation_type(self.source, &self.repo, rtype)?;
            debug!(rtype, "Relation type left without definitions removed");
        }
        info!(subject, rtype, object, "Relation definition dropped");
        Ok(true)
    }

    // ── Attributes ────────────────────────────────────────────────

    pub fn add_attribute(&mut self, etype: &str, attr: &str) -> Result<bool> {
        let fs = self.fs;
        let rdef = fs.attribute(etype, attr).ok_or_else(|| SchemaError::Invalid {
            element: format!("{etype}.{attr}"),
            message: "no such attribute in the cube schemas".into(),
        })?;
        self.add_relation_definition(etype, attr, &rdef.object)
    }

    pub fn drop_attribute(&mut self, etype: &str, attr: &str) -> Result<bool> {
        let Some(object) = self.repo.attribute(etype, attr).map(|d| d.object.clone()) else {
            warn!(etype, attr, "Attribute not installed");
            return Ok(false);
        };
        self.drop_relation_definition(etype, attr, &object)
    }

    /// Add `new`, copy the values of `old` into it, then drop `old`.
    pub fn rename_attribute(&mut self, etype: &str, old: &str, new: &str) -> Result<bool> {
        if self.repo.attribute(etype, old).is_none() {
            warn!(etype, attr = old, "Attribute not installed, nothing to rename");
            return Ok(false);
        }
        self.add_attribute(etype, new)?;
        self.source.execute(
            &format!(
                "UPDATE {} SET {SQL_PREFIX}{new} = {SQL_PREFIX}{old}",
                entity_table(etype)
            ),
            &[],
        )?;
        self.drop_attribute(etype, old)?;
        info!(etype, old, new, "Attribute renamed");
        Ok(true)
    }

    /// Install every element a cube schema declares that is not installed
    /// yet. Returns how many were added.
    pub fn add_elements(&mut self, names: &DefinedNames) -> Result<usize> {
        let mut added = 0;
        for etype in &names.entities {
            if !self.repo.has_entity(etype) && self.add_entity_type(etype)? {
                added += 1;
            }
        }
        let fs = self.fs;
        for name in &names.relations {
            let Some(rtype) = fs.relation(name) else { continue };
            if !self.repo.has_relation(name) {
                if self.add_relation_type(name)? {
                    added += 1;
                }
                continue;
            }
            for rdef in rtype.rdefs.values() {
                let installable = self.repo.has_entity(&rdef.subject)
                    && self.repo.has_entity(&rdef.object)
                    && self.repo.rdef(&rdef.subject, name, &rdef.object).is_none();
                if installable && self.add_relation_definition(&rdef.subject, name, &rdef.object)? {
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    // ── Properties and permissions ────────────────────────────────

    /// Bring descriptions, flags, constraints and permissions of installed
    /// elements in line with the cube schemas. `element` restricts the run
    /// to one entity type (with its attributes and subject relations) or
    /// one relation type. Returns the number of changes.
    pub fn sync_schema_props_perms(&mut self, element: Option<&str>) -> Result<usize> {
        let fs = self.fs;
        let (etypes, rtypes): (Vec<String>, Vec<String>) = match element {
            None => (
                fs.user_entity_types()
                    .filter(|e| self.repo.has_entity(&e.name))
                    .map(|e| e.name.clone())
                    .collect(),
                fs.relation_types()
                    .filter(|r| self.repo.has_relation(&r.name))
                    .map(|r| r.name.clone())
                    .collect(),
            ),
            Some(name) if fs.has_entity(name) => (vec![name.to_string()], Vec::new()),
            Some(name) if fs.has_relation(name) => (Vec::new(), vec![name.to_string()]),
            Some(name) => {
                return Err(SchemaError::Invalid {
                    element: name.to_string(),
                    message: "not declared by any cube".into(),
                }
                .into());
            }
        };
        let rdefs: Vec<&RelationDefinition> = fs
            .rdefs()
            .filter(|d| match element {
                None => true,
                Some(name) => d.subject == name || d.rtype == name,
            })
            .filter(|d| self.repo.rdef(&d.subject, &d.rtype, &d.object).is_some())
            .collect();

        let mut changed = 0;
        for etype in &etypes {
            changed += self.sync_entity_type(etype)?;
        }
        for rtype in &rtypes {
            changed += self.sync_relation_type(rtype)?;
        }
        let mut rebuild = BTreeSet::new();
        for rdef in rdefs {
            changed += self.sync_rdef(rdef, &mut rebuild)?;
        }
        for etype in &rebuild {
            self.rebuild_table(etype)?;
        }
        info!(changed, element = element.unwrap_or("*"), "Schema properties and permissions synchronized");
        Ok(changed)
    }

    fn sync_permissions(
        &self,
        eid: i64,
        current: &Permissions,
        desired: &Permissions,
        actions: &[PermissionAction],
    ) -> Result<usize> {
        let mut changed = 0;
        for action in actions {
            let have = current.rules(*action);
            let want = desired.rules(*action);
            for rule in want.difference(&have) {
                grant(self.source, &self.repo, eid, *action, rule)?;
                changed += 1;
            }
            for rule in have.difference(&want) {
                revoke(self.source, &self.repo, eid, *action, rule)?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn sync_entity_type(&mut self, name: &str) -> Result<usize> {
        let fs = self.fs;
        let (Some(desired), Some(current)) = (fs.entity(name), self.repo.entity(name).cloned()) else {
            return Ok(0);
        };
        let eid = eschema_eid(self.source, name)?.ok_or_else(|| corrupted(name))?;
        let mut changed = 0;
        if desired.description != current.description {
            set_attributes(self.source, &self.repo, eid, &[("description", desired.description.as_str().into())])?;
            changed += 1;
        }
        changed += self.sync_permissions(
            eid,
            &current.permissions,
            &desired.permissions,
            &PermissionAction::ENTITY,
        )?;
        let regroup = desired.unique_together != current.unique_together;
        if let Some(entity) = self.repo.entity_mut(name) {
            entity.description.clone_from(&desired.description);
            entity.permissions = desired.permissions.clone();
            entity.unique_together.clone_from(&desired.unique_together);
        }
        if regroup {
            self.rebuild_table(name)?;
            self.persist_unique_together(name)?;
            changed += 1;
        }
        Ok(changed)
    }

    fn sync_relation_type(&mut self, name: &str) -> Result<usize> {
        let fs = self.fs;
        let (Some(desired), Some(current)) = (fs.relation(name), self.repo.relation(name).cloned()) else {
            return Ok(0);
        };
        let eid = rschema_eid(self.source, name)?.ok_or_else(|| corrupted(name))?;
        let mut values: Vec<(&str, SqlValue)> = Vec::new();
        if desired.description != current.description {
            values.push(("description", desired.description.as_str().into()));
        }
        if desired.symmetric != current.symmetric {
            values.push(("symmetric", desired.symmetric.into()));
        }
        if desired.fulltext_container != current.fulltext_container {
            values.push((
                "fulltext_container",
                desired.fulltext_container.map(crate::schema::Role::as_str).into(),
            ));
        }
        let mut changed = 0;
        if !values.is_empty() {
            set_attributes(self.source, &self.repo, eid, &values)?;
            changed += 1;
        }
        if let Some(rtype) = self.repo.relation_mut(name) {
            rtype.description.clone_from(&desired.description);
            rtype.symmetric = desired.symmetric;
            rtype.fulltext_container = desired.fulltext_container;
        }
        if desired.inlined != current.inlined && !current.is_final {
            self.change_inlined(name, desired.inlined)?;
            set_attributes(self.source, &self.repo, eid, &[("inlined", desired.inlined.into())])?;
            changed += 1;
        }
        Ok(changed)
    }

    /// Move the values of `name` between its join table and the subject
    /// table columns.
    fn change_inlined(&mut self, name: &str, inlined: bool) -> Result<()> {
        let rtype = self
            .repo
            .relation(name)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownRelationType(name.to_string()))?;
        let subjects: Vec<String> = rtype.subjects().into_iter().map(str::to_string).collect();
        let column = rtype.column();
        if inlined {
            if rtype.rdefs.values().any(|d| !d.cardinality.subject.is_single()) {
                return Err(SchemaError::Invalid {
                    element: name.to_string(),
                    message: "inlined relations need a single subject cardinality".into(),
                }
                .into());
            }
            if let Some(r) = self.repo.relation_mut(name) {
                r.inlined = true;
            }
            let has_rows = self.source.has_table(&rtype.table())?;
            for subject in &subjects {
                let table = entity_table(subject);
                self.rebuild_table(subject)?;
                if has_rows {
                    self.source.execute(
                        &format!(
                            "UPDATE {table} SET {column} = (SELECT MIN(r.eid_to) FROM {rel} AS r \
                             WHERE r.eid_from = {table}.{SQL_PREFIX}eid)",
                            rel = rtype.table()
                        ),
                        &[],
                    )?;
                }
            }
            self.drop_join_table(name)?;
        } else {
            self.create_join_table(name)?;
            for subject in &subjects {
                self.source.execute(
                    &format!(
                        "INSERT INTO {name}_relation (eid_from, eid_to) \
                         SELECT {SQL_PREFIX}eid, {column} FROM {} WHERE {column} IS NOT NULL",
                        entity_table(subject)
                    ),
                    &[],
                )?;
            }
            if let Some(r) = self.repo.relation_mut(name) {
                r.inlined = false;
            }
            for subject in &subjects {
                self.rebuild_table(subject)?;
            }
        }
        info!(rtype = name, inlined, "Relation storage changed");
        Ok(())
    }

    fn sync_rdef(&mut self, desired: &RelationDefinition, rebuild: &mut BTreeSet<String>) -> Result<usize> {
        let Some(current) = self.repo.rdef(&desired.subject, &desired.rtype, &desired.object).cloned() else {
            return Ok(0);
        };
        let (eid, _) = rdef_eid(self.source, &desired.subject, &desired.rtype, &desired.object)?
            .ok_or_else(|| corrupted(&desired.to_string()))?;
        let mut values: Vec<(&str, SqlValue)> = Vec::new();
        if desired.cardinality != current.cardinality {
            values.push(("cardinality", desired.cardinality.to_string().into()));
        }
        if desired.description != current.description {
            values.push(("description", desired.description.as_str().into()));
        }
        if desired.order != current.order {
            values.push(("ordernum", i64::from(desired.order).into()));
        }
        if desired.is_attribute() {
            if desired.indexed != current.indexed {
                values.push(("indexed", desired.indexed.into()));
            }
            if desired.fulltextindexed != current.fulltextindexed {
                values.push(("fulltextindexed", desired.fulltextindexed.into()));
            }
            if desired.internationalizable != current.internationalizable {
                values.push(("internationalizable", desired.internationalizable.into()));
            }
            if desired.default != current.default {
                values.push(("defaultval", desired.default.as_ref().map(literal_json).transpose()?.into()));
            }
        }
        let mut changed = 0;
        if !values.is_empty() {
            set_attributes(self.source, &self.repo, eid, &values)?;
            changed += 1;
        }
        if constraint_keys(&desired.constraints) != constraint_keys(&current.constraints) {
            let owned = self.source.query_column(
                "SELECT eid_to FROM constrained_by_relation WHERE eid_from = ?",
                &[eid.into()],
            )?;
            for cstr in owned.iter().filter_map(SqlValue::as_i64) {
                delete_entity(self.source, &self.repo, cstr)?;
            }
            for constraint in &desired.constraints {
                serialize_constraint(self.source, &self.repo, eid, constraint)?;
            }
            changed += 1;
        }
        changed += self.sync_permissions(eid, &current.permissions, &desired.permissions, rdef_actions(desired))?;

        if desired.is_attribute() {
            let dialect = self.source.dialect();
            let physical = |d: &RelationDefinition| {
                let checks: Vec<(String, String)> = d
                    .constraints
                    .iter()
                    .filter_map(|c| check_constraint(dialect, d, c, SQL_PREFIX))
                    .collect();
                (column_sql(dialect, d, true), d.indexed, d.is_unique(), checks)
            };
            if physical(desired) != physical(&current) {
                rebuild.insert(desired.subject.clone());
            }
        }
        if let Some(slot) = self.repo.rdef_mut(&desired.subject, &desired.rtype, &desired.object) {
            *slot = desired.clone();
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::schema::bootstrap::bootstrap_schema;
    use crate::schema::loader::load_schema_str;
    use crate::schema::{PermissionRule, Primitive};
    use crate::store::entities::{create_entity, entity_type, relate};
    use crate::store::serialize::{permission_rules, serialize_schema};
    use crate::store::{SqliteSource, init_repository};

    const V1: &str = r#"
[entity.Person]
description = "a person"

[[entity.Person.attribute]]
name = "name"
type = "String"
required = true
maxsize = 64

[entity.Company]

[[entity.Company.attribute]]
name = "label"
type = "String"

[relation.works_for]
subject = "Person"
object = "Company"
cardinality = "?*"
"#;

    fn schema(text: &str) -> Schema {
        let mut schema = bootstrap_schema().unwrap();
        load_schema_str(&mut schema, text, Path::new("schema.toml")).unwrap();
        schema
    }

    fn installed(text: &str) -> SqliteSource {
        let schema = schema(text);
        let source = SqliteSource::in_memory().unwrap();
        init_repository(&source, &schema).unwrap();
        serialize_schema(&source, &schema).unwrap();
        source
    }

    fn count(source: &SqliteSource, sql: &str) -> i64 {
        source.query_i64(sql, &[]).unwrap().unwrap_or(0)
    }

    #[test]
    fn adding_an_entity_type_twice_changes_nothing_the_second_time() {
        let source = installed(V1);
        let fs = schema(&format!(
            "{V1}\n[entity.Project]\n\n[[entity.Project.attribute]]\nname = \"title\"\ntype = \"String\"\n\n\
             [relation.leads]\nsubject = \"Person\"\nobject = \"Project\"\n"
        ));
        let mut sync = SchemaSync::new(&source, &fs).unwrap();
        assert!(sync.add_entity_type("Project").unwrap());
        assert!(!sync.add_entity_type("Project").unwrap());

        assert!(source.has_table("cw_Project").unwrap());
        assert!(source.has_table("leads_relation").unwrap());
        assert_eq!(count(&source, "SELECT COUNT(*) FROM cw_CWEType WHERE cw_name = 'Project'"), 1);
        let reread = deserialize_schema(&source).unwrap();
        assert!(reread.rdef("Project", "title", "String").is_some());
        assert!(reread.rdef("Person", "leads", "Project").is_some());
        assert!(reread.rdef("Project", "creation_date", "TZDatetime").is_some());
    }

    #[test]
    fn added_attribute_takes_its_default_on_existing_rows() {
        let source = installed(V1);
        let v1 = schema(V1);
        let eid = create_entity(&source, &v1, "Person", &[("name", "ada".into())]).unwrap();
        let fs = schema(&format!(
            "{V1}\n[[entity.Person.attribute]]\nname = \"age\"\ntype = \"Int\"\ndefault = 18\n"
        ));
        let mut sync = SchemaSync::new(&source, &fs).unwrap();
        assert!(sync.add_attribute("Person", "age").unwrap());
        let age = source
            .query_i64("SELECT cw_age FROM cw_Person WHERE cw_eid = ?", &[eid.into()])
            .unwrap();
        assert_eq!(age, Some(18));
        let name = source
            .query_one("SELECT cw_name FROM cw_Person WHERE cw_eid = ?", &[eid.into()])
            .unwrap()
            .unwrap();
        assert_eq!(name[0].as_str(), Some("ada"));
    }

    #[test]
    fn dropping_an_attribute_removes_column_and_definition() {
        let source = installed(V1);
        let fs = schema(V1);
        let mut sync = SchemaSync::new(&source, &fs).unwrap();
        assert!(sync.drop_attribute("Company", "label").unwrap());
        assert!(!sync.drop_attribute("Company", "label").unwrap());
        let columns = source.table_columns("cw_Company").unwrap();
        assert!(!columns.contains(&"cw_label".to_string()));
        let reread = deserialize_schema(&source).unwrap();
        assert!(reread.attribute("Company", "label").is_none());
        assert!(!reread.has_relation("label"));
    }

    #[test]
    fn renaming_an_entity_type_keeps_its_entities() {
        let source = installed(V1);
        let v1 = schema(V1);
        let eid = create_entity(&source, &v1, "Company", &[("label", "acme".into())]).unwrap();
        let fs = schema(&V1.replace("Company", "Organization"));
        let mut sync = SchemaSync::new(&source, &fs).unwrap();
        assert!(sync.rename_entity_type("Company", "Organization").unwrap());
        assert!(!sync.rename_entity_type("Company", "Organization").unwrap());

        assert_eq!(entity_type(&source, eid).unwrap().as_deref(), Some("Organization"));
        assert!(source.has_table("cw_Organization").unwrap());
        assert!(!source.has_table("cw_Company").unwrap());
        let reread = deserialize_schema(&source).unwrap();
        assert!(reread.rdef("Person", "works_for", "Organization").is_some());
    }

    #[test]
    fn dropping_an_entity_type_removes_its_entities_and_orphan_relations() {
        let source = installed(V1);
        let v1 = schema(V1);
        let person = create_entity(&source, &v1, "Person", &[("name", "bob".into())]).unwrap();
        let company = create_entity(&source, &v1, "Company", &[]).unwrap();
        relate(&source, &v1, person, "works_for", company).unwrap();
        let mut sync = SchemaSync::new(&source, &v1).unwrap();
        assert!(sync.drop_entity_type("Company").unwrap());

        assert!(!source.has_table("cw_Company").unwrap());
        assert!(!source.has_table("works_for_relation").unwrap());
        assert_eq!(entity_type(&source, company).unwrap(), None);
        let reread = deserialize_schema(&source).unwrap();
        assert!(!reread.has_entity("Company"));
        assert!(!reread.has_relation("works_for"));
        assert!(sync.drop_entity_type("CWGroup").is_err());
    }

    #[test]
    fn sync_applies_property_constraint_and_permission_changes() {
        let source = installed(V1);
        let changed = V1
            .replace("description = \"a person\"", "description = \"a human\"\npermissions = { read = [\"managers\"], add = [\"managers\"], update = [\"managers\"], delete = [\"managers\"] }")
            .replace("maxsize = 64", "maxsize = 128");
        let fs = schema(&changed);
        let mut sync = SchemaSync::new(&source, &fs).unwrap();
        assert!(sync.sync_schema_props_perms(Some("Person")).unwrap() > 0);

        let reread = deserialize_schema(&source).unwrap();
        let person = reread.entity("Person").unwrap();
        assert_eq!(person.description, "a human");
        assert_eq!(reread.rdef("Person", "name", "String").unwrap().max_size(), Some(128));
        let eid = eschema_eid(&source, "Person").unwrap().unwrap();
        let read = permission_rules(&source, eid, PermissionAction::Read).unwrap();
        assert_eq!(read.into_iter().collect::<Vec<_>>(), vec![PermissionRule::group("managers")]);

        // A second run has nothing left to do.
        assert_eq!(sync.sync_schema_props_perms(Some("Person")).unwrap(), 0);
    }

    #[test]
    fn inlining_moves_links_into_the_subject_table() {
        let source = installed(V1);
        let v1 = schema(V1);
        let person = create_entity(&source, &v1, "Person", &[("name", "eve".into())]).unwrap();
        let company = create_entity(&source, &v1, "Company", &[]).unwrap();
        relate(&source, &v1, person, "works_for", company).unwrap();
        let fs = schema(&V1.replace("cardinality = \"?*\"", "cardinality = \"?*\"\ninlined = true"));
        let mut sync = SchemaSync::new(&source, &fs).unwrap();
        sync.sync_schema_props_perms(Some("works_for")).unwrap();

        assert!(!source.has_table("works_for_relation").unwrap());
        let value = source
            .query_i64("SELECT cw_works_for FROM cw_Person WHERE cw_eid = ?", &[person.into()])
            .unwrap();
        assert_eq!(value, Some(company));
        let reread = deserialize_schema(&source).unwrap();
        assert!(reread.relation("works_for").unwrap().inlined);
    }

    #[test]
    fn renaming_an_attribute_copies_values() {
        let source = installed(V1);
        let v1 = schema(V1);
        let eid = create_entity(&source, &v1, "Company", &[("label", "acme".into())]).unwrap();
        let fs = schema(&V1.replace("name = \"label\"", "name = \"title\""));
        let mut sync = SchemaSync::new(&source, &fs).unwrap();
        assert!(sync.rename_attribute("Company", "label", "title").unwrap());
        let row = source
            .query_one("SELECT cw_title FROM cw_Company WHERE cw_eid = ?", &[eid.into()])
            .unwrap()
            .unwrap();
        assert_eq!(row[0].as_str(), Some("acme"));
        assert!(sync.repo().attribute("Company", "label").is_none());
        assert_eq!(sync.repo().attribute("Company", "title").unwrap().primitive(), Some(Primitive::String));
    }
}
