//! Consistency checks on the physical tables of a repository.
//!
//! Every check reads the tables directly. Violations are collected as
//! report lines; with `fix` set each one is repaired right away and the
//! repair is named in its message before it happens.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use tracing::{debug, info};

use crate::error::{ConfigError, Result};
use crate::fti;
use crate::progress::ProgressReporter;
use crate::schema::constraints::SINGLE_INSTANCE_KINDS;
use crate::schema::{RelationDefinition, Role, SQL_PREFIX, Schema};
use crate::sql::expected_indexes;
use crate::store::entities::{add_metadata_relations, delete_entity, now};
use crate::store::serialize::rdef_eid;
use crate::store::{SqlValue, SystemSource};

/// Attributes maintained by the metadata check rather than the mandatory
/// attribute check.
const DATE_ATTRIBUTES: [&str; 2] = ["creation_date", "modification_date"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Check {
    Entities,
    Relations,
    MandatoryRelations,
    MandatoryAttributes,
    Metadata,
    Schema,
    TextIndex,
}

impl Check {
    /// Every check, in execution order.
    pub const ALL: [Self; 7] = [
        Self::Entities,
        Self::Relations,
        Self::MandatoryRelations,
        Self::MandatoryAttributes,
        Self::Metadata,
        Self::Schema,
        Self::TextIndex,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entities => "entities",
            Self::Relations => "relations",
            Self::MandatoryRelations => "mandatory_relations",
            Self::MandatoryAttributes => "mandatory_attributes",
            Self::Metadata => "metadata",
            Self::Schema => "schema",
            Self::TextIndex => "text_index",
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Check {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|c| c.as_str()).collect();
                ConfigError::Invalid(format!("unknown check {s:?}, expected one of {}", known.join(", ")))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub check: Check,
    pub message: String,
    /// Whether the repair announced in `message` was applied.
    pub fixed: bool,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if self.fixed {
            f.write_str(" [FIXED]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    /// Checks in the order they ran.
    pub checks: Vec<Check>,
    pub violations: Vec<Violation>,
    pub notes: Vec<String>,
}

impl IntegrityReport {
    pub fn count(&self, check: Check) -> usize {
        self.violations.iter().filter(|v| v.check == check).count()
    }

    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable report, one section per check.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for check in &self.checks {
            out.push_str(&format!("Checking {check}...\n"));
            for violation in self.violations.iter().filter(|v| v.check == *check) {
                out.push_str(&format!("  {violation}\n"));
            }
            out.push_str(&format!("  {} violation(s)\n", self.count(*check)));
        }
        for note in &self.notes {
            out.push_str(note);
            out.push('\n');
        }
        out
    }
}

struct Checker<'a> {
    source: &'a dyn SystemSource,
    schema: &'a Schema,
    fix: bool,
    tables: BTreeSet<String>,
    violations: Vec<Violation>,
}

impl<'a> Checker<'a> {
    /// Record a violation; returns whether it must be repaired now.
    fn flag(&mut self, check: Check, message: String) -> bool {
        debug!(%check, message, "Integrity violation");
        self.violations.push(Violation {
            check,
            message,
            fixed: self.fix,
        });
        self.fix
    }

    fn eids(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<i64>> {
        Ok(self
            .source
            .query_column(sql, params)?
            .iter()
            .filter_map(SqlValue::as_i64)
            .collect())
    }

    fn entity_table(&self, etype: &str) -> Option<String> {
        let table = format!("{SQL_PREFIX}{etype}");
        self.tables.contains(&table).then_some(table)
    }

    fn run(&mut self, check: Check, progress: &dyn ProgressReporter) -> Result<()> {
        match check {
            Check::Entities => self.check_entities(progress),
            Check::Relations => self.check_relations(progress),
            Check::MandatoryRelations => self.check_mandatory_relations(progress),
            Check::MandatoryAttributes => self.check_mandatory_attributes(progress),
            Check::Metadata => self.check_metadata(progress),
            Check::Schema => self.check_schema(),
            Check::TextIndex => self.check_text_index(),
        }
    }

    // ── Entities ──────────────────────────────────────────────────

    fn check_entities(&mut self, progress: &dyn ProgressReporter) -> Result<()> {
        let source = self.source;
        let schema = self.schema;

        let rows = source.query("SELECT eid, type FROM entities ORDER BY eid", &[])?;
        for row in rows {
            let (Some(eid), Some(etype)) = (
                row.first().and_then(SqlValue::as_i64),
                row.get(1).and_then(SqlValue::as_str),
            ) else {
                continue;
            };
            if schema.entity(etype).is_none_or(|e| e.is_final) {
                let message = format!(
                    "Entity {eid} has unknown type {etype}, autofix will delete the entity"
                );
                if self.flag(Check::Entities, message) {
                    delete_entity(source, schema, eid)?;
                }
            }
        }

        let etypes: Vec<String> = schema.user_entity_types().map(|e| e.name.clone()).collect();
        progress.start("Checking entities", Some(etypes.len() as u64));
        for etype in &etypes {
            progress.advance(1);
            let Some(table) = self.entity_table(etype) else {
                continue;
            };
            let unregistered = self.eids(
                &format!(
                    "SELECT {SQL_PREFIX}eid FROM {table} WHERE NOT EXISTS \
                     (SELECT 1 FROM entities WHERE eid = {SQL_PREFIX}eid) ORDER BY {SQL_PREFIX}eid"
                ),
                &[],
            )?;
            for eid in unregistered {
                let message = format!(
                    "Entity {eid} of type {etype} is missing from the entities table, autofix will delete the entity"
                );
                if self.flag(Check::Entities, message) {
                    source.execute(
                        &format!("DELETE FROM {table} WHERE {SQL_PREFIX}eid = ?"),
                        &[eid.into()],
                    )?;
                }
            }
            let rowless = self.eids(
                &format!(
                    "SELECT eid FROM entities WHERE type = ? AND NOT EXISTS \
                     (SELECT 1 FROM {table} WHERE {SQL_PREFIX}eid = eid) ORDER BY eid"
                ),
                &[etype.as_str().into()],
            )?;
            for eid in rowless {
                let message = format!(
                    "Entity {eid} of type {etype} has no row in {table}, autofix will delete the entity"
                );
                if self.flag(Check::Entities, message) {
                    delete_entity(source, schema, eid)?;
                }
            }
        }
        progress.finish();

        for rtype in ["is", "is_instance_of", "cw_source"] {
            let table = format!("{rtype}_relation");
            if !self.tables.contains(&table) {
                continue;
            }
            let missing = self.eids(
                &format!(
                    "SELECT eid FROM entities WHERE NOT EXISTS \
                     (SELECT 1 FROM {table} WHERE eid_from = eid) ORDER BY eid"
                ),
                &[],
            )?;
            for eid in missing {
                let message = format!("Entity {eid} has no {rtype} relation, autofix will add it");
                if self.flag(Check::Entities, message) {
                    add_metadata_relations(source, Some(eid))?;
                }
            }
        }
        Ok(())
    }

    // ── Relations ─────────────────────────────────────────────────

    fn check_relations(&mut self, progress: &dyn ProgressReporter) -> Result<()> {
        let source = self.source;
        let schema = self.schema;
        let rtypes: Vec<_> = schema
            .relation_types()
            .filter(|r| !r.is_final && r.rule.is_none())
            .collect();
        progress.start("Checking relations", Some(rtypes.len() as u64));
        for rtype in rtypes {
            progress.advance(1);
            if rtype.inlined {
                for subject in rtype.subjects() {
                    let Some(table) = self.entity_table(subject) else {
                        continue;
                    };
                    let column = rtype.column();
                    let rows = source.query(
                        &format!(
                            "SELECT {SQL_PREFIX}eid, {column} FROM {table} WHERE {column} IS NOT NULL \
                             AND NOT EXISTS (SELECT 1 FROM entities WHERE eid = {column}) \
                             ORDER BY {SQL_PREFIX}eid"
                        ),
                        &[],
                    )?;
                    for row in rows {
                        let (Some(eid), Some(target)) = (
                            row.first().and_then(SqlValue::as_i64),
                            row.get(1).and_then(SqlValue::as_i64),
                        ) else {
                            continue;
                        };
                        let message = format!(
                            "Entity {eid} has a {} relation to missing entity {target}, autofix will remove it",
                            rtype.name
                        );
                        if self.flag(Check::Relations, message) {
                            source.execute(
                                &format!("UPDATE {table} SET {column} = NULL WHERE {SQL_PREFIX}eid = ?"),
                                &[eid.into()],
                            )?;
                        }
                    }
                }
                continue;
            }
            let table = rtype.table();
            if !self.tables.contains(&table) {
                continue;
            }
            let rows = source.query(
                &format!(
                    "SELECT eid_from, eid_to FROM {table} AS r WHERE \
                     NOT EXISTS (SELECT 1 FROM entities WHERE eid = r.eid_from) \
                     OR NOT EXISTS (SELECT 1 FROM entities WHERE eid = r.eid_to) \
                     ORDER BY eid_from, eid_to"
                ),
                &[],
            )?;
            for row in rows {
                let (Some(from), Some(to)) = (
                    row.first().and_then(SqlValue::as_i64),
                    row.get(1).and_then(SqlValue::as_i64),
                ) else {
                    continue;
                };
                let message = format!(
                    "Relation {} from {from} to {to} references a missing entity, autofix will delete the relation",
                    rtype.name
                );
                if self.flag(Check::Relations, message) {
                    source.execute(
                        &format!("DELETE FROM {table} WHERE eid_from = ? AND eid_to = ?"),
                        &[from.into(), to.into()],
                    )?;
                }
            }
        }
        progress.finish();
        Ok(())
    }

    // ── Mandatory values ──────────────────────────────────────────

    /// Entities of `etype` on the `role` side of no `rtype` link at all.
    fn unlinked(&self, rtype: &str, etype: &str, role: Role) -> Result<Vec<i64>> {
        let Some(table) = self.entity_table(etype) else {
            return Ok(Vec::new());
        };
        let Some(relation) = self.schema.relation(rtype) else {
            return Ok(Vec::new());
        };
        let column = relation.column();
        let condition = match (relation.inlined, role) {
            (true, Role::Subject) => format!("t.{column} IS NULL"),
            (true, Role::Object) => {
                let subqueries: Vec<String> = relation
                    .subjects()
                    .into_iter()
                    .filter_map(|s| self.entity_table(s))
                    .map(|other| {
                        format!("NOT EXISTS (SELECT 1 FROM {other} AS o WHERE o.{column} = t.{SQL_PREFIX}eid)")
                    })
                    .collect();
                if subqueries.is_empty() {
                    "1 = 1".to_string()
                } else {
                    subqueries.join(" AND ")
                }
            }
            (false, role) => {
                let mine = match role {
                    Role::Subject => "eid_from",
                    Role::Object => "eid_to",
                };
                format!(
                    "NOT EXISTS (SELECT 1 FROM {} AS r WHERE r.{mine} = t.{SQL_PREFIX}eid)",
                    relation.table()
                )
            }
        };
        self.eids(
            &format!("SELECT t.{SQL_PREFIX}eid FROM {table} AS t WHERE {condition} ORDER BY t.{SQL_PREFIX}eid"),
            &[],
        )
    }

    fn check_mandatory_relations(&mut self, progress: &dyn ProgressReporter) -> Result<()> {
        let source = self.source;
        let schema = self.schema;
        // (relation type, entity type, side) with a mandatory cardinality
        let mut required: BTreeSet<(&str, &str, Role)> = BTreeSet::new();
        for rdef in schema.rdefs() {
            if rdef.is_attribute() || schema.is_meta_relation(&rdef.rtype) {
                continue;
            }
            let stored = schema
                .relation(&rdef.rtype)
                .is_some_and(|r| r.inlined || self.tables.contains(&r.table()));
            if !stored {
                continue;
            }
            if rdef.cardinality.subject.is_mandatory() {
                required.insert((&rdef.rtype, &rdef.subject, Role::Subject));
            }
            if rdef.cardinality.object.is_mandatory() {
                required.insert((&rdef.rtype, &rdef.object, Role::Object));
            }
        }
        progress.start("Checking mandatory relations", Some(required.len() as u64));
        for (rtype, etype, role) in required {
            progress.advance(1);
            for eid in self.unlinked(rtype, etype, role)? {
                let message = format!(
                    "Entity {eid} of type {etype} is {} of no {rtype} relation although it is mandatory, \
                     autofix will delete the entity",
                    role.as_str()
                );
                if self.flag(Check::MandatoryRelations, message) {
                    delete_entity(source, schema, eid)?;
                }
            }
        }
        progress.finish();
        Ok(())
    }

    fn check_mandatory_attributes(&mut self, progress: &dyn ProgressReporter) -> Result<()> {
        let source = self.source;
        let schema = self.schema;
        let rdefs: Vec<&RelationDefinition> = schema
            .rdefs()
            .filter(|d| d.is_attribute() && !d.uid && !schema.is_meta_relation(&d.rtype))
            .filter(|d| d.cardinality.subject.is_mandatory())
            .collect();
        progress.start("Checking mandatory attributes", Some(rdefs.len() as u64));
        for rdef in rdefs {
            progress.advance(1);
            let Some(table) = self.entity_table(&rdef.subject) else {
                continue;
            };
            let missing = self.eids(
                &format!(
                    "SELECT {SQL_PREFIX}eid FROM {table} WHERE {} IS NULL ORDER BY {SQL_PREFIX}eid",
                    rdef.column()
                ),
                &[],
            )?;
            for eid in missing {
                let message = format!(
                    "Entity {eid} of type {} has no value for mandatory attribute {}, \
                     autofix will delete the entity",
                    rdef.subject, rdef.rtype
                );
                if self.flag(Check::MandatoryAttributes, message) {
                    delete_entity(source, schema, eid)?;
                }
            }
        }
        progress.finish();
        Ok(())
    }

    fn check_metadata(&mut self, progress: &dyn ProgressReporter) -> Result<()> {
        let source = self.source;
        let etypes: Vec<String> = self.schema.user_entity_types().map(|e| e.name.clone()).collect();
        progress.start("Checking metadata", Some(etypes.len() as u64));
        for etype in &etypes {
            progress.advance(1);
            let Some(table) = self.entity_table(etype) else {
                continue;
            };
            for attribute in DATE_ATTRIBUTES {
                if self.schema.attribute(etype, attribute).is_none() {
                    continue;
                }
                let column = format!("{SQL_PREFIX}{attribute}");
                let missing = self.eids(
                    &format!("SELECT {SQL_PREFIX}eid FROM {table} WHERE {column} IS NULL ORDER BY {SQL_PREFIX}eid"),
                    &[],
                )?;
                for eid in missing {
                    let message = format!(
                        "Entity {eid} of type {etype} has no {attribute}, autofix will set it to now"
                    );
                    if self.flag(Check::Metadata, message) {
                        source.execute(
                            &format!("UPDATE {table} SET {column} = ? WHERE {SQL_PREFIX}eid = ?"),
                            &[now().into(), eid.into()],
                        )?;
                    }
                }
            }
        }
        progress.finish();
        Ok(())
    }

    // ── Persisted schema ──────────────────────────────────────────

    /// `subject rtype object` label of a persisted definition.
    fn rdef_label(&self, eid: i64) -> Result<String> {
        for mirror in ["CWAttribute", "CWRelation"] {
            let row = self.source.query_one(
                &format!(
                    "SELECT s.cw_name, r.cw_name, o.cw_name FROM cw_{mirror} AS d \
                     JOIN cw_CWEType AS s ON d.cw_from_entity = s.cw_eid \
                     JOIN cw_CWRType AS r ON d.cw_relation_type = r.cw_eid \
                     JOIN cw_CWEType AS o ON d.cw_to_entity = o.cw_eid \
                     WHERE d.cw_eid = ?"
                ),
                &[eid.into()],
            )?;
            if let Some(row) = row {
                let names: Vec<&str> = row.iter().filter_map(SqlValue::as_str).collect();
                return Ok(names.join(" "));
            }
        }
        Ok(format!("#{eid}"))
    }

    /// Report only: no repair is known for a corrupted mirror.
    fn check_schema(&mut self) -> Result<()> {
        let required = ["cw_CWConstraint", "constrained_by_relation", "cw_CWAttribute", "cw_CWRelation"];
        if !required.iter().all(|t| self.tables.contains(*t)) {
            return Ok(());
        }
        let rows = self.source.query(
            "SELECT c.eid_from, k.cw_cstrtype, COUNT(*) FROM constrained_by_relation AS c \
             JOIN cw_CWConstraint AS k ON k.cw_eid = c.eid_to \
             GROUP BY c.eid_from, k.cw_cstrtype HAVING COUNT(*) > 1 ORDER BY c.eid_from",
            &[],
        )?;
        let mut counts: BTreeMap<(i64, String), i64> = BTreeMap::new();
        for row in rows {
            if let (Some(eid), Some(kind), Some(count)) = (
                row.first().and_then(SqlValue::as_i64),
                row.get(1).and_then(SqlValue::as_str),
                row.get(2).and_then(SqlValue::as_i64),
            ) {
                counts.insert((eid, kind.to_string()), count);
            }
        }
        for ((eid, kind), count) in counts {
            if kind == "UniqueConstraint" || SINGLE_INSTANCE_KINDS.contains(&kind.as_str()) {
                let label = self.rdef_label(eid)?;
                self.violations.push(Violation {
                    check: Check::Schema,
                    message: format!("The relation {label} has {count} constraints of type {kind}"),
                    fixed: false,
                });
            }
        }

        let schema = self.schema;
        for rdef in schema.rdefs() {
            let Some((eid, _)) = rdef_eid(self.source, &rdef.subject, &rdef.rtype, &rdef.object)? else {
                continue;
            };
            let persisted = self
                .source
                .query_i64(
                    "SELECT COUNT(*) FROM constrained_by_relation AS c \
                     JOIN cw_CWConstraint AS k ON k.cw_eid = c.eid_to \
                     WHERE c.eid_from = ? AND k.cw_cstrtype = 'UniqueConstraint'",
                    &[eid.into()],
                )?
                .unwrap_or(0);
            let message = match (rdef.is_unique(), persisted) {
                (true, 0) => format!("The relation {rdef} is unique but has no persisted UniqueConstraint"),
                (false, n) if n > 0 => format!("The relation {rdef} has a UniqueConstraint it does not declare"),
                _ => continue,
            };
            self.violations.push(Violation {
                check: Check::Schema,
                message,
                fixed: false,
            });
        }
        Ok(())
    }

    fn check_text_index(&mut self) -> Result<()> {
        if !self.tables.contains("appears") {
            return Ok(());
        }
        let dangling = self.eids(
            "SELECT uid FROM appears WHERE NOT EXISTS \
             (SELECT 1 FROM entities WHERE eid = uid) ORDER BY uid",
            &[],
        )?;
        for eid in dangling {
            let message = format!(
                "Text index entry for missing entity {eid}, autofix will delete the entry"
            );
            if self.flag(Check::TextIndex, message) {
                self.source
                    .execute("DELETE FROM appears WHERE uid = ?", &[eid.into()])?;
            }
        }
        Ok(())
    }
}

/// Run `checks` (all of them when empty). With `fix`, repairs are
/// committed; otherwise every change is rolled back. With `reindex`, the
/// full-text index is rebuilt afterwards.
pub fn check(
    source: &dyn SystemSource,
    schema: &Schema,
    checks: &[Check],
    fix: bool,
    reindex: bool,
    progress: &dyn ProgressReporter,
) -> Result<IntegrityReport> {
    let mut selected: Vec<Check> = if checks.is_empty() {
        Check::ALL.to_vec()
    } else {
        checks.to_vec()
    };
    selected.sort();
    selected.dedup();

    let own_transaction = !source.in_transaction();
    if own_transaction {
        source.begin()?;
    }
    let mut checker = Checker {
        source,
        schema,
        fix,
        tables: source.table_names()?,
        violations: Vec::new(),
    };
    let outcome = (|| -> Result<Vec<String>> {
        for check in &selected {
            checker.run(*check, progress)?;
        }
        let mut notes = Vec::new();
        if reindex {
            let count = fti::reindex_entities(source, schema, None, progress)?;
            notes.push(format!("{count} entities reindexed"));
        }
        Ok(notes)
    })();

    let mut notes = match outcome {
        Ok(notes) => notes,
        Err(e) => {
            if own_transaction {
                source.rollback()?;
            }
            return Err(e);
        }
    };
    if own_transaction {
        if fix || reindex {
            source.commit()?;
        } else {
            source.rollback()?;
        }
    }
    if !fix {
        notes.push("WARNING: Diagnostic run, nothing has been corrected".to_string());
    }
    let report = IntegrityReport {
        checks: selected,
        violations: checker.violations,
        notes,
    };
    info!(violations = report.violations.len(), fix, "Integrity check finished");
    Ok(report)
}

/// Difference between the indexes the schema implies and those found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub missing: BTreeSet<String>,
    pub additional: BTreeSet<String>,
}

impl IndexReport {
    /// Process status: `0` when both sets are empty, `1` otherwise.
    pub fn status(&self) -> i32 {
        i32::from(!(self.missing.is_empty() && self.additional.is_empty()))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (title, names) in [("Missing indexes", &self.missing), ("Unexpected indexes", &self.additional)] {
            if names.is_empty() {
                continue;
            }
            out.push_str(title);
            out.push_str(":\n");
            for name in names {
                out.push_str(&format!("  {name}\n"));
            }
        }
        if out.is_empty() {
            out.push_str("Indexes are in sync with the schema\n");
        }
        out
    }
}

pub fn check_indexes(source: &dyn SystemSource, schema: &Schema) -> Result<IndexReport> {
    let expected: BTreeSet<String> = expected_indexes(source.dialect(), schema, SQL_PREFIX)
        .into_keys()
        .collect();
    let mut actual = BTreeSet::new();
    for table in source.table_names()? {
        actual.extend(source.index_names(&table)?);
    }
    Ok(IndexReport {
        missing: expected.difference(&actual).cloned().collect(),
        additional: actual.difference(&expected).cloned().collect(),
    })
}
