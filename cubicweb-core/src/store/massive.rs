// Bulk loader. Rows are staged in memory and written in chunks with the
// indexes of every touched table dropped; `finish` restores them and adds
// the metadata relations. Single writer: nothing else may use the tables
// until `finish` returns.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, info};

use crate::error::{Result, SchemaError};
use crate::schema::{SQL_PREFIX, Schema};

use super::entities::{add_metadata_relations, entity_row, insert_row_sql, next_eid, register_entity};
use super::{SqlValue, SystemSource};

/// Rows written per transaction.
const CHUNK_SIZE: usize = 1000;

pub struct MassiveStore<'a> {
    source: &'a dyn SystemSource,
    schema: &'a Schema,
    entities: Vec<(String, i64, BTreeMap<String, SqlValue>)>,
    /// Join table rows by relation type.
    relations: BTreeMap<String, Vec<(i64, i64)>>,
    /// Inlined relation values by relation type.
    inlined: BTreeMap<String, Vec<(i64, i64)>>,
    /// Index statements of every table whose indexes were dropped.
    dropped: BTreeMap<String, Vec<String>>,
    inserted: usize,
}

impl fmt::Debug for MassiveStore<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MassiveStore")
            .field("staged_entities", &self.entities.len())
            .field("dropped", &self.dropped.keys())
            .field("inserted", &self.inserted)
            .finish_non_exhaustive()
    }
}

impl<'a> MassiveStore<'a> {
    pub fn new(source: &'a dyn SystemSource, schema: &'a Schema) -> Self {
        Self {
            source,
            schema,
            entities: Vec::new(),
            relations: BTreeMap::new(),
            inlined: BTreeMap::new(),
            dropped: BTreeMap::new(),
            inserted: 0,
        }
    }

    /// Stage an entity and return its identifier.
    pub fn prepare_insert_entity(&mut self, etype: &str, values: &[(&str, SqlValue)]) -> Result<i64> {
        entity_row(self.schema, etype, 0, values)?;
        let eid = next_eid(self.source)?;
        let row = entity_row(self.schema, etype, eid, values)?;
        self.entities.push((etype.to_string(), eid, row));
        if self.entities.len() >= CHUNK_SIZE {
            self.flush()?;
        }
        Ok(eid)
    }

    /// Stage a link between two entities, staged or not.
    pub fn prepare_insert_relation(&mut self, subject: i64, rtype: &str, object: i64) -> Result<()> {
        let relation = self
            .schema
            .relation(rtype)
            .ok_or_else(|| SchemaError::UnknownRelationType(rtype.to_string()))?;
        if relation.inlined {
            self.inlined
                .entry(rtype.to_string())
                .or_default()
                .push((subject, object));
        } else if relation.has_table() {
            let rows = self.relations.entry(rtype.to_string()).or_default();
            rows.push((subject, object));
            if relation.symmetric && subject != object {
                rows.push((object, subject));
            }
        } else {
            return Err(SchemaError::Invalid {
                element: rtype.to_string(),
                message: "relation is not stored".into(),
            }
            .into());
        }
        Ok(())
    }

    fn drop_indexes(&mut self, table: &str) -> Result<()> {
        if self.dropped.contains_key(table) {
            return Ok(());
        }
        let mut saved = Vec::new();
        for (name, sql) in self.source.index_definitions(table)? {
            let Some(sql) = sql else { continue };
            if self.source.dialect().is_primary_key_index(&name, Some(&sql)) {
                continue;
            }
            self.source.execute(&format!("DROP INDEX {name}"), &[])?;
            saved.push(sql);
        }
        debug!(table, count = saved.len(), "Indexes dropped for bulk load");
        self.dropped.insert(table.to_string(), saved);
        Ok(())
    }

    /// Write every staged row.
    pub fn flush(&mut self) -> Result<()> {
        let own_transaction = !self.source.in_transaction();
        if own_transaction {
            self.source.begin()?;
        }
        let outcome = self.write_staged();
        match (&outcome, own_transaction) {
            (Ok(()), true) => self.source.commit()?,
            (Err(_), true) => self.source.rollback()?,
            _ => {}
        }
        outcome
    }

    fn write_staged(&mut self) -> Result<()> {
        let tables: BTreeSet<String> = self
            .entities
            .iter()
            .map(|(etype, _, _)| format!("{SQL_PREFIX}{etype}"))
            .chain(self.relations.keys().map(|r| format!("{r}_relation")))
            .collect();
        for table in &tables {
            self.drop_indexes(table)?;
        }

        for (etype, eid, row) in std::mem::take(&mut self.entities) {
            register_entity(self.source, eid, &etype)?;
            let (sql, params) = insert_row_sql(&etype, row);
            self.source.execute(&sql, &params)?;
            self.inserted += 1;
        }
        for (rtype, rows) in std::mem::take(&mut self.relations) {
            let sql = format!(
                "INSERT INTO {rtype}_relation (eid_from, eid_to) SELECT ?, ? \
                 WHERE NOT EXISTS (SELECT 1 FROM {rtype}_relation WHERE eid_from = ? AND eid_to = ?)"
            );
            for (from, to) in rows {
                self.source
                    .execute(&sql, &[from.into(), to.into(), from.into(), to.into()])?;
            }
        }
        for (rtype, rows) in std::mem::take(&mut self.inlined) {
            for (from, to) in rows {
                let etype = super::entities::entity_type(self.source, from)?
                    .ok_or(crate::error::StoreError::UnknownEntity(from))?;
                self.source.execute(
                    &format!("UPDATE {SQL_PREFIX}{etype} SET {SQL_PREFIX}{rtype} = ? WHERE {SQL_PREFIX}eid = ?"),
                    &[to.into(), from.into()],
                )?;
            }
        }
        Ok(())
    }

    /// Flush, add metadata relations and restore dropped indexes. Returns
    /// the number of inserted entities.
    pub fn finish(mut self) -> Result<usize> {
        self.flush()?;
        let metadata = add_metadata_relations(self.source, None)?;
        for (table, statements) in std::mem::take(&mut self.dropped) {
            for sql in &statements {
                self.source.execute(sql, &[])?;
            }
            debug!(table, count = statements.len(), "Indexes restored");
        }
        info!(entities = self.inserted, metadata, "Bulk load finished");
        Ok(self.inserted)
    }
}
