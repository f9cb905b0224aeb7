//! Full-text index maintenance.
//!
//! Words of an entity's full-text indexed attributes are stored in the
//! `appears` table under the entity's eid. A relation type with a
//! `fulltext_container` side makes entities on the other side delegate
//! their words to the container: the container row holds its own words
//! plus those of everything it contains, and contained entities get no
//! row of their own.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::error::{Result, SchemaError, StoreError};
use crate::progress::ProgressReporter;
use crate::schema::{Role, SQL_PREFIX, Schema};
use crate::store::entities::entity_type;
use crate::store::{SqlValue, SystemSource};

/// Lowercased distinct words of `text`, sorted. A word is a run of
/// alphanumeric characters or underscores.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Relations through which `etype` delegates its words, with the side of
/// the container.
fn container_relations<'s>(schema: &'s Schema, etype: &str) -> Vec<(&'s str, Role)> {
    schema
        .relation_types()
        .filter_map(|r| {
            let container = r.fulltext_container?;
            let contained = match container {
                Role::Subject => r.objects(),
                Role::Object => r.subjects(),
            };
            contained.contains(etype).then_some((r.name.as_str(), container))
        })
        .collect()
}

/// Relations through which `etype` receives the words of contained
/// entities, with the side of the container.
fn contained_relations<'s>(schema: &'s Schema, etype: &str) -> Vec<(&'s str, Role)> {
    schema
        .relation_types()
        .filter_map(|r| {
            let container = r.fulltext_container?;
            let holders = match container {
                Role::Subject => r.subjects(),
                Role::Object => r.objects(),
            };
            holders.contains(etype).then_some((r.name.as_str(), container))
        })
        .collect()
}

/// Entity types with something to index.
pub fn indexable_types(schema: &Schema) -> BTreeSet<String> {
    schema
        .user_entity_types()
        .filter(|e| !schema.fulltext_attributes(&e.name).is_empty())
        .map(|e| e.name.clone())
        .collect()
}

/// Entities linked to `eid` through `rtype`, `eid` being on `role`.
fn linked(
    source: &dyn SystemSource,
    schema: &Schema,
    eid: i64,
    etype: &str,
    rtype: &str,
    role: Role,
) -> Result<Vec<i64>> {
    let Some(relation) = schema.relation(rtype) else {
        return Ok(Vec::new());
    };
    let values = if relation.inlined {
        match role {
            Role::Subject => source.query_column(
                &format!("SELECT {SQL_PREFIX}{rtype} FROM {SQL_PREFIX}{etype} WHERE {SQL_PREFIX}eid = ?"),
                &[eid.into()],
            )?,
            Role::Object => {
                let mut values = Vec::new();
                for subject in relation.subjects() {
                    values.extend(source.query_column(
                        &format!(
                            "SELECT {SQL_PREFIX}eid FROM {SQL_PREFIX}{subject} WHERE {SQL_PREFIX}{rtype} = ?"
                        ),
                        &[eid.into()],
                    )?);
                }
                values
            }
        }
    } else {
        let (known, wanted) = match role {
            Role::Subject => ("eid_from", "eid_to"),
            Role::Object => ("eid_to", "eid_from"),
        };
        source.query_column(
            &format!("SELECT {wanted} FROM {rtype}_relation WHERE {known} = ?"),
            &[eid.into()],
        )?
    };
    Ok(values.iter().filter_map(SqlValue::as_i64).collect())
}

fn opposite(role: Role) -> Role {
    match role {
        Role::Subject => Role::Object,
        Role::Object => Role::Subject,
    }
}

/// Entities whose index row holds the words of `eid`.
pub fn containers(source: &dyn SystemSource, schema: &Schema, eid: i64) -> Result<BTreeSet<i64>> {
    let mut done = BTreeSet::new();
    let mut found = BTreeSet::new();
    collect_containers(source, schema, eid, &mut done, &mut found)?;
    Ok(found)
}

fn collect_containers(
    source: &dyn SystemSource,
    schema: &Schema,
    eid: i64,
    done: &mut BTreeSet<i64>,
    found: &mut BTreeSet<i64>,
) -> Result<()> {
    if !done.insert(eid) {
        return Ok(());
    }
    let etype = entity_type(source, eid)?.ok_or(StoreError::UnknownEntity(eid))?;
    let relations = container_relations(schema, &etype);
    if relations.is_empty() {
        found.insert(eid);
        return Ok(());
    }
    for (rtype, container) in relations {
        for target in linked(source, schema, eid, &etype, rtype, opposite(container))? {
            collect_containers(source, schema, target, done, found)?;
        }
    }
    Ok(())
}

/// Own words of `eid` plus those of the entities it contains.
pub fn entity_words(source: &dyn SystemSource, schema: &Schema, eid: i64) -> Result<BTreeSet<String>> {
    let mut words = BTreeSet::new();
    let mut done = BTreeSet::new();
    collect_words(source, schema, eid, &mut done, &mut words)?;
    Ok(words)
}

fn collect_words(
    source: &dyn SystemSource,
    schema: &Schema,
    eid: i64,
    done: &mut BTreeSet<i64>,
    words: &mut BTreeSet<String>,
) -> Result<()> {
    if !done.insert(eid) {
        return Ok(());
    }
    let etype = entity_type(source, eid)?.ok_or(StoreError::UnknownEntity(eid))?;
    let attributes = schema.fulltext_attributes(&etype);
    if !attributes.is_empty() {
        let columns: Vec<String> = attributes.iter().map(|a| a.column()).collect();
        let row = source.query_one(
            &format!(
                "SELECT {} FROM {SQL_PREFIX}{etype} WHERE {SQL_PREFIX}eid = ?",
                columns.join(", ")
            ),
            &[eid.into()],
        )?;
        for value in row.into_iter().flatten() {
            if let Some(text) = value.as_str() {
                words.extend(tokenize(text));
            }
        }
    }
    for (rtype, container) in contained_relations(schema, &etype) {
        for inner in linked(source, schema, eid, &etype, rtype, container)? {
            collect_words(source, schema, inner, done, words)?;
        }
    }
    Ok(())
}

fn write_row(source: &dyn SystemSource, eid: i64, words: &BTreeSet<String>) -> Result<()> {
    source.execute("DELETE FROM appears WHERE uid = ?", &[eid.into()])?;
    if !words.is_empty() {
        let joined: Vec<&str> = words.iter().map(String::as_str).collect();
        source.execute(
            "INSERT INTO appears (uid, words) VALUES (?, ?)",
            &[eid.into(), joined.join(" ").into()],
        )?;
    }
    Ok(())
}

/// Refresh the index rows holding the words of `eid`.
pub fn index_entity(source: &dyn SystemSource, schema: &Schema, eid: i64) -> Result<()> {
    for container in containers(source, schema, eid)? {
        let words = entity_words(source, schema, container)?;
        write_row(source, container, &words)?;
    }
    Ok(())
}

/// Entities whose index row contains `word`.
pub fn lookup(source: &dyn SystemSource, word: &str) -> Result<Vec<i64>> {
    let pattern = format!("% {} %", word.to_lowercase());
    Ok(source
        .query_column(
            "SELECT uid FROM appears WHERE ' ' || words || ' ' LIKE ? ORDER BY uid",
            &[pattern.into()],
        )?
        .iter()
        .filter_map(SqlValue::as_i64)
        .collect())
}

/// Rebuild the index for `etypes`, or for every indexable type. Returns
/// the number of index rows written.
pub fn reindex_entities(
    source: &dyn SystemSource,
    schema: &Schema,
    etypes: Option<&[String]>,
    progress: &dyn ProgressReporter,
) -> Result<usize> {
    let etypes: BTreeSet<String> = match etypes {
        Some(names) => {
            for name in names {
                if schema.entity(name).is_none_or(|e| e.is_final) {
                    return Err(SchemaError::UnknownEntityType(name.clone()).into());
                }
            }
            names.iter().cloned().collect()
        }
        None => indexable_types(schema),
    };

    let mut targets = BTreeSet::new();
    for etype in &etypes {
        let eids = source.query_column(
            &format!("SELECT {SQL_PREFIX}eid FROM {SQL_PREFIX}{etype}"),
            &[],
        )?;
        for eid in eids.iter().filter_map(SqlValue::as_i64) {
            targets.extend(containers(source, schema, eid)?);
        }
        debug!(etype, "Collected entities to reindex");
    }

    progress.start("Reindexing", Some(targets.len() as u64));
    for eid in &targets {
        let words = entity_words(source, schema, *eid)?;
        write_row(source, *eid, &words)?;
        progress.advance(1);
    }
    progress.finish();
    info!(types = etypes.len(), entities = targets.len(), "Full-text index rebuilt");
    Ok(targets.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopReporter;
    use crate::schema::bootstrap::bootstrap_schema;
    use crate::schema::{EntityType, RelationDefinition, RelationType};
    use crate::store::entities::{create_entity, relate};
    use crate::store::{SqliteSource, init_repository};

    fn schema() -> Schema {
        let mut schema = bootstrap_schema().unwrap();
        for etype in ["Ticket", "Comment"] {
            schema.add_entity_type(EntityType::new(etype)).unwrap();
        }
        schema.add_relation_type(RelationType::new("title")).unwrap();
        schema.add_relation_type(RelationType::new("content")).unwrap();
        let mut title = RelationDefinition::new("Ticket", "title", "String");
        title.fulltextindexed = true;
        schema.add_relation_definition(title).unwrap();
        let mut content = RelationDefinition::new("Comment", "content", "String");
        content.fulltextindexed = true;
        schema.add_relation_definition(content).unwrap();
        let mut comments = RelationType::new("comments");
        comments.fulltext_container = Some(Role::Object);
        schema.add_relation_type(comments).unwrap();
        schema
            .add_relation_definition(RelationDefinition::new("Comment", "comments", "Ticket"))
            .unwrap();
        schema
    }

    fn repo(schema: &Schema) -> SqliteSource {
        let source = SqliteSource::in_memory().unwrap();
        init_repository(&source, schema).unwrap();
        source
    }

    #[test]
    fn tokenizes_lowercase_words() {
        let words: Vec<String> = tokenize("Hello, hello World-wide!").into_iter().collect();
        assert_eq!(words, vec!["hello", "wide", "world"]);
    }

    #[test]
    fn contained_words_land_on_the_container() {
        let schema = schema();
        let source = repo(&schema);
        let ticket = create_entity(&source, &schema, "Ticket", &[("title", "Crash on start".into())]).unwrap();
        let comment = create_entity(&source, &schema, "Comment", &[("content", "Segfault here".into())]).unwrap();
        relate(&source, &schema, comment, "comments", ticket).unwrap();

        assert_eq!(containers(&source, &schema, comment).unwrap(), BTreeSet::from([ticket]));
        index_entity(&source, &schema, comment).unwrap();
        assert_eq!(lookup(&source, "segfault").unwrap(), vec![ticket]);
        assert_eq!(lookup(&source, "crash").unwrap(), vec![ticket]);
        assert_eq!(
            source.query_i64("SELECT COUNT(*) FROM appears WHERE uid = ?", &[comment.into()]).unwrap(),
            Some(0)
        );
    }

    #[test]
    fn reindex_replaces_stale_rows() {
        let schema = schema();
        let source = repo(&schema);
        let ticket = create_entity(&source, &schema, "Ticket", &[("title", "First".into())]).unwrap();
        source
            .execute("INSERT INTO appears (uid, words) VALUES (?, 'stale')", &[ticket.into()])
            .unwrap();
        let written = reindex_entities(&source, &schema, None, &NoopReporter).unwrap();
        assert_eq!(written, 1);
        assert!(lookup(&source, "stale").unwrap().is_empty());
        assert_eq!(lookup(&source, "first").unwrap(), vec![ticket]);
    }

    #[test]
    fn reindex_rejects_unknown_types() {
        let schema = schema();
        let source = repo(&schema);
        let err = reindex_entities(&source, &schema, Some(&["Nope".to_string()]), &NoopReporter);
        assert!(err.is_err());
    }
}
