use cubicweb_core::backup::BackupFormat;
use cubicweb_core::fti;
use cubicweb_core::instance::UpgradeOptions;
use cubicweb_core::migrate::{Answer, AutoPrompter};
use cubicweb_core::progress::NoopReporter;
use cubicweb_core::sql::Dialect;
use cubicweb_core::store::SystemSource;
use cubicweb_core::store::entities::{create_entity, delete_entity, find_eid, related};
use cubicweb_core::store::massive::MassiveStore;
use cubicweb_deps::Version;
use cubicweb_test::{PERSON_SCHEMA, TestInstance};

const TAG_SCHEMA: &str = "\
[entity.Tag]

[[entity.Tag.attribute]]
name = \"name\"
type = \"String\"
required = true
unique = true
maxsize = 32

[relation.tags]
subject = \"Tag\"
object = \"Person\"
cardinality = \"**\"
";

fn people() -> TestInstance {
    let fixture = TestInstance::new("demo", &["people"]);
    fixture.cube("people", "1.0.0", &[]).schema("people", PERSON_SCHEMA);
    fixture
}

fn v(s: &str) -> Version {
    s.parse().unwrap()
}

// ── Creation ─────────────────────────────────────────────────────

#[test]
fn person_schema_creates_a_clean_database() -> anyhow::Result<()> {
    let fixture = people();
    let instance = fixture.instance();

    let sql = instance.schema_sql(Dialect::Sqlite, None)?;
    let person = sql
        .iter()
        .find(|s| s.starts_with("CREATE TABLE cw_Person"))
        .expect("Person table statement");
    assert!(person.contains("cw_name varchar(64)"), "{person}");

    let source = instance.create()?;
    assert!(fixture.database_path().exists());
    assert!(source.table_columns("cw_Person")?.contains(&"cw_name".to_string()));

    let fs = instance.fs_schema()?;
    create_entity(&source, &fs.schema, "Person", &[("name", "Alice".into())])?;

    let report = instance.check(&source, &[], false, false, &NoopReporter)?;
    assert!(report.is_clean(), "{}", report.render());
    assert_eq!(instance.check_indexes(&source)?.status(), 0);
    Ok(())
}

#[test]
fn reindex_makes_entities_searchable() -> anyhow::Result<()> {
    let fixture = people();
    let instance = fixture.instance();
    let source = instance.create()?;
    let fs = instance.fs_schema()?;
    let alice = create_entity(&source, &fs.schema, "Person", &[("name", "Alice Liddell".into())])?;

    let written = instance.reindex(&source, None, &NoopReporter)?;
    assert!(written >= 1);
    assert_eq!(fti::lookup(&source, "liddell")?, vec![alice]);

    let only = ["Person".to_string()];
    instance.reindex(&source, Some(&only), &NoopReporter)?;
    assert_eq!(fti::lookup(&source, "ALICE")?, vec![alice]);
    Ok(())
}

// ── Upgrades ─────────────────────────────────────────────────────

#[test]
fn scripts_run_in_version_then_dependency_order() -> anyhow::Result<()> {
    let fixture = TestInstance::new("demo", &["blog"]);
    fixture.cube("tag", "1.0.0", &[]);
    fixture.cube("blog", "1.0.0", &[("tag", ">= 1.0.0")]);
    let instance = fixture.instance();
    drop(instance.create()?);

    fixture
        .cube("tag", "1.2.0", &[])
        .cube("blog", "1.1.0", &[("tag", ">= 1.1.0")])
        .migration(
            "tag",
            "1.1.0_Any.mig",
            "sql \"CREATE TABLE steps (n integer PRIMARY KEY, step varchar(16))\"\n\
             sql \"INSERT INTO steps (step) VALUES ('tag 1.1.0')\"\n",
        )
        .migration("tag", "1.2.0_Any.mig", "sql \"INSERT INTO steps (step) VALUES ('tag 1.2.0')\"\n")
        .migration("blog", "1.1.0_Any.mig", "sql \"INSERT INTO steps (step) VALUES ('blog 1.1.0')\"\n")
        // ignored: editor backup
        .migration("blog", "1.1.0_Any.mig~", "exit 9\n");

    let instance = fixture.instance();
    let source = instance.open_source()?;
    let pending: Vec<String> = instance
        .pending_upgrades(&source)?
        .into_iter()
        .map(|u| u.cube)
        .collect();
    assert_eq!(pending, vec!["tag", "blog"]);

    let options = UpgradeOptions::from_config(instance.config());
    let outcome = instance.upgrade(&source, &options, &AutoPrompter(Answer::Yes), &NoopReporter)?;
    assert_eq!(outcome.upgrades.len(), 2);

    let steps: Vec<String> = source
        .query_column("SELECT step FROM steps ORDER BY n", &[])?
        .iter()
        .filter_map(|s| s.as_str().map(str::to_string))
        .collect();
    assert_eq!(steps, vec!["tag 1.1.0", "blog 1.1.0", "tag 1.2.0"]);

    let installed = instance.installed_versions(&source)?;
    assert_eq!(installed["tag"], v("1.2.0"));
    assert_eq!(installed["blog"], v("1.1.0"));
    assert!(instance.pending_upgrades(&source)?.is_empty());
    Ok(())
}

#[test]
fn adding_a_cube_twice_is_a_no_op() -> anyhow::Result<()> {
    let fixture = people();
    drop(fixture.instance().create()?);

    fixture
        .cube("tag", "0.5.0", &[])
        .schema("tag", TAG_SCHEMA)
        .cube("people", "1.1.0", &[("tag", ">= 0.5.0")])
        .migration("people", "1.1.0_Any.mig", "add_cube tag\n# second call adds nothing\nadd_cube tag\n");

    let instance = fixture.instance();
    let source = instance.open_source()?;
    let options = UpgradeOptions::from_config(instance.config());
    instance.upgrade(&source, &options, &AutoPrompter(Answer::Yes), &NoopReporter)?;

    assert!(source.has_table("cw_Tag")?);
    assert!(source.has_table("tags_relation")?);
    let installed = instance.installed_versions(&source)?;
    assert_eq!(installed["tag"], v("0.5.0"));
    assert_eq!(installed["people"], v("1.1.0"));

    let report = instance.check(&source, &[], false, false, &NoopReporter)?;
    assert!(report.is_clean(), "{}", report.render());
    Ok(())
}

#[test]
fn failed_script_keeps_earlier_versions() {
    let fixture = people();
    drop(fixture.instance().create().unwrap());
    fixture
        .cube("people", "1.2.0", &[])
        .migration("people", "1.1.0_Any.mig", "set_property step one\n")
        .migration("people", "1.2.0_Any.mig", "exit 3\n");

    let instance = fixture.instance();
    let source = instance.open_source().unwrap();
    let options = UpgradeOptions::from_config(instance.config());
    assert!(
        instance
            .upgrade(&source, &options, &AutoPrompter(Answer::Yes), &NoopReporter)
            .is_err()
    );
    assert_eq!(instance.installed_versions(&source).unwrap()["people"], v("1.1.0"));
}

// ── Bulk load, backup and restore ────────────────────────────────

#[test]
fn bulk_loaded_data_survives_backup_and_restore() -> anyhow::Result<()> {
    let fixture = TestInstance::new("demo", &["tag"]);
    fixture.cube("people", "1.0.0", &[]).schema("people", PERSON_SCHEMA);
    fixture
        .cube("tag", "1.0.0", &[("people", ">= 1.0.0")])
        .schema("tag", TAG_SCHEMA);
    let instance = fixture.instance();
    let source = instance.create()?;
    let fs = instance.fs_schema()?;

    let mut store = MassiveStore::new(&source, &fs.schema);
    let tag = store.prepare_insert_entity("Tag", &[("name", "friends".into())])?;
    let mut people = Vec::new();
    for i in 0..25 {
        let eid = store.prepare_insert_entity("Person", &[("name", format!("person {i}").into())])?;
        store.prepare_insert_relation(tag, "tags", eid)?;
        people.push(eid);
    }
    assert_eq!(store.finish()?, 26);
    assert_eq!(related(&source, tag, "tags")?, people);
    assert_eq!(instance.check_indexes(&source)?.status(), 0);
    let report = instance.check(&source, &[], false, false, &NoopReporter)?;
    assert!(report.is_clean(), "{}", report.render());

    for format in [BackupFormat::Native, BackupFormat::Portable] {
        let archive = instance.backup(&source, format)?;
        assert!(archive.starts_with(fixture.path().join("backup")));

        delete_entity(&source, &fs.schema, tag)?;
        assert_eq!(find_eid(&source, "Tag", "name", "friends")?, None);

        let versions = instance.restore(&source, &archive)?;
        assert_eq!(versions["tag"], v("1.0.0"));
        assert_eq!(find_eid(&source, "Tag", "name", "friends")?, Some(tag));
        assert_eq!(related(&source, tag, "tags")?.len(), 25);
        std::fs::remove_file(&archive)?;
    }
    Ok(())
}
