//! An instance: its configuration, the cubes it uses and its database.
//!
//! [`Instance`] resolves the cubes named in `instance.toml` (plus their
//! dependencies) into a load order, builds the filesystem schema from them
//! and runs the lifecycle operations against the system source: creation,
//! upgrades, backups and checks.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use cubicweb_deps::{ConfigurationProblem, ROOT_CUBE, Solution, Version, expand_cubes, order_cubes};
use tracing::{info, warn};

use crate::backup::{self, BackupFormat};
use crate::config::{BackupPolicy, InstanceConfig};
use crate::cube::{CubeDefinition, discover_cubes};
use crate::error::{ConfigError, CwError, MigrationError, Result, SchemaError, StoreError};
use crate::framework_version;
use crate::integrity::{self, Check, IndexReport, IntegrityReport};
use crate::migrate::{Answer, MigrationHelper, Prompter, Upgrade};
use crate::progress::ProgressReporter;
use crate::schema::bootstrap::bootstrap_schema;
use crate::schema::loader::{DefinedNames, load_schema_texts};
use crate::schema::{SQL_PREFIX, Schema};
use crate::sql::system::system_tables_sql;
use crate::sql::{Dialect, grant_schema, schema_diff, schema_to_sql};
use crate::store::entities::{installed_versions, set_installed_version};
use crate::store::serialize::{deserialize_schema, serialize_schema};
use crate::store::{SqliteSource, SystemSource, init_repository};

/// Schema built from the cube schema files, with what each cube declared.
#[derive(Debug)]
pub struct FsSchema {
    pub schema: Schema,
    pub defined: BTreeMap<String, DefinedNames>,
}

/// How an upgrade behaves at its decision points.
#[derive(Debug, Clone, Copy)]
pub struct UpgradeOptions {
    pub interactive: bool,
    pub backup: BackupPolicy,
    pub backup_format: BackupFormat,
}

impl UpgradeOptions {
    pub fn from_config(config: &InstanceConfig) -> Self {
        Self {
            interactive: config.migration.interactive,
            backup: config.migration.backup,
            backup_format: BackupFormat::Native,
        }
    }
}

#[derive(Debug, Default)]
pub struct UpgradeOutcome {
    pub upgrades: Vec<Upgrade>,
    /// Archive written before migrating, if any.
    pub backup: Option<PathBuf>,
}

#[derive(Debug)]
pub struct Instance {
    config: InstanceConfig,
    /// Used cubes, dependencies first.
    cubes: Vec<CubeDefinition>,
}

impl Instance {
    pub fn load(config_path: &Path) -> Result<Self> {
        Self::from_config(InstanceConfig::load(config_path)?)
    }

    pub fn from_config(config: InstanceConfig) -> Result<Self> {
        let mut available = discover_cubes(&config.cube_paths())?;
        let dependencies: BTreeMap<String, BTreeSet<String>> = available
            .iter()
            .map(|(name, cube)| {
                let mut deps = cube.dependency_names();
                deps.remove(ROOT_CUBE);
                (name.clone(), deps)
            })
            .collect();
        let used = expand_cubes(&config.instance.cubes, &dependencies);
        if let Some(missing) = used.iter().find(|c| !available.contains_key(*c)) {
            return Err(ConfigError::UnknownCube(missing.clone()).into());
        }
        let cubes = order_cubes(&used, &dependencies)?
            .into_iter()
            .filter_map(|name| available.remove(&name))
            .collect();
        Ok(Self { config, cubes })
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.instance.name
    }

    pub fn cubes(&self) -> &[CubeDefinition] {
        &self.cubes
    }

    /// Version of every used cube on disk, plus the framework's.
    pub fn fs_versions(&self) -> BTreeMap<String, Version> {
        let mut versions: BTreeMap<String, Version> =
            self.cubes.iter().map(|c| (c.name.clone(), c.version)).collect();
        versions.insert(ROOT_CUBE.to_string(), framework_version());
        versions
    }

    /// Bootstrap schema extended with every cube schema, in load order.
    pub fn fs_schema(&self) -> Result<FsSchema> {
        let mut schema = bootstrap_schema()?;
        let mut files = Vec::new();
        for cube in &self.cubes {
            let path = cube.schema_path();
            if path.is_file() {
                let text = std::fs::read_to_string(&path).map_err(SchemaError::from)?;
                files.push((cube.name.as_str(), path, text));
            }
        }
        let loaded = load_schema_texts(
            &mut schema,
            files.iter().map(|(_, path, text)| (text.as_str(), path.as_path())),
        )?;
        let mut defined: BTreeMap<String, DefinedNames> = self
            .cubes
            .iter()
            .map(|c| (c.name.clone(), DefinedNames::default()))
            .collect();
        for ((cube, _, _), names) in files.iter().zip(loaded) {
            defined.insert((*cube).to_string(), names);
        }
        Ok(FsSchema { schema, defined })
    }

    /// Dependency problem over the used cubes at their disk versions.
    pub fn dependency_problem(&self) -> ConfigurationProblem {
        let mut problem = ConfigurationProblem::new(ROOT_CUBE, framework_version());
        for cube in &self.cubes {
            problem.add_cube(cube.name.clone(), cube.version, cube.depends.clone());
        }
        problem
    }

    pub fn check_dependencies(&self) -> Result<Solution> {
        let solution = self.dependency_problem().solve();
        if solution.is_consistent() {
            Ok(solution)
        } else {
            Err(ConfigError::Dependencies(solution.errors.iter().map(ToString::to_string).collect()).into())
        }
    }

    // ── Database ──────────────────────────────────────────────────

    pub fn open_source(&self) -> Result<SqliteSource> {
        match self.config.database.driver {
            Dialect::Sqlite => SqliteSource::open(&self.config.database_path()),
            other => Err(StoreError::Unsupported {
                backend: other.name(),
                operation: "opening a connection".into(),
            }
            .into()),
        }
    }

    /// Create the database: tables, persisted schema and cube versions.
    pub fn create(&self) -> Result<SqliteSource> {
        let path = self.config.database_path();
        if path.exists() {
            return Err(ConfigError::Invalid(format!("database {} already exists", path.display())).into());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
        }
        let fs = self.fs_schema()?;
        let source = self.open_source()?;
        source.begin()?;
        let created = (|| -> Result<()> {
            init_repository(&source, &fs.schema)?;
            serialize_schema(&source, &fs.schema)?;
            for (cube, version) in self.fs_versions() {
                set_installed_version(&source, &fs.schema, &cube, version)?;
            }
            Ok(())
        })();
        match created {
            Ok(()) => source.commit()?,
            Err(e) => {
                source.rollback()?;
                drop(source);
                if let Err(io) = std::fs::remove_file(&path) {
                    warn!(%io, path = %path.display(), "Could not remove the partial database");
                }
                return Err(e);
            }
        }
        info!(instance = self.name(), cubes = self.cubes.len(), "Instance created");
        Ok(source)
    }

    pub fn installed_versions(&self, source: &dyn SystemSource) -> Result<BTreeMap<String, Version>> {
        installed_versions(source)
    }

    /// Statements creating the database from scratch, optionally followed by
    /// the grants for `user`.
    pub fn schema_sql(&self, dialect: Dialect, grant: Option<&str>) -> Result<Vec<String>> {
        let fs = self.fs_schema()?;
        let mut stmts = system_tables_sql(dialect);
        stmts.extend(schema_to_sql(dialect, &fs.schema, &[], &[], SQL_PREFIX));
        if let Some(user) = grant {
            stmts.extend(grant_schema(&fs.schema, user, true, &[], SQL_PREFIX));
        }
        Ok(stmts)
    }

    /// Unified diff from the installed DDL to the filesystem DDL.
    pub fn schema_diff(&self, source: &dyn SystemSource) -> Result<String> {
        let repo = deserialize_schema(source)?;
        let fs = self.fs_schema()?;
        Ok(schema_diff(source.dialect(), &repo, &fs.schema, ("installed", "filesystem"), SQL_PREFIX))
    }

    // ── Upgrade ───────────────────────────────────────────────────

    /// Cubes whose installed version is behind the one on disk, framework
    /// first and then in load order.
    pub fn pending_upgrades(&self, source: &dyn SystemSource) -> Result<Vec<Upgrade>> {
        let installed = installed_versions(source)?;
        let on_disk = std::iter::once((ROOT_CUBE.to_string(), framework_version()))
            .chain(self.cubes.iter().map(|c| (c.name.clone(), c.version)));
        let mut upgrades = Vec::new();
        for (cube, to) in on_disk {
            let Some(&from) = installed.get(&cube) else {
                warn!(cube, "Cube not installed, use add_cube in a migration script");
                continue;
            };
            if from > to {
                return Err(MigrationError::Downgrade {
                    cube,
                    installed: from.to_string(),
                    available: to.to_string(),
                }
                .into());
            }
            if from == to {
                continue;
            }
            let migration_dir = if cube == ROOT_CUBE {
                self.config.framework_migration_dir()
            } else {
                self.cubes.iter().find(|c| c.name == cube).map(CubeDefinition::migration_dir)
            };
            upgrades.push(Upgrade {
                cube,
                from,
                to,
                migration_dir,
            });
        }
        Ok(upgrades)
    }

    fn backup_before_upgrade(
        &self,
        source: &dyn SystemSource,
        options: &UpgradeOptions,
        prompter: &dyn Prompter,
    ) -> Result<Option<PathBuf>> {
        if !self.config.instance.mode.has_repository() {
            return Ok(None);
        }
        let wanted = match options.backup {
            BackupPolicy::Never => false,
            BackupPolicy::Always => true,
            BackupPolicy::Ask if !options.interactive => true,
            BackupPolicy::Ask => match prompter.ask("Backup the database before upgrading?", Answer::Yes)? {
                Answer::Yes => true,
                Answer::No => false,
                Answer::Abort => return Err(MigrationError::Aborted.into()),
            },
        };
        if !wanted {
            return Ok(None);
        }
        match self.backup(source, options.backup_format) {
            Ok(path) => Ok(Some(path)),
            Err(e) => {
                warn!(%e, "Backup before upgrade failed");
                let go_on = options.interactive
                    && prompter.ask(&format!("Backup failed ({e}), continue anyway?"), Answer::No)? == Answer::Yes;
                if go_on {
                    Ok(None)
                } else {
                    Err(MigrationError::BackupFailed(e.to_string()).into())
                }
            }
        }
    }

    /// Bring the database to the cube versions on disk.
    pub fn upgrade(
        &self,
        source: &dyn SystemSource,
        options: &UpgradeOptions,
        prompter: &dyn Prompter,
        progress: &dyn ProgressReporter,
    ) -> Result<UpgradeOutcome> {
        self.check_dependencies()?;
        let upgrades = self.pending_upgrades(source)?;
        if upgrades.is_empty() {
            info!(instance = self.name(), "Nothing to upgrade");
            return Ok(UpgradeOutcome::default());
        }
        let backup = self.backup_before_upgrade(source, options, prompter)?;

        let fs = self.fs_schema()?;
        let helper = MigrationHelper::new(source, &fs.schema, self.config.instance.mode)?
            .with_cubes(fs.defined.clone(), self.fs_versions())
            .with_progress(progress);
        let mut helper = if options.interactive {
            helper.interactive(prompter)
        } else {
            helper
        };
        helper.migrate(&upgrades)?;
        info!(instance = self.name(), cubes = upgrades.len(), "Instance upgraded");
        Ok(UpgradeOutcome { upgrades, backup })
    }

    /// Run one migration script outside of any upgrade.
    pub fn run_script(
        &self,
        source: &dyn SystemSource,
        script: &Path,
        prompter: Option<&dyn Prompter>,
    ) -> Result<()> {
        let fs = self.fs_schema()?;
        let helper = MigrationHelper::new(source, &fs.schema, self.config.instance.mode)?
            .with_cubes(fs.defined.clone(), self.fs_versions());
        let mut helper = match prompter {
            Some(p) => helper.interactive(p),
            None => helper,
        };
        helper.run_script(script)
    }

    // ── Maintenance ───────────────────────────────────────────────

    pub fn backup(&self, source: &dyn SystemSource, format: BackupFormat) -> Result<PathBuf> {
        let versions = installed_versions(source)?;
        backup::backup(source, self.name(), &versions, format, &self.config.backup_dir())
    }

    /// Restore `archive`, warning about cubes whose recorded version differs
    /// from the one on disk. Returns the recorded versions.
    pub fn restore(&self, source: &dyn SystemSource, archive: &Path) -> Result<BTreeMap<String, Version>> {
        let recorded = backup::restore(source, archive)?;
        for (cube, version) in self.fs_versions() {
            match recorded.get(&cube) {
                Some(v) if *v != version => {
                    warn!(cube, backup = %v, disk = %version, "Restored version differs, run upgrade");
                }
                None => warn!(cube, "Cube missing from the backup"),
                Some(_) => {}
            }
        }
        Ok(recorded)
    }

    pub fn check(
        &self,
        source: &dyn SystemSource,
        checks: &[Check],
        fix: bool,
        reindex: bool,
        progress: &dyn ProgressReporter,
    ) -> Result<IntegrityReport> {
        let repo = deserialize_schema(source)?;
        integrity::check(source, &repo, checks, fix, reindex, progress)
    }

    pub fn check_indexes(&self, source: &dyn SystemSource) -> Result<IndexReport> {
        let repo = deserialize_schema(source)?;
        integrity::check_indexes(source, &repo)
    }

    /// Rebuild the full-text index for `etypes`, or for every indexable type.
    pub fn reindex(
        &self,
        source: &dyn SystemSource,
        etypes: Option<&[String]>,
        progress: &dyn ProgressReporter,
    ) -> Result<usize> {
        let repo = deserialize_schema(source)?;
        source.begin()?;
        match crate::fti::reindex_entities(source, &repo, etypes, progress) {
            Ok(count) => {
                source.commit()?;
                Ok(count)
            }
            Err(e) => {
                source.rollback()?;
                Err(e)
            }
        }
    }
}

/// Whether `err` is a user abort rather than a failure.
pub fn is_abort(err: &CwError) -> bool {
    matches!(err, CwError::Migration(MigrationError::Aborted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::{AutoPrompter, ScriptedPrompter};
    use crate::progress::NoopReporter;

    const SCHEMA: &str = "[entity.Person]\n\n[[entity.Person.attribute]]\nname = \"name\"\ntype = \"String\"\nrequired = true\nmaxsize = 64\n";

    fn write(path: &Path, text: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    fn cube(root: &Path, name: &str, version: &str, depends: &str) {
        write(
            &root.join("cubes").join(name).join("cube.toml"),
            &format!("[cube]\nname = \"{name}\"\nversion = \"{version}\"\n[depends]\n{depends}"),
        );
    }

    fn config(root: &Path, cubes: &str, extra: &str) -> InstanceConfig {
        InstanceConfig::from_toml_str(
            &format!("[instance]\nname = \"demo\"\ncubes = [{cubes}]\n[migration]\ninteractive = false\nbackup = \"never\"\n{extra}"),
            root,
        )
        .unwrap()
    }

    #[test]
    fn cubes_are_expanded_and_ordered() {
        let tmp = tempfile::tempdir().unwrap();
        cube(tmp.path(), "blog", "1.0.0", "tag = \">= 0.2.0\"\ncubicweb = \">= 3.0.0\"\n");
        cube(tmp.path(), "tag", "0.3.0", "");
        let instance = Instance::from_config(config(tmp.path(), "\"blog\"", "")).unwrap();
        let names: Vec<&str> = instance.cubes().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["tag", "blog"]);
        assert_eq!(instance.fs_versions()[ROOT_CUBE], framework_version());
        assert!(instance.check_dependencies().is_ok());
    }

    #[test]
    fn dependency_schemas_may_reference_dependent_cubes() {
        let tmp = tempfile::tempdir().unwrap();
        cube(tmp.path(), "people", "1.0.0", "tag = \">= 1.0.0\"\n");
        cube(tmp.path(), "tag", "1.0.0", "");
        write(&tmp.path().join("cubes/people/schema.toml"), SCHEMA);
        write(
            &tmp.path().join("cubes/tag/schema.toml"),
            "[entity.Tag]\n\n[relation.tags]\nsubject = \"Tag\"\nobject = \"Person\"\n",
        );
        let instance = Instance::from_config(config(tmp.path(), "\"people\"", "")).unwrap();
        let fs = instance.fs_schema().unwrap();
        assert!(fs.schema.rdef("Tag", "tags", "Person").is_some());
        assert_eq!(fs.defined["tag"].relations, vec!["tags"]);
        assert_eq!(fs.defined["people"].entities, vec!["Person"]);
    }

    #[test]
    fn unknown_cube_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Instance::from_config(config(tmp.path(), "\"nope\"", "")).unwrap_err();
        assert!(matches!(err, CwError::Config(ConfigError::UnknownCube(c)) if c == "nope"));
    }

    #[test]
    fn unsatisfied_floor_fails_the_dependency_check() {
        let tmp = tempfile::tempdir().unwrap();
        cube(tmp.path(), "blog", "1.0.0", "tag = \">= 2.0.0\"\n");
        cube(tmp.path(), "tag", "1.5.0", "");
        let instance = Instance::from_config(config(tmp.path(), "\"blog\"", "")).unwrap();
        let err = instance.check_dependencies().unwrap_err();
        assert!(err.to_string().contains("update cube tag"), "{err}");
    }

    #[test]
    fn create_records_versions_and_refuses_twice() {
        let tmp = tempfile::tempdir().unwrap();
        cube(tmp.path(), "people", "1.0.0", "");
        write(&tmp.path().join("cubes/people/schema.toml"), SCHEMA);
        let instance = Instance::from_config(config(tmp.path(), "\"people\"", "")).unwrap();
        let source = instance.create().unwrap();
        assert!(source.has_table("cw_Person").unwrap());
        let versions = instance.installed_versions(&source).unwrap();
        assert_eq!(versions, instance.fs_versions());
        assert!(instance.pending_upgrades(&source).unwrap().is_empty());
        let report = instance.check(&source, &[], false, false, &NoopReporter).unwrap();
        assert!(report.is_clean(), "{}", report.render());
        assert_eq!(instance.check_indexes(&source).unwrap().status(), 0);
        drop(source);
        assert!(instance.create().is_err());
    }

    #[test]
    fn upgrade_runs_scripts_and_records_versions() {
        let tmp = tempfile::tempdir().unwrap();
        cube(tmp.path(), "people", "1.0.0", "");
        write(&tmp.path().join("cubes/people/schema.toml"), "");
        let instance = Instance::from_config(config(tmp.path(), "\"people\"", "")).unwrap();
        let source = instance.create().unwrap();
        drop(source);

        cube(tmp.path(), "people", "1.1.0", "");
        write(&tmp.path().join("cubes/people/schema.toml"), SCHEMA);
        write(
            &tmp.path().join("cubes/people/migration/1.1.0_Any.mig"),
            "add_entity_type Person\n",
        );
        let instance = Instance::from_config(config(tmp.path(), "\"people\"", "")).unwrap();
        let source = instance.open_source().unwrap();
        let upgrades = instance.pending_upgrades(&source).unwrap();
        assert_eq!(upgrades.len(), 1);
        assert_eq!(upgrades[0].from, Version::new(1, 0, 0));

        let options = UpgradeOptions::from_config(instance.config());
        let outcome = instance
            .upgrade(&source, &options, &AutoPrompter(Answer::Yes), &NoopReporter)
            .unwrap();
        assert_eq!(outcome.upgrades.len(), 1);
        assert!(outcome.backup.is_none());
        assert!(source.has_table("cw_Person").unwrap());
        assert_eq!(instance.installed_versions(&source).unwrap()["people"], Version::new(1, 1, 0));
        let diff = instance.schema_diff(&source).unwrap();
        assert!(!diff.lines().any(|l| l.starts_with("+CREATE TABLE cw_Person")), "{diff}");
    }

    #[test]
    fn downgrades_are_refused() {
        let tmp = tempfile::tempdir().unwrap();
        cube(tmp.path(), "people", "2.0.0", "");
        let instance = Instance::from_config(config(tmp.path(), "\"people\"", "")).unwrap();
        let source = instance.create().unwrap();
        drop(source);
        cube(tmp.path(), "people", "1.0.0", "");
        let instance = Instance::from_config(config(tmp.path(), "\"people\"", "")).unwrap();
        let source = instance.open_source().unwrap();
        let err = instance.pending_upgrades(&source).unwrap_err();
        assert!(matches!(err, CwError::Migration(MigrationError::Downgrade { .. })));
    }

    #[test]
    fn declining_the_backup_question_skips_it() {
        let tmp = tempfile::tempdir().unwrap();
        cube(tmp.path(), "people", "1.0.0", "");
        let instance = Instance::from_config(config(tmp.path(), "\"people\"", "")).unwrap();
        let source = instance.create().unwrap();
        let options = UpgradeOptions {
            interactive: true,
            backup: BackupPolicy::Ask,
            backup_format: BackupFormat::Native,
        };
        let no = ScriptedPrompter::new([Answer::No]);
        assert_eq!(instance.backup_before_upgrade(&source, &options, &no).unwrap(), None);
        let abort = ScriptedPrompter::new([Answer::Abort]);
        let err = instance.backup_before_upgrade(&source, &options, &abort).unwrap_err();
        assert!(is_abort(&err));
        let always = UpgradeOptions {
            backup: BackupPolicy::Always,
            ..options
        };
        let path = instance.backup_before_upgrade(&source, &always, &no).unwrap().unwrap();
        assert!(path.starts_with(tmp.path().join("backup")));
    }

    #[test]
    fn postgres_instances_only_generate_sql() {
        let tmp = tempfile::tempdir().unwrap();
        cube(tmp.path(), "people", "1.0.0", "");
        write(&tmp.path().join("cubes/people/schema.toml"), SCHEMA);
        let instance = Instance::from_config(config(
            tmp.path(),
            "\"people\"",
            "[database]\ndriver = \"postgres\"\npath = \"db\"\nuser = \"cw\"\n",
        ))
        .unwrap();
        assert!(matches!(
            instance.open_source().unwrap_err(),
            CwError::Store(StoreError::Unsupported { backend: "postgres", .. })
        ));
        let sql = instance.schema_sql(Dialect::Postgres, Some("cw")).unwrap();
        assert!(sql.iter().any(|s| s.contains("cw_name varchar(64)")));
        assert!(sql.iter().any(|s| s == "GRANT ALL ON cw_Person TO cw"));
    }
}
