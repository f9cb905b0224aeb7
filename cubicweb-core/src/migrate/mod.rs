//! Migration runs.
//!
//! A run takes every cube whose installed version is behind the one on
//! disk, collects the scripts of its migration directory in the
//! `(installed, available]` range and executes them in one global version
//! order. After the last script of a version the cube's installed version
//! is recorded and committed, so a failed run resumes where it stopped.
//! Any error rolls back the work done since the last commit.

pub mod commands;
pub mod prompt;
pub mod schema_sync;
pub mod scripts;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use cubicweb_deps::{ROOT_CUBE, Version};
use tracing::{info, warn};

use crate::config::Mode;
use crate::error::{ConfigError, CwError, MigrationError, Result, StoreError};
use crate::fti::reindex_entities;
use crate::progress::{NoopReporter, ProgressReporter};
use crate::schema::Schema;
use crate::schema::loader::DefinedNames;
use crate::store::SystemSource;
use crate::store::entities::{set_installed_version, set_property};

pub use commands::{Command, CommandTable};
pub use prompt::{Answer, AutoPrompter, Prompter, ScriptedPrompter, StdinPrompter};
pub use schema_sync::SchemaSync;
pub use scripts::{BOOTSTRAP_SCRIPT, MigrationScript, ScriptKind, filter_scripts};

static ALWAYS_YES: AutoPrompter = AutoPrompter(Answer::Yes);
static SILENT: NoopReporter = NoopReporter;

/// One cube to bring from `from` to `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upgrade {
    pub cube: String,
    pub from: Version,
    pub to: Version,
    pub migration_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedScript {
    pub cube: String,
    pub script: MigrationScript,
}

/// Scripts of a run, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationPlan {
    pub bootstrap: Option<PathBuf>,
    pub steps: Vec<PlannedScript>,
}

impl MigrationPlan {
    pub fn len(&self) -> usize {
        self.steps.len() + usize::from(self.bootstrap.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn in_script(path: &Path, line: usize, err: CwError) -> CwError {
    match err {
        CwError::Migration(MigrationError::Aborted | MigrationError::Exit(_) | MigrationError::Script { .. }) => err,
        other => MigrationError::Script {
            path: path.to_path_buf(),
            line,
            source: Box::new(other),
        }
        .into(),
    }
}

pub struct MigrationHelper<'a> {
    source: &'a dyn SystemSource,
    mode: Mode,
    sync: SchemaSync<'a>,
    cubes: BTreeMap<String, DefinedNames>,
    versions: BTreeMap<String, Version>,
    interactive: bool,
    prompter: &'a dyn Prompter,
    progress: &'a dyn ProgressReporter,
    commands: CommandTable,
}

impl fmt::Debug for MigrationHelper<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationHelper")
            .field("mode", &self.mode)
            .field("interactive", &self.interactive)
            .field("cubes", &self.cubes.keys())
            .finish_non_exhaustive()
    }
}

impl<'a> MigrationHelper<'a> {
    /// A non-interactive helper migrating towards `fs`.
    pub fn new(source: &'a dyn SystemSource, fs: &'a Schema, mode: Mode) -> Result<Self> {
        Ok(Self {
            source,
            mode,
            sync: SchemaSync::new(source, fs)?,
            cubes: BTreeMap::new(),
            versions: BTreeMap::new(),
            interactive: false,
            prompter: &ALWAYS_YES,
            progress: &SILENT,
            commands: CommandTable::new(),
        })
    }

    /// Elements each cube schema declares, and the cube versions on disk,
    /// used by `add_cube`.
    #[must_use]
    pub fn with_cubes(mut self, cubes: BTreeMap<String, DefinedNames>, versions: BTreeMap<String, Version>) -> Self {
        self.cubes = cubes;
        self.versions = versions;
        self
    }

    /// Ask `prompter` before each script and at checkpoints.
    #[must_use]
    pub fn interactive(mut self, prompter: &'a dyn Prompter) -> Self {
        self.interactive = true;
        self.prompter = prompter;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: &'a dyn ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    pub fn source(&self) -> &'a dyn SystemSource {
        self.source
    }

    pub fn sync(&self) -> &SchemaSync<'a> {
        &self.sync
    }

    pub fn sync_mut(&mut self) -> &mut SchemaSync<'a> {
        &mut self.sync
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    // ── Transactions ──────────────────────────────────────────────

    /// `true` to go on. Non-interactive runs always go on; an abort rolls
    /// back and stops the run.
    pub fn confirm(&mut self, question: &str, default: Answer) -> Result<bool> {
        if !self.interactive {
            return Ok(true);
        }
        match self.prompter.ask(question, default)? {
            Answer::Yes => Ok(true),
            Answer::No => Ok(false),
            Answer::Abort => {
                self.abandon();
                Err(MigrationError::Aborted.into())
            }
        }
    }

    pub fn commit(&mut self) -> Result<()> {
        if self.source.in_transaction() {
            self.source.commit()?;
        }
        self.source.begin()
    }

    pub fn rollback(&mut self) -> Result<()> {
        if self.source.in_transaction() {
            self.source.rollback()?;
        }
        self.sync.reload()?;
        self.source.begin()
    }

    /// Commit, after confirmation in interactive runs.
    pub fn checkpoint(&mut self) -> Result<()> {
        if self.confirm("Commit now?", Answer::Yes)? {
            self.commit()
        } else {
            info!("Checkpoint skipped, changes kept pending");
            Ok(())
        }
    }

    /// Roll back whatever is pending. Used on failure paths, so errors are
    /// only logged.
    fn abandon(&mut self) {
        if self.source.in_transaction() {
            if let Err(e) = self.source.rollback() {
                warn!(%e, "Rollback failed");
            }
        }
        if let Err(e) = self.sync.reload() {
            warn!(%e, "Could not re-read the installed schema");
        }
    }

    // ── Commands ──────────────────────────────────────────────────

    pub fn execute(&mut self, words: &[String]) -> Result<Option<String>> {
        let (name, args) = words
            .split_first()
            .ok_or_else(|| MigrationError::Syntax("empty command".into()))?;
        let command = self
            .commands
            .get(name)
            .ok_or_else(|| MigrationError::UnknownCommand(name.clone()))?;
        command.call(self, args)
    }

    pub fn add_cube(&mut self, cube: &str) -> Result<usize> {
        let names = self
            .cubes
            .get(cube)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownCube(cube.to_string()))?;
        let added = self.sync.add_elements(&names)?;
        if let Some(version) = self.versions.get(cube) {
            set_installed_version(self.source, self.sync.repo(), cube, *version)?;
        }
        info!(cube, added, "Cube added");
        Ok(added)
    }

    pub fn set_property(&mut self, key: &str, value: &str) -> Result<()> {
        set_property(self.source, self.sync.repo(), key, value)
    }

    pub fn reindex(&mut self, etypes: Option<&[String]>) -> Result<usize> {
        reindex_entities(self.source, self.sync.repo(), etypes, self.progress)
    }

    // ── Scripts ───────────────────────────────────────────────────

    /// Run one script inside the current transaction.
    pub fn process_script(&mut self, path: &Path) -> Result<()> {
        let kind = ScriptKind::of(path)?;
        if kind == ScriptKind::Sql && !self.mode.has_repository() {
            return Err(MigrationError::NoRepository(path.to_path_buf()).into());
        }
        if !self.confirm(&format!("Execute migration script {}?", path.display()), Answer::Yes)? {
            info!(script = %path.display(), "Script skipped");
            return Ok(());
        }
        info!(script = %path.display(), "Running migration script");
        let text = std::fs::read_to_string(path).map_err(StoreError::Io)?;
        match kind {
            ScriptKind::Sql => {
                for (line, statement) in scripts::split_sql(&text) {
                    self.source.run(&statement).map_err(|e| in_script(path, line, e))?;
                }
            }
            ScriptKind::Commands => {
                for command in scripts::parse_commands(path, &text)? {
                    self.execute(&command.words)
                        .map_err(|e| in_script(path, command.line, e))?;
                }
            }
            ScriptKind::Doctest => {
                for step in scripts::parse_doctest(&text) {
                    let words =
                        scripts::tokenize(&step.command).map_err(|e| in_script(path, step.line, e.into()))?;
                    if words.is_empty() {
                        continue;
                    }
                    let output = self
                        .execute(&words)
                        .map_err(|e| in_script(path, step.line, e))?
                        .unwrap_or_default();
                    let got: Vec<String> = output
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect();
                    if got != step.expected {
                        return Err(MigrationError::DoctestFailed {
                            path: path.to_path_buf(),
                            line: step.line,
                            expected: step.expected.join("\n"),
                            got: got.join("\n"),
                        }
                        .into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Run a single script in its own transaction.
    pub fn run_script(&mut self, path: &Path) -> Result<()> {
        self.source.begin()?;
        match self.process_script(path) {
            Ok(()) => {
                if self.source.in_transaction() {
                    self.source.commit()?;
                }
                Ok(())
            }
            Err(e) => {
                self.abandon();
                Err(e)
            }
        }
    }

    // ── Runs ──────────────────────────────────────────────────────

    /// Scripts `upgrades` would run, in order.
    pub fn plan(&self, upgrades: &[Upgrade]) -> Result<MigrationPlan> {
        let mut ordered = Vec::new();
        for (position, upgrade) in upgrades.iter().enumerate() {
            let Some(dir) = &upgrade.migration_dir else {
                continue;
            };
            for script in filter_scripts(dir, upgrade.from, upgrade.to, self.mode)? {
                ordered.push((position, upgrade.cube.clone(), script));
            }
        }
        // One global version order; cubes keep their given order within a
        // version.
        ordered.sort_by(|a, b| (a.2.version, a.0, &a.2.path).cmp(&(b.2.version, b.0, &b.2.path)));
        let bootstrap = upgrades
            .iter()
            .filter(|u| u.cube == ROOT_CUBE && u.from < u.to)
            .find_map(|u| u.migration_dir.as_ref())
            .map(|dir| dir.join(BOOTSTRAP_SCRIPT))
            .filter(|path| path.is_file());
        Ok(MigrationPlan {
            bootstrap,
            steps: ordered
                .into_iter()
                .map(|(_, cube, script)| PlannedScript { cube, script })
                .collect(),
        })
    }

    /// Run every script of `upgrades` and record the new versions.
    pub fn migrate(&mut self, upgrades: &[Upgrade]) -> Result<()> {
        let plan = self.plan(upgrades)?;
        info!(scripts = plan.len(), cubes = upgrades.len(), "Starting migration");
        self.source.begin()?;
        match self.run_plan(upgrades, &plan) {
            Ok(()) => {
                if self.source.in_transaction() {
                    self.source.commit()?;
                }
                info!("Migration done");
                Ok(())
            }
            Err(e) => {
                self.abandon();
                Err(e)
            }
        }
    }

    fn run_plan(&mut self, upgrades: &[Upgrade], plan: &MigrationPlan) -> Result<()> {
        self.progress.start("Running migration scripts", Some(plan.len() as u64));
        if let Some(path) = &plan.bootstrap {
            self.process_script(path)?;
            self.progress.advance(1);
        }
        for (i, step) in plan.steps.iter().enumerate() {
            self.process_script(&step.script.path)?;
            self.progress.advance(1);
            let version_done = plan
                .steps
                .get(i + 1)
                .is_none_or(|next| next.cube != step.cube || next.script.version != step.script.version);
            if version_done {
                self.cube_upgraded(&step.cube, step.script.version)?;
            }
        }
        for upgrade in upgrades.iter().filter(|u| u.from < u.to) {
            self.cube_upgraded(&upgrade.cube, upgrade.to)?;
        }
        self.progress.finish();
        Ok(())
    }

    fn cube_upgraded(&mut self, cube: &str, version: Version) -> Result<()> {
        set_installed_version(self.source, self.sync.repo(), cube, version)?;
        self.commit()?;
        info!(cube, %version, "Cube upgraded");
        Ok(())
    }
}
