pub mod backup;
pub mod check;
pub mod create;
pub mod deps;
pub mod schema;
pub mod shell;
pub mod upgrade;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use clap::Subcommand;

use cubicweb_core::error::{ConfigError, CwError};
use cubicweb_core::instance::Instance;
use cubicweb_core::store::SqliteSource;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the instance database from the cube schemas
    Create(create::CreateArgs),
    /// Print the SQL creating the instance database
    SchemaSql(schema::SchemaSqlArgs),
    /// Diff the installed schema DDL against the cube schemas
    SchemaDiff,
    /// Run the migrations bringing the database to the cube versions on disk
    Upgrade(upgrade::UpgradeArgs),
    /// Run one migration script in its own transaction
    Shell(shell::ShellArgs),
    /// Check database integrity, optionally repairing it
    Check(check::CheckArgs),
    /// Compare database indexes with the ones the schema implies
    CheckIndexes,
    /// Rebuild the full-text index
    Reindex(check::ReindexArgs),
    /// Write a backup archive of the database
    Backup(backup::BackupArgs),
    /// Restore the database from a backup archive
    Restore(backup::RestoreArgs),
    /// Check cube dependency constraints
    Deps,
}

impl Command {
    /// Whether the command may stop at a confirmation prompt.
    pub fn prompts(&self) -> bool {
        match self {
            Command::Upgrade(args) => !args.yes,
            Command::Shell(args) => !args.yes,
            _ => false,
        }
    }
}

/// Run `cmd` against the instance configured in `config`. Returns the
/// process exit status. `interrupted` is raised on Ctrl-C and turns any
/// pending confirmation into an abort.
pub fn run(cmd: Command, config: &Path, interrupted: &Arc<AtomicBool>) -> anyhow::Result<i32> {
    let instance = load(config)?;
    match cmd {
        Command::Create(args) => create::run(&instance, &args),
        Command::SchemaSql(args) => schema::run_sql(&instance, &args),
        Command::SchemaDiff => schema::run_diff(&instance),
        Command::Upgrade(args) => upgrade::run(&instance, &args, interrupted),
        Command::Shell(args) => shell::run(&instance, &args, interrupted),
        Command::Check(args) => check::run(&instance, &args),
        Command::CheckIndexes => check::run_indexes(&instance),
        Command::Reindex(args) => check::run_reindex(&instance, &args),
        Command::Backup(args) => backup::run(&instance, &args),
        Command::Restore(args) => backup::run_restore(&instance, &args),
        Command::Deps => deps::run(&instance),
    }
}

fn load(config: &Path) -> anyhow::Result<Instance> {
    Instance::load(config).with_context(|| format!("Cannot load instance from {}", config.display()))
}

/// Open an existing instance database.
pub fn open(instance: &Instance) -> anyhow::Result<SqliteSource> {
    let path = instance.config().database_path();
    if !path.exists() {
        let err = CwError::from(ConfigError::Invalid(format!("no database at {}", path.display())));
        return Err(anyhow::Error::from(err).context(format!(
            "Instance {} is not created, run `cubicweb-ctl create` first",
            instance.name()
        )));
    }
    instance
        .open_source()
        .with_context(|| format!("Cannot open database: {}", path.display()))
}
