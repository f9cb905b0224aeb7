use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::{Args, ValueEnum};

use cubicweb_core::backup::BackupFormat;
use cubicweb_core::config::BackupPolicy;
use cubicweb_core::instance::{Instance, UpgradeOptions};
use cubicweb_core::migrate::StdinPrompter;
use cubicweb_core::progress::IndicatifReporter;

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum BackupChoice {
    Ask,
    Always,
    Never,
}

impl From<BackupChoice> for BackupPolicy {
    fn from(choice: BackupChoice) -> Self {
        match choice {
            BackupChoice::Ask => Self::Ask,
            BackupChoice::Always => Self::Always,
            BackupChoice::Never => Self::Never,
        }
    }
}

#[derive(Args, Debug)]
pub struct UpgradeArgs {
    /// Answer yes to every question
    #[arg(short, long)]
    pub yes: bool,

    /// Backup policy (default: from the instance configuration)
    #[arg(long, value_enum)]
    pub backup: Option<BackupChoice>,

    /// Backup archive format: native or portable
    #[arg(long, default_value = "native")]
    pub backup_format: BackupFormat,
}

pub fn run(instance: &Instance, args: &UpgradeArgs, interrupted: &Arc<AtomicBool>) -> anyhow::Result<i32> {
    let source = super::open(instance)?;
    let mut options = UpgradeOptions::from_config(instance.config());
    if args.yes {
        options.interactive = false;
    }
    if let Some(choice) = args.backup {
        options.backup = choice.into();
    }
    options.backup_format = args.backup_format;

    let progress = IndicatifReporter::new();
    let stdin = StdinPrompter::new(Arc::clone(interrupted));
    let outcome = instance.upgrade(&source, &options, &stdin, &progress)?;

    if let Some(path) = &outcome.backup {
        println!("Backup written to {}", path.display());
    }
    if outcome.upgrades.is_empty() {
        println!("Instance {} is up to date", instance.name());
        return Ok(0);
    }
    println!("Instance {} upgraded", instance.name());
    for upgrade in &outcome.upgrades {
        println!("  {:<20} {} -> {}", upgrade.cube, upgrade.from, upgrade.to);
    }
    Ok(0)
}
