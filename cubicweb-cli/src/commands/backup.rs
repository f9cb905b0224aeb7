use std::path::PathBuf;

use clap::Args;

use cubicweb_core::backup::BackupFormat;
use cubicweb_core::instance::Instance;

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Archive format: native or portable
    #[arg(long, default_value = "native")]
    pub format: BackupFormat,
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Archive written by `cubicweb-ctl backup`
    pub archive: PathBuf,
}

pub fn run(instance: &Instance, args: &BackupArgs) -> anyhow::Result<i32> {
    let source = super::open(instance)?;
    let path = instance.backup(&source, args.format)?;
    println!("{}", path.display());
    Ok(0)
}

pub fn run_restore(instance: &Instance, args: &RestoreArgs) -> anyhow::Result<i32> {
    let source = super::open(instance)?;
    let versions = instance.restore(&source, &args.archive)?;
    println!("Restored {}", args.archive.display());
    for (cube, version) in &versions {
        println!("  {cube:<20} {version}");
    }
    Ok(0)
}
