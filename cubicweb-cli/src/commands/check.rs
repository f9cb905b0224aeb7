use clap::Args;

use cubicweb_core::instance::Instance;
use cubicweb_core::integrity::Check;
use cubicweb_core::progress::IndicatifReporter;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Comma-separated checks to run (default: all)
    #[arg(long, value_delimiter = ',')]
    pub checks: Vec<Check>,

    /// Repair what can be repaired
    #[arg(long)]
    pub fix: bool,

    /// Rebuild the full-text index afterwards
    #[arg(long)]
    pub reindex: bool,
}

#[derive(Args, Debug)]
pub struct ReindexArgs {
    /// Entity types to reindex (default: every indexable type)
    pub etypes: Vec<String>,
}

pub fn run(instance: &Instance, args: &CheckArgs) -> anyhow::Result<i32> {
    let source = super::open(instance)?;
    let progress = IndicatifReporter::new();
    let report = instance.check(&source, &args.checks, args.fix, args.reindex, &progress)?;
    print!("{}", report.render());
    Ok(0)
}

pub fn run_indexes(instance: &Instance) -> anyhow::Result<i32> {
    let source = super::open(instance)?;
    let report = instance.check_indexes(&source)?;
    print!("{}", report.render());
    Ok(report.status())
}

pub fn run_reindex(instance: &Instance, args: &ReindexArgs) -> anyhow::Result<i32> {
    let source = super::open(instance)?;
    let progress = IndicatifReporter::new();
    let etypes = (!args.etypes.is_empty()).then_some(args.etypes.as_slice());
    let count = instance.reindex(&source, etypes, &progress)?;
    println!("{count} entities reindexed");
    Ok(0)
}
