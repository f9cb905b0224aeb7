use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::Args;

use cubicweb_core::instance::Instance;
use cubicweb_core::migrate::{Prompter, StdinPrompter};

#[derive(Args, Debug)]
pub struct ShellArgs {
    /// Migration script (.mig, .sql, .txt or .rst)
    pub script: PathBuf,

    /// Do not ask for confirmation
    #[arg(short, long)]
    pub yes: bool,
}

pub fn run(instance: &Instance, args: &ShellArgs, interrupted: &Arc<AtomicBool>) -> anyhow::Result<i32> {
    let source = super::open(instance)?;
    let stdin = StdinPrompter::new(Arc::clone(interrupted));
    let prompter: Option<&dyn Prompter> = if args.yes { None } else { Some(&stdin) };
    instance.run_script(&source, &args.script, prompter)?;
    println!("{} executed", args.script.display());
    Ok(0)
}
