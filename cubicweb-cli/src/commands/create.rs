use clap::Args;

use cubicweb_core::instance::Instance;

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Only print the cubes that would be installed
    #[arg(long)]
    pub dry_run: bool,
}

pub fn run(instance: &Instance, args: &CreateArgs) -> anyhow::Result<i32> {
    if args.dry_run {
        for cube in instance.cubes() {
            println!("{} {}", cube.name, cube.version);
        }
        return Ok(0);
    }
    instance.create()?;
    println!(
        "Instance {} created in {}",
        instance.name(),
        instance.config().database_path().display()
    );
    for (cube, version) in instance.fs_versions() {
        println!("  {cube:<20} {version}");
    }
    Ok(0)
}
