use cubicweb_core::error::{ConfigError, CwError};
use cubicweb_core::instance::Instance;

pub fn run(instance: &Instance) -> anyhow::Result<i32> {
    let solution = instance.dependency_problem().solve();
    for warning in &solution.warnings {
        println!("warning: {warning}");
    }
    for unresolved in &solution.unresolved {
        println!("unresolved: {unresolved}");
    }
    if !solution.is_consistent() {
        let errors = solution.errors.iter().map(ToString::to_string).collect();
        return Err(CwError::from(ConfigError::Dependencies(errors)).into());
    }
    println!("Dependencies satisfied, load order:");
    for cube in instance.cubes() {
        println!("  {:<20} {}", cube.name, cube.version);
    }
    Ok(0)
}
