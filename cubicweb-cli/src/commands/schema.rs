use clap::Args;

use cubicweb_core::instance::Instance;
use cubicweb_core::sql::Dialect;

#[derive(Args, Debug)]
pub struct SchemaSqlArgs {
    /// Target backend: sqlite or postgres (default: the configured driver)
    #[arg(long)]
    pub dialect: Option<Dialect>,

    /// Also grant every schema table to a database user (default: the
    /// configured `[database] user`)
    #[arg(long, value_name = "USER")]
    pub grant: Option<Option<String>>,
}

pub fn run_sql(instance: &Instance, args: &SchemaSqlArgs) -> anyhow::Result<i32> {
    let dialect = args.dialect.unwrap_or(instance.config().database.driver);
    let grant = match &args.grant {
        None => None,
        Some(Some(user)) => Some(user.as_str()),
        Some(None) => match instance.config().database.user.as_deref() {
            Some(user) => Some(user),
            None => anyhow::bail!("--grant needs a user: none is configured in [database] user"),
        },
    };
    for stmt in instance.schema_sql(dialect, grant)? {
        println!("{stmt};");
    }
    Ok(0)
}

pub fn run_diff(instance: &Instance) -> anyhow::Result<i32> {
    let source = super::open(instance)?;
    let diff = instance.schema_diff(&source)?;
    if diff.is_empty() {
        println!("Installed schema matches the cube schemas");
    } else {
        print!("{diff}");
    }
    Ok(0)
}
