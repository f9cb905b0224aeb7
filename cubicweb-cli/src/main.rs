use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use cubicweb_core::error::{CwError, MigrationError};

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "cubicweb-ctl",
    version,
    about = "Create, upgrade and maintain CubicWeb instances"
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    /// Instance configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "CW_INSTANCE",
        default_value = "instance.toml"
    )]
    instance: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

/// Classify an error into a process exit code.
///
///   2: aborted by the user
///   4: configuration or execution error
///   8: unexpected error
///
/// An `exit` command in a migration script supplies its own status.
fn classify_exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<CwError>() {
        Some(CwError::Migration(MigrationError::Aborted)) => 2,
        Some(CwError::Migration(MigrationError::Exit(status))) => *status,
        Some(_) => 4,
        None => 8,
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (_, 0) => "warn",
        (_, 1) => "info",
        (_, 2) => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let interrupted = Arc::new(AtomicBool::new(false));
    if cli.command.prompts() {
        let flag = Arc::clone(&interrupted);
        // A second Ctrl-C leaves without waiting for the pending step.
        let handler = move || {
            if flag.swap(true, Ordering::SeqCst) {
                std::process::exit(2);
            }
        };
        if let Err(e) = ctrlc::set_handler(handler) {
            tracing::warn!("Cannot install the interrupt handler: {e}");
        }
    }

    match commands::run(cli.command, &cli.instance, &interrupted) {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(classify_exit_code(&e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cubicweb_core::error::ConfigError;

    #[test]
    fn exit_code_abort() {
        let err = anyhow::Error::from(CwError::from(MigrationError::Aborted));
        assert_eq!(classify_exit_code(&err), 2);
    }

    #[test]
    fn exit_code_script_status() {
        let err = anyhow::Error::from(CwError::from(MigrationError::Exit(5)))
            .context("Upgrade of demo failed");
        assert_eq!(classify_exit_code(&err), 5);
    }

    #[test]
    fn exit_code_config() {
        let err = anyhow::Error::from(CwError::from(ConfigError::NotFound("instance.toml".into())));
        assert_eq!(classify_exit_code(&err), 4);
    }

    #[test]
    fn only_confirming_commands_trap_interrupts() {
        let upgrade = Cli::parse_from(["cubicweb-ctl", "upgrade"]);
        assert!(upgrade.command.prompts());
        let unattended = Cli::parse_from(["cubicweb-ctl", "upgrade", "--yes"]);
        assert!(!unattended.command.prompts());
        let check = Cli::parse_from(["cubicweb-ctl", "check"]);
        assert!(!check.command.prompts());
    }

    #[test]
    fn exit_code_unexpected() {
        let err = anyhow::anyhow!("Something unexpected happened");
        assert_eq!(classify_exit_code(&err), 8);
    }
}
