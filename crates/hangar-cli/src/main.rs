//! Hangar controller - manage packages and applications from the command
//! line.
//!
//! Exit codes: 0 on success, 1 for argument/usage errors, 2 for operation
//! failures, 3 for internal errors.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod commands;
mod config;
mod context;

use clap::Parser;
use commands::{Cli, Commands};
use console::style;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // help/version are not usage errors
            if e.use_stderr() {
                let _ = e.print();
                return ExitCode::from(1);
            }
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
    };

    // Initialize tracing
    let filter = EnvFilter::builder()
        .with_default_directive(
            if cli.verbose {
                Level::DEBUG
            } else {
                Level::WARN
            }
            .into(),
        )
        .from_env_lossy();
    let plain_output = std::env::var_os("HANGAR_LOG_PLAIN").is_some();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!plain_output)
        .with_target(false)
        .without_time()
        .init();

    let result = std::panic::catch_unwind(|| run_command(&cli));
    match result {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            eprintln!("{} {e:#}", style("error:").red().bold());
            ExitCode::from(2)
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<String>()
                .map(String::as_str)
                .or_else(|| panic.downcast_ref::<&str>().copied())
                .unwrap_or("unknown internal error");
            eprintln!("{} internal error: {message}", style("error:").red().bold());
            ExitCode::from(3)
        }
    }
}

fn run_command(cli: &Cli) -> anyhow::Result<()> {
    let context = context::open(&cli.root, cli.allow_unsigned)?;
    match &cli.command {
        Commands::InstallPackage(args) => commands::install_package::run(&context, args),
        Commands::StartApplication(args) => commands::start_application::run(&context, args),
        Commands::DebugApplication(args) => commands::debug_application::run(&context, args),
        Commands::StopApplication(args) => commands::stop_application::run(&context, args),
        Commands::ListApplications(args) => commands::list_applications::run(&context, args),
        Commands::ShowApplication(args) => commands::show_application::run(&context, args),
    }
}
