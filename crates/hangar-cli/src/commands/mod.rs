//! CLI commands for the Hangar controller.

pub mod debug_application;
pub mod install_package;
pub mod list_applications;
pub mod show_application;
pub mod start_application;
pub mod stop_application;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Hangar controller - manage packages and applications
#[derive(Parser, Debug)]
#[command(name = "hangar-controller")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// System root directory
    #[arg(long, global = true, env = "HANGAR_ROOT", default_value = "/var/lib/hangar")]
    pub root: PathBuf,

    /// Accept packages without any signature
    #[arg(long, global = true)]
    pub allow_unsigned: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install a package from a file (or stdin with "-")
    #[command(name = "install-package")]
    InstallPackage(install_package::InstallPackageArgs),

    /// Start an application
    #[command(name = "start-application")]
    StartApplication(start_application::StartApplicationArgs),

    /// Start an application under a debug wrapper
    #[command(name = "debug-application")]
    DebugApplication(debug_application::DebugApplicationArgs),

    /// Stop an application
    #[command(name = "stop-application")]
    StopApplication(stop_application::StopApplicationArgs),

    /// List all applications
    #[command(name = "list-applications")]
    ListApplications(list_applications::ListApplicationsArgs),

    /// Show application meta-data
    #[command(name = "show-application")]
    ShowApplication(show_application::ShowApplicationArgs),
}
