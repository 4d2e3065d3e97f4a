//! `debug-application <wrapper> <id> [url]`

#![allow(unsafe_code)]

use crate::commands::start_application::{parse_id, wait_until_running};
use crate::context::Context;
use anyhow::{bail, Result};
use clap::Args;
use console::style;

/// Arguments for `debug-application`.
#[derive(Args, Debug)]
pub struct DebugApplicationArgs {
    /// Debug wrapper specification, e.g. "gdbserver :5555 %program% %arguments%"
    pub wrapper: String,
    /// Application identifier
    pub id: String,
    /// Optional document URL handed to the application
    pub url: Option<String>,

    /// Let the application inherit this terminal's stdin
    #[arg(short = 'i', long)]
    pub stdin: bool,
    /// Let the application inherit this terminal's stdout
    #[arg(short = 'o', long)]
    pub stdout: bool,
    /// Let the application inherit this terminal's stderr
    #[arg(short = 'e', long)]
    pub stderr: bool,
}

/// Run the command.
pub fn run(context: &Context, args: &DebugApplicationArgs) -> Result<()> {
    let app_id = parse_id(&args.id)?;

    let stdio = inherited_stdio(args.stdin, args.stdout, args.stderr);
    let started = context.manager.start_application_internal(
        &app_id,
        args.url.as_deref(),
        None,
        Some(&args.wrapper),
        stdio,
    )?;
    if !started {
        bail!("could not start application {app_id}");
    }
    wait_until_running(context, &app_id)?;
    println!("{} debugging {app_id}", style("ok:").green().bold());
    Ok(())
}

/// Duplicate the requested terminal descriptors; ownership of the
/// duplicates transfers into the application manager.
fn inherited_stdio(stdin: bool, stdout: bool, stderr: bool) -> Vec<i32> {
    let flags = [stdin, stdout, stderr];
    if !flags.iter().any(|&f| f) {
        return Vec::new();
    }
    #[cfg(unix)]
    {
        flags
            .iter()
            .enumerate()
            .map(|(fd, &inherit)| {
                if inherit {
                    unsafe { libc::dup(fd as i32) }
                } else {
                    -1
                }
            })
            .collect()
    }
    #[cfg(not(unix))]
    Vec::new()
}
