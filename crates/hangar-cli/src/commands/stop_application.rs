//! `stop-application <id>`

use crate::commands::start_application::parse_id;
use crate::context::Context;
use anyhow::{bail, Result};
use clap::Args;
use console::style;
use hangar_manager::RunState;
use std::time::{Duration, Instant};

/// Arguments for `stop-application`.
#[derive(Args, Debug)]
pub struct StopApplicationArgs {
    /// Application identifier
    pub id: String,
    /// Send SIGKILL instead of a graceful stop
    #[arg(short, long)]
    pub force: bool,
}

/// Run the command.
pub fn run(context: &Context, args: &StopApplicationArgs) -> Result<()> {
    let app_id = parse_id(&args.id)?;
    let Some(app) = context.manager.application(&app_id) else {
        bail!("unknown application {app_id}");
    };
    if app.run_state() == RunState::NotRunning {
        println!("{} {app_id} is not running", style("note:").yellow().bold());
        return Ok(());
    }

    context.manager.stop_application(&app_id, args.force);

    let deadline = Instant::now() + Duration::from_secs(10);
    while app.run_state() != RunState::NotRunning {
        if Instant::now() > deadline {
            bail!("timed out waiting for application {app_id} to stop");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    println!("{} stopped {app_id}", style("ok:").green().bold());
    Ok(())
}
