//! `start-application <id> [url]`

use crate::context::Context;
use anyhow::{bail, Result};
use clap::Args;
use console::style;
use hangar_core::PackageId;
use hangar_manager::RunState;
use std::time::{Duration, Instant};

/// Arguments for `start-application`.
#[derive(Args, Debug)]
pub struct StartApplicationArgs {
    /// Application identifier
    pub id: String,
    /// Optional document URL handed to the application
    pub url: Option<String>,
}

/// Run the command.
pub fn run(context: &Context, args: &StartApplicationArgs) -> Result<()> {
    let app_id = parse_id(&args.id)?;
    if !context
        .manager
        .start_application(&app_id, args.url.as_deref())
    {
        bail!("could not start application {app_id}");
    }
    wait_until_running(context, &app_id)?;
    let pid = context
        .manager
        .current_runtime(&app_id)
        .and_then(|rt| rt.process_id())
        .unwrap_or_default();
    println!("{} started {app_id} (pid {pid})", style("ok:").green().bold());
    Ok(())
}

pub(crate) fn parse_id(raw: &str) -> Result<PackageId> {
    PackageId::parse(raw).map_err(|reason| anyhow::anyhow!("not a valid application id: {reason}"))
}

pub(crate) fn wait_until_running(context: &Context, app_id: &PackageId) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let state = context
            .manager
            .application(app_id)
            .map(|app| app.run_state());
        match state {
            Some(RunState::Running) => return Ok(()),
            Some(RunState::NotRunning) if Instant::now() > deadline => {
                bail!("application {app_id} did not come up");
            }
            None => bail!("application {app_id} disappeared"),
            _ => {}
        }
        if Instant::now() > deadline {
            bail!("timed out waiting for application {app_id} to start");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
