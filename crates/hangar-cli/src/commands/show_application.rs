//! `show-application <id>`

use crate::commands::start_application::parse_id;
use crate::context::Context;
use anyhow::{bail, Result};
use clap::Args;
use serde_json::json;

/// Arguments for `show-application`.
#[derive(Args, Debug)]
pub struct ShowApplicationArgs {
    /// Application identifier
    pub id: String,
    /// Emit JSON instead of YAML
    #[arg(long)]
    pub json: bool,
}

/// Run the command.
pub fn run(context: &Context, args: &ShowApplicationArgs) -> Result<()> {
    let app_id = parse_id(&args.id)?;
    let Some(app) = context.manager.application(&app_id) else {
        bail!("unknown application {app_id}");
    };
    let Some(package) = context.manager.package_of(&app_id) else {
        bail!("unknown application {app_id}");
    };

    let info = app.info();
    let meta = json!({
        "id": app.id().to_string(),
        "package": package.id().to_string(),
        "name": info.display_name,
        "icon": info.icon,
        "codeFilePath": app.code_file_path(),
        "runtimeName": app.runtime_name(),
        "runtimeParameters": serde_json::to_value(&info.runtime_parameters)?,
        "capabilities": info.capabilities,
        "categories": info.categories,
        "mimeTypes": info.mime_types,
        "version": package.info().version,
        "builtIn": package.is_built_in(),
        "isRunning": app.run_state() == hangar_manager::RunState::Running,
        "lastExitCode": app.last_exit().code,
        "lastExitStatus": app.last_exit().status.to_string(),
    });

    if args.json {
        println!("{}", serde_json::to_string_pretty(&meta)?);
    } else {
        print!("{}", serde_yaml::to_string(&meta)?);
    }
    Ok(())
}
