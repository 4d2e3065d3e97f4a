//! `list-applications`

use crate::context::Context;
use anyhow::Result;
use clap::Args;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Table};
use hangar_manager::{Role, RoleValue};

/// Arguments for `list-applications`.
#[derive(Args, Debug)]
pub struct ListApplicationsArgs {
    /// Print only the application identifiers
    #[arg(short, long)]
    pub quiet: bool,
}

/// Run the command.
pub fn run(context: &Context, args: &ListApplicationsArgs) -> Result<()> {
    if args.quiet {
        for id in context.manager.application_ids() {
            println!("{id}");
        }
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(["Id", "Name", "Version", "Runtime", "State", "Removable"]);

    for row in 0..context.manager.count() {
        let cell = |role| match context.manager.data(row, role) {
            Some(RoleValue::String(s)) => s,
            Some(RoleValue::Bool(b)) => if b { "yes" } else { "no" }.to_owned(),
            Some(other) => format!("{other:?}"),
            None => String::new(),
        };
        let state = match (
            context.manager.data(row, Role::IsRunning),
            context.manager.data(row, Role::IsStartingUp),
            context.manager.data(row, Role::IsShuttingDown),
        ) {
            (Some(RoleValue::Bool(true)), _, _) => "running",
            (_, Some(RoleValue::Bool(true)), _) => "starting",
            (_, _, Some(RoleValue::Bool(true))) => "stopping",
            _ => "stopped",
        };
        table.add_row(vec![
            Cell::new(cell(Role::Id)),
            Cell::new(cell(Role::Name)),
            Cell::new(cell(Role::Version)),
            Cell::new(cell(Role::RuntimeName)),
            Cell::new(state),
            Cell::new(cell(Role::IsRemovable)),
        ]);
    }
    println!("{table}");
    Ok(())
}
