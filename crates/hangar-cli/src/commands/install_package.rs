//! `install-package <file|->`

use crate::context::Context;
use anyhow::{bail, Result};
use clap::Args;
use console::style;
use hangar_installer::TaskEvent;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

/// Arguments for `install-package`.
#[derive(Args, Debug)]
pub struct InstallPackageArgs {
    /// Package file to install; "-" reads the archive from stdin
    pub package: PathBuf,
}

/// Run the command.
pub fn run(context: &Context, args: &InstallPackageArgs) -> Result<()> {
    let source: Box<dyn Read + Send> = if args.package.as_os_str() == "-" {
        Box::new(std::io::stdin())
    } else {
        Box::new(std::fs::File::open(&args.package)?)
    };

    let events = context.installer.event_stream();
    let task = context.installer.install_package(source);

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner} installing [{bar:30}] {percent}%")
            .expect("static template is valid")
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(120));

    loop {
        match events.recv() {
            Ok(TaskEvent::Progress { task: t, progress }) if t == task => {
                bar.set_position((progress * 100.0) as u64);
            }
            Ok(TaskEvent::RequestingInstallationAcknowledge {
                task: t,
                metadata,
            }) if t == task => {
                bar.set_message(metadata.package_id.to_string());
                context.installer.acknowledge_package_installation(&task);
            }
            Ok(TaskEvent::Finished { task: t }) if t == task => {
                bar.finish_and_clear();
                let package = context
                    .installer
                    .task_package_id(&task)
                    .map(|id| id.to_string())
                    .unwrap_or_default();
                println!("{} installed {package}", style("ok:").green().bold());
                return Ok(());
            }
            Ok(TaskEvent::Failed {
                task: t,
                kind,
                message,
            }) if t == task => {
                bar.finish_and_clear();
                bail!("installation failed ({kind}): {message}");
            }
            Ok(_) => {}
            Err(_) => bail!("the installer stopped unexpectedly"),
        }
    }
}
