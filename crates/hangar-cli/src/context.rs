//! The root context: database, installer and application manager wired
//! together over one system root directory.
//!
//! The management IPC surface is provided by a separate layer; this tool
//! constructs the whole stack in-process and operates on it directly.

use anyhow::{Context as _, Result};
use hangar_database::{Locations, PackageDatabase};
use hangar_installer::{ensure_installation_secret, PackageManager, SigningPolicy};
use hangar_manager::{
    ApplicationManager, ApplicationManagerConfig, ContainerFactory, InProcessRuntimeManager,
    ProcessContainerManager, ProcessRuntimeManager, QuickLaunch, QuickLaunchConfig,
    RuntimeFactory,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// All collaborating subsystems over one system root.
pub struct Context {
    /// The package database.
    pub database: PackageDatabase,
    /// The installer front-end.
    pub installer: PackageManager,
    /// The application manager.
    pub manager: ApplicationManager,
    /// The quick-launch pool.
    pub quick_launch: Arc<QuickLaunch>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

/// Directory layout below the system root.
fn layout(root: &Path) -> (PathBuf, PathBuf, PathBuf, PathBuf, PathBuf) {
    (
        root.join("builtin-packages"),
        root.join("installed-packages"),
        root.join("documents"),
        root.join("cache"),
        root.join("config"),
    )
}

/// Build the full stack over `root`.
pub fn open(root: &Path, allow_unsigned: bool) -> Result<Context> {
    let (builtin_dir, installed_dir, documents_dir, cache_dir, config_dir) = layout(root);
    std::fs::create_dir_all(&builtin_dir)
        .with_context(|| format!("cannot create {}", builtin_dir.display()))?;
    std::fs::create_dir_all(&installed_dir)
        .with_context(|| format!("cannot create {}", installed_dir.display()))?;

    let config = crate::config::load(&config_dir, &cache_dir)?;
    let secret = ensure_installation_secret(&installed_dir)?;

    let database = PackageDatabase::builder()
        .built_in_dir(&builtin_dir)
        .installed_dir(&installed_dir)
        .cache_dir(&cache_dir)
        .report_key(secret)
        .build();
    database.enable_load_from_cache();
    database.enable_save_to_cache();
    database
        .parse(Locations::ALL)
        .context("parsing the package database failed")?;
    debug!(
        built_in = database.built_in_packages().len(),
        installed = database.installed_packages().len(),
        "package database parsed"
    );

    let container_factory = Arc::new(ContainerFactory::new());
    container_factory.register(Arc::new(ProcessContainerManager));
    let runtime_factory = Arc::new(RuntimeFactory::new());
    runtime_factory.register(Arc::new(ProcessRuntimeManager));
    runtime_factory.register(Arc::new(InProcessRuntimeManager::new("qml")));

    let manager = ApplicationManager::new(
        database.clone(),
        Arc::clone(&container_factory),
        Arc::clone(&runtime_factory),
        ApplicationManagerConfig {
            locale: config.locale.clone(),
            ..ApplicationManagerConfig::default()
        },
    );
    manager.set_container_selection_config(config.container_selection.clone());

    let quick_launch = QuickLaunch::new(
        container_factory,
        runtime_factory,
        QuickLaunchConfig {
            runtimes_per_container: config.quick_launch_runtimes_per_container,
            idle_load: config.quick_launch_idle_load,
            cpu_reader: None,
        },
    );
    manager.set_quick_launch(Arc::clone(&quick_launch));

    let installer = PackageManager::builder(database.clone())
        .documents_dir(documents_dir)
        .signing_policy(SigningPolicy {
            allow_unsigned,
            ..SigningPolicy::default()
        })
        .build()?;

    Ok(Context {
        database,
        installer,
        manager,
        quick_launch,
    })
}
