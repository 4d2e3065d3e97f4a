//! Live application and package aggregates.
//!
//! A [`Package`] is the live counterpart of a
//! [`PackageInfo`](hangar_database::PackageInfo): the immutable descriptor
//! plus mutable state (blocking, update progress) and the [`Application`]
//! objects it declares. Packages own their applications; the application
//! manager holds non-owning references.

use hangar_database::{ApplicationInfo, PackageInfo};
use hangar_core::PackageId;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

/// Run state of one application, monotonic along
/// `NotRunning → StartingUp → Running → ShuttingDown → NotRunning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    /// No process exists for the application.
    #[default]
    NotRunning,
    /// The process is being created and initialized.
    StartingUp,
    /// The application is up.
    Running,
    /// The application is winding down.
    ShuttingDown,
}

/// How the last run of an application ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitStatus {
    /// Clean exit.
    #[default]
    NormalExit,
    /// Terminated by a signal/crash.
    CrashExit,
    /// Terminated on request of the application manager.
    ForcedExit,
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NormalExit => "NormalExit",
            Self::CrashExit => "CrashExit",
            Self::ForcedExit => "ForcedExit",
        };
        f.write_str(name)
    }
}

/// Exit code and status of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    /// Process exit code.
    pub code: i32,
    /// Exit classification.
    pub status: ExitStatus,
}

/// The live view of one declared application.
#[derive(Debug)]
pub struct Application {
    info: ApplicationInfo,
    package_id: PackageId,
    base_dir: PathBuf,
    state: Mutex<RunState>,
    last_exit: Mutex<ExitInfo>,
    block_count: AtomicI32,
    document_url: Mutex<Option<String>>,
}

impl Application {
    fn new(info: ApplicationInfo, package_id: PackageId, base_dir: PathBuf) -> Self {
        Self {
            info,
            package_id,
            base_dir,
            state: Mutex::new(RunState::NotRunning),
            last_exit: Mutex::new(ExitInfo::default()),
            block_count: AtomicI32::new(0),
            document_url: Mutex::new(None),
        }
    }

    /// The application identifier.
    #[must_use]
    pub fn id(&self) -> &PackageId {
        self.info.id.as_ref().unwrap_or(&self.package_id)
    }

    /// The identifier of the owning package.
    #[must_use]
    pub fn package_id(&self) -> &PackageId {
        &self.package_id
    }

    /// The immutable manifest data.
    #[must_use]
    pub fn info(&self) -> &ApplicationInfo {
        &self.info
    }

    /// Absolute path of the entry point.
    #[must_use]
    pub fn code_file_path(&self) -> PathBuf {
        self.base_dir.join(&self.info.code)
    }

    /// The package base directory.
    #[must_use]
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// The runtime identifier this application wants.
    #[must_use]
    pub fn runtime_name(&self) -> &str {
        &self.info.runtime
    }

    /// Current run state.
    #[must_use]
    pub fn run_state(&self) -> RunState {
        *self.state.lock()
    }

    pub(crate) fn set_run_state(&self, state: RunState) {
        *self.state.lock() = state;
    }

    /// Exit code and status of the previous run.
    #[must_use]
    pub fn last_exit(&self) -> ExitInfo {
        *self.last_exit.lock()
    }

    pub(crate) fn set_last_exit(&self, exit: ExitInfo) {
        *self.last_exit.lock() = exit;
    }

    /// Whether the application is blocked (e.g. while its package is being
    /// updated or removed).
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.block_count.load(Ordering::SeqCst) > 0
    }

    /// Block the application; returns `false` if it was already blocked by
    /// this caller's level.
    pub fn block(&self) -> bool {
        self.block_count.fetch_add(1, Ordering::SeqCst) == 0
    }

    /// Undo one block level; returns `true` when the application became
    /// unblocked.
    pub fn unblock(&self) -> bool {
        self.block_count.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// The default document URL delivered on plain starts.
    #[must_use]
    pub fn document_url(&self) -> Option<String> {
        self.document_url.lock().clone()
    }

    /// Set the default document URL.
    pub fn set_document_url(&self, url: Option<String>) {
        *self.document_url.lock() = url;
    }

    /// Whether this application handles `mime_type`.
    #[must_use]
    pub fn handles_mime_type(&self, mime_type: &str) -> bool {
        self.info.mime_types.iter().any(|m| m == mime_type)
    }
}

/// The live aggregate of one package: descriptor plus applications plus
/// mutable state.
#[derive(Debug)]
pub struct Package {
    id: PackageId,
    info: Arc<PackageInfo>,
    applications: Vec<Arc<Application>>,
    update_progress: Mutex<f64>,
    updating: AtomicU32,
}

impl Package {
    /// Build the live aggregate for `info`, creating one [`Application`]
    /// per declared application.
    #[must_use]
    pub fn new(info: Arc<PackageInfo>) -> Arc<Self> {
        let package_id = info
            .package_id()
            .cloned()
            .unwrap_or_else(|| PackageId::parse("invalid.package").expect("static id is valid"));
        let applications = info
            .effective_applications()
            .into_iter()
            .map(|app_info| {
                Arc::new(Application::new(
                    app_info,
                    package_id.clone(),
                    info.base_dir.clone(),
                ))
            })
            .collect();
        Arc::new(Self {
            id: package_id,
            info,
            applications,
            update_progress: Mutex::new(0.0),
            updating: AtomicU32::new(0),
        })
    }

    /// The package identifier.
    #[must_use]
    pub fn id(&self) -> &PackageId {
        &self.id
    }

    /// The immutable descriptor.
    #[must_use]
    pub fn info(&self) -> &Arc<PackageInfo> {
        &self.info
    }

    /// The applications owned by this package.
    #[must_use]
    pub fn applications(&self) -> &[Arc<Application>] {
        &self.applications
    }

    /// Whether the package ships with the system image.
    #[must_use]
    pub fn is_built_in(&self) -> bool {
        self.info.built_in
    }

    /// Whether the package can be removed by the installer.
    #[must_use]
    pub fn is_removable(&self) -> bool {
        !self.info.built_in
    }

    /// Whether an update is currently in flight.
    #[must_use]
    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst) > 0
    }

    /// Mark the begin/end of an update; blocks/unblocks all applications.
    pub fn set_updating(&self, updating: bool) {
        if updating {
            self.updating.fetch_add(1, Ordering::SeqCst);
            for app in &self.applications {
                app.block();
            }
        } else {
            self.updating.fetch_sub(1, Ordering::SeqCst);
            for app in &self.applications {
                app.unblock();
            }
        }
    }

    /// Progress of the in-flight update in `[0, 1]`.
    #[must_use]
    pub fn update_progress(&self) -> f64 {
        *self.update_progress.lock()
    }

    /// Set the update progress.
    pub fn set_update_progress(&self, progress: f64) {
        *self.update_progress.lock() = progress.clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn info() -> Arc<PackageInfo> {
        let manifest = "\
formatType: am-package
formatVersion: 1
---
id: com.example.pkg
displayName:
  en: Pkg
applications:
- id: com.example.pkg.a
  code: a.qml
  runtime: qml
- id: com.example.pkg.b
  code: b
  runtime: process
";
        let mut info =
            PackageInfo::from_manifest_bytes(manifest.as_bytes(), Path::new("info.yaml")).unwrap();
        info.base_dir = PathBuf::from("/apps/com.example.pkg");
        Arc::new(info)
    }

    #[test]
    fn package_creates_one_application_per_declaration() {
        let package = Package::new(info());
        assert_eq!(package.applications().len(), 2);
        assert_eq!(package.id().as_str(), "com.example.pkg");

        let app = &package.applications()[0];
        assert_eq!(app.id().as_str(), "com.example.pkg.a");
        assert_eq!(
            app.code_file_path(),
            PathBuf::from("/apps/com.example.pkg/a.qml")
        );
        assert_eq!(app.run_state(), RunState::NotRunning);
    }

    #[test]
    fn blocking_is_counted() {
        let package = Package::new(info());
        let app = &package.applications()[0];
        assert!(!app.is_blocked());
        assert!(app.block());
        assert!(!app.block());
        assert!(!app.unblock());
        assert!(app.is_blocked());
        assert!(app.unblock());
        assert!(!app.is_blocked());
    }

    #[test]
    fn updating_blocks_all_applications() {
        let package = Package::new(info());
        package.set_updating(true);
        assert!(package.is_updating());
        assert!(package.applications().iter().all(|a| a.is_blocked()));
        package.set_updating(false);
        assert!(!package.is_updating());
        assert!(package.applications().iter().all(|a| !a.is_blocked()));
    }
}
