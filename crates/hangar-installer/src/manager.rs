//! The installer front-end: task queue, policies and the commit protocol.

use crate::task::{TaskControl, TaskEvent, TaskId, TaskState};
use hangar_archive::{
    verify_signature, InstallationReport, PackageExtractor, PackageMetadata, SignatureRole,
};
use hangar_core::{Error, PackageId, Result, Signal};
use hangar_database::{PackageDatabase, PackageInfo};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Signature requirements applied during installation.
#[derive(Debug, Clone, Default)]
pub struct SigningPolicy {
    /// Accept packages without any signature.
    pub allow_unsigned: bool,
    /// Key verifying developer signatures (32 raw bytes).
    pub developer_verification_key: Option<Vec<u8>>,
    /// Key verifying store signatures (32 raw bytes).
    pub store_verification_key: Option<Vec<u8>>,
}

impl SigningPolicy {
    fn verify(&self, metadata: &PackageMetadata) -> Result<()> {
        let digest = hex::decode(&metadata.digest)
            .map_err(|_| Error::Cryptography("package digest is not valid hex".into()))?;

        match &metadata.developer_signature {
            Some(signature) => {
                let key = self.developer_verification_key.as_deref().ok_or_else(|| {
                    Error::Cryptography(
                        "package has a developer signature, but no verification key is configured"
                            .into(),
                    )
                })?;
                verify_signature(SignatureRole::Developer, &digest, signature, key)?;
            }
            None if metadata.store_signature.is_none() => {
                if !self.allow_unsigned {
                    return Err(Error::Package(
                        "cannot install unsigned packages".into(),
                    ));
                }
            }
            None => {}
        }

        if let Some(signature) = &metadata.store_signature {
            if let Some(key) = self.store_verification_key.as_deref() {
                // store signatures are bound to the device
                let mut signed = digest.clone();
                if let Some(hardware_id) = hangar_core::hardware_id() {
                    signed.extend_from_slice(hardware_id.as_bytes());
                }
                verify_signature(SignatureRole::Store, &signed, signature, key)?;
            } else {
                warn!("package has a store signature, but no verification key is configured");
            }
        }
        Ok(())
    }
}

enum Job {
    Install {
        source: Box<dyn Read + Send>,
    },
    Remove {
        package_id: PackageId,
        purge_documents: bool,
    },
}

struct Inner {
    database: PackageDatabase,
    installed_dir: PathBuf,
    documents_dir: Option<PathBuf>,
    policy: SigningPolicy,
    report_key: Vec<u8>,

    tasks: Mutex<HashMap<TaskId, Arc<TaskControl>>>,
    queue: Mutex<VecDeque<(Arc<TaskControl>, Job)>>,
    executing: Mutex<Option<TaskId>>,
    events: Arc<Signal<TaskEvent>>,
}

/// Drives asynchronous installation and removal tasks against one package
/// database. Cheap to clone; all clones share the queue.
#[derive(Clone)]
pub struct PackageManager {
    inner: Arc<Inner>,
}

/// Configuration for constructing a [`PackageManager`].
#[derive(Debug)]
pub struct PackageManagerBuilder {
    database: PackageDatabase,
    documents_dir: Option<PathBuf>,
    policy: SigningPolicy,
}

impl PackageManagerBuilder {
    /// Where user documents of packages live (for `purge_documents`).
    #[must_use]
    pub fn documents_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.documents_dir = Some(dir.into());
        self
    }

    /// Signature requirements for installations.
    #[must_use]
    pub fn signing_policy(mut self, policy: SigningPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Build the manager.
    ///
    /// # Errors
    /// Fails if the database has no installed directory configured.
    pub fn build(self) -> Result<PackageManager> {
        let installed_dir = self
            .database
            .installed_dir()
            .ok_or_else(|| {
                Error::Package("cannot install packages without an installation directory".into())
            })?
            .to_path_buf();
        let report_key = self.database.report_key().to_vec();
        Ok(PackageManager {
            inner: Arc::new(Inner {
                database: self.database,
                installed_dir,
                documents_dir: self.documents_dir,
                policy: self.policy,
                report_key,
                tasks: Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                executing: Mutex::new(None),
                events: Arc::new(Signal::new()),
            }),
        })
    }
}

impl PackageManager {
    /// Start building a manager operating on `database`.
    #[must_use]
    pub fn builder(database: PackageDatabase) -> PackageManagerBuilder {
        PackageManagerBuilder {
            database,
            documents_dir: None,
            policy: SigningPolicy::default(),
        }
    }

    /// The task event signal. Events are emitted from task worker threads.
    #[must_use]
    pub fn events(&self) -> &Signal<TaskEvent> {
        &self.inner.events
    }

    /// A channel receiving a copy of every task event; convenient for
    /// sequential consumers.
    #[must_use]
    pub fn event_stream(&self) -> crossbeam_channel::Receiver<TaskEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.inner.events.connect(move |event: &TaskEvent| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    /// Enqueue an installation from a byte stream.
    pub fn install_package(&self, source: Box<dyn Read + Send>) -> TaskId {
        self.enqueue(Job::Install { source })
    }

    /// Enqueue an installation from an archive file.
    ///
    /// # Errors
    /// Fails immediately if the file cannot be opened.
    pub fn install_package_from_file(&self, path: &Path) -> Result<TaskId> {
        let file = fs::File::open(path).map_err(|e| Error::io(path, e))?;
        Ok(self.install_package(Box::new(file)))
    }

    /// Enqueue a removal. Unless `purge_documents` is set, the package's
    /// document directory is preserved.
    pub fn remove_package(&self, package_id: PackageId, purge_documents: bool) -> TaskId {
        self.enqueue(Job::Remove {
            package_id,
            purge_documents,
        })
    }

    /// Let an installation waiting in `AwaitingAcknowledge` proceed to the
    /// commit phase.
    pub fn acknowledge_package_installation(&self, task: &TaskId) {
        if let Some(control) = self.inner.tasks.lock().get(task) {
            control.resolve_acknowledge(true);
        }
    }

    /// Cancel a task: force-cancel while still `Queued`, cooperative
    /// cancellation afterwards. Returns `false` for unknown or already
    /// terminal tasks.
    pub fn cancel_task(&self, task: &TaskId) -> bool {
        // force-cancel: remove from the queue
        {
            let mut queue = self.inner.queue.lock();
            if let Some(pos) = queue.iter().position(|(c, _)| c.id == *task) {
                let (control, _) = queue.remove(pos).expect("position is valid");
                drop(queue);
                control.fail(&Error::Canceled);
                return true;
            }
        }

        let control = {
            let tasks = self.inner.tasks.lock();
            tasks.get(task).cloned()
        };
        match control {
            Some(control) if !control.state().is_terminal() => {
                control.cancel.cancel();
                control.resolve_acknowledge(false);
                true
            }
            _ => false,
        }
    }

    /// Current state of a task, if known.
    #[must_use]
    pub fn task_state(&self, task: &TaskId) -> Option<TaskState> {
        self.inner.tasks.lock().get(task).map(|c| c.state())
    }

    /// The package id a task is operating on, once known.
    #[must_use]
    pub fn task_package_id(&self, task: &TaskId) -> Option<PackageId> {
        self.inner.tasks.lock().get(task).and_then(|c| c.package_id())
    }

    /// Block until `task` reaches a terminal state.
    ///
    /// # Errors
    /// Returns the failure message for failed tasks.
    pub fn wait_for_task(&self, task: &TaskId) -> Result<()> {
        let rx = self.event_stream();
        // the task may already be terminal
        loop {
            match self.task_state(task) {
                Some(TaskState::Finished) => return Ok(()),
                Some(TaskState::Failed) => {
                    return Err(Error::Package(format!("task {task} failed")));
                }
                _ => {}
            }
            match rx.recv() {
                Ok(TaskEvent::Finished { task: t }) if t == *task => return Ok(()),
                Ok(TaskEvent::Failed { task: t, message, .. }) if t == *task => {
                    return Err(Error::Package(message));
                }
                Ok(_) => {}
                Err(_) => return Err(Error::Package(format!("task {task} disappeared"))),
            }
        }
    }

    fn enqueue(&self, job: Job) -> TaskId {
        let control = TaskControl::new(Arc::clone(&self.inner.events));
        let id = control.id.clone();
        self.inner
            .tasks
            .lock()
            .insert(id.clone(), Arc::clone(&control));
        self.inner.events.emit(&TaskEvent::StateChanged {
            task: id.clone(),
            state: TaskState::Queued,
        });
        self.inner.queue.lock().push_back((control, job));
        self.execute_next();
        id
    }

    fn execute_next(&self) {
        let (control, job) = {
            let mut executing = self.inner.executing.lock();
            if executing.is_some() {
                return;
            }
            let Some((control, job)) = self.inner.queue.lock().pop_front() else {
                return;
            };
            *executing = Some(control.id.clone());
            (control, job)
        };

        let manager = self.clone();
        let control_for_thread = control.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("installer-task-{}", control.id))
            .spawn(move || {
                manager.run_task(&control_for_thread, job);
                *manager.inner.executing.lock() = None;
                manager.execute_next();
            });
        if let Err(e) = spawned {
            warn!("could not spawn installer task thread: {e}");
            *self.inner.executing.lock() = None;
            control.fail(&Error::Package(format!("could not start task: {e}")));
        }
    }

    fn run_task(&self, control: &Arc<TaskControl>, job: Job) {
        control.set_state(TaskState::Executing);
        let result = match job {
            Job::Install { source } => self.run_install(control, source),
            Job::Remove {
                package_id,
                purge_documents,
            } => self.run_remove(control, &package_id, purge_documents),
        };
        match result {
            Ok(()) => control.finish(),
            Err(e) => {
                if !matches!(e, Error::Canceled) {
                    warn!(task = %control.id, "task failed: {e}");
                }
                control.fail(&e);
            }
        }
    }

    fn run_install(&self, control: &Arc<TaskControl>, source: Box<dyn Read + Send>) -> Result<()> {
        let inner = &self.inner;
        control.set_state(TaskState::Installing);

        let staging_root = inner.installed_dir.clone();
        fs::create_dir_all(&staging_root).map_err(|e| Error::io(&staging_root, e))?;

        let progress_control = Arc::clone(control);
        let staging_path: Arc<Mutex<Option<PathBuf>>> = Arc::new(Mutex::new(None));
        let staging_record = Arc::clone(&staging_path);
        let extractor = PackageExtractor::new_deferred(source, move |header| {
            let staging = staging_root.join(format!("{}+", header.package_id));
            if staging.exists() {
                // stale leftover from a crashed installation
                fs::remove_dir_all(&staging).map_err(|e| Error::io(&staging, e))?;
            }
            *staging_record.lock() = Some(staging.clone());
            Ok(staging)
        })
        .on_progress(move |p| progress_control.report_progress(p));

        let extracted = match extractor.extract(&control.cancel) {
            Ok(extracted) => extracted,
            Err(e) => {
                // the extractor empties the staging directory; remove the
                // directory itself so the installed tree is untouched
                if let Some(path) = staging_path.lock().take() {
                    let _ = fs::remove_dir_all(&path);
                }
                return Err(e);
            }
        };
        let package_id = extracted.metadata.package_id.clone();
        control.set_package_id(package_id.clone());
        let mut staging = StagingGuard::new(extracted.destination.clone());

        debug!(package = %package_id, files = extracted.files.len(), "package extracted");

        inner.policy.verify(&extracted.metadata)?;

        // cross-check the staged manifest before anything becomes visible
        let manifest_path = extracted.destination.join("info.yaml");
        let mut info = PackageInfo::from_manifest(&manifest_path)?;
        if info.package_id() != Some(&package_id) {
            return Err(Error::Package(format!(
                "the package id in the manifest ({}) does not match the archive header ({package_id})",
                info.package_id().map(PackageId::as_str).unwrap_or_default()
            )));
        }
        if info.built_in {
            return Err(Error::Package(
                "cannot install a package that claims to be built-in".into(),
            ));
        }

        let mut report = InstallationReport::new(package_id.clone());
        report.files = extracted.files.clone();
        report.disk_space_used = extracted.total_size;
        report.digest = extracted.metadata.digest.clone();
        report.developer_signature = extracted.metadata.developer_signature.clone();
        report.store_signature = extracted.metadata.store_signature.clone();
        report.extra = extracted.metadata.extra.clone();
        report.extra_signed = extracted.metadata.extra_signed.clone();

        // two-phase acknowledge: the installed tree is still untouched
        control.await_acknowledge(extracted.metadata.clone())?;

        // seal the report into the staging directory, then swap atomically
        let report_path = extracted.destination.join(".installation-report.yaml");
        fs::write(&report_path, report.serialize(&inner.report_key)?)
            .map_err(|e| Error::io(&report_path, e))?;

        let final_dir = inner.installed_dir.join(package_id.as_str());
        let backup_dir = inner.installed_dir.join(format!("{package_id}-"));

        let had_previous = final_dir.exists();
        if had_previous {
            if backup_dir.exists() {
                fs::remove_dir_all(&backup_dir).map_err(|e| Error::io(&backup_dir, e))?;
            }
            fs::rename(&final_dir, &backup_dir).map_err(|e| Error::io(&final_dir, e))?;
        }
        if let Err(e) = fs::rename(&extracted.destination, &final_dir) {
            // reverse the half-done commit
            if had_previous {
                let _ = fs::rename(&backup_dir, &final_dir);
            }
            return Err(Error::io(&final_dir, e));
        }
        staging.disarm();

        control.set_state(TaskState::CleaningUp);
        if had_previous {
            if let Err(e) = fs::remove_dir_all(&backup_dir) {
                warn!(backup = %backup_dir.display(), "could not remove backup: {e}");
            }
        }

        // publish: (re-)register with the database before finishing
        info.built_in = false;
        info.base_dir = final_dir;
        info.installation_report = Some(report);
        if inner
            .database
            .installed_packages()
            .iter()
            .any(|p| p.package_id() == Some(&package_id))
        {
            inner.database.remove_package_info(&package_id);
        }
        inner.database.add_package_info(info);

        info!(package = %package_id, "package installed");
        Ok(())
    }

    fn run_remove(
        &self,
        control: &Arc<TaskControl>,
        package_id: &PackageId,
        purge_documents: bool,
    ) -> Result<()> {
        let inner = &self.inner;
        control.set_package_id(package_id.clone());

        let is_installed = inner
            .database
            .installed_packages()
            .iter()
            .any(|p| p.package_id() == Some(package_id));
        if !is_installed {
            if inner.database.package(package_id).is_some() {
                return Err(Error::Package(format!(
                    "built-in packages cannot be removed: {package_id}"
                )));
            }
            return Err(Error::NotInstalled(package_id.to_string()));
        }

        let final_dir = inner.installed_dir.join(package_id.as_str());
        let backup_dir = inner.installed_dir.join(format!("{package_id}-"));

        if final_dir.exists() {
            if backup_dir.exists() {
                fs::remove_dir_all(&backup_dir).map_err(|e| Error::io(&backup_dir, e))?;
            }
            fs::rename(&final_dir, &backup_dir).map_err(|e| Error::io(&final_dir, e))?;
        } else {
            warn!(package = %package_id, "installed package has no directory on disk");
        }

        // unregister strictly before the task finishes
        inner.database.remove_package_info(package_id);

        control.set_state(TaskState::CleaningUp);
        if backup_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&backup_dir) {
                warn!(backup = %backup_dir.display(), "could not remove backup: {e}");
            }
        }
        if purge_documents {
            if let Some(documents) = &inner.documents_dir {
                let dir = documents.join(package_id.as_str());
                if dir.exists() {
                    if let Err(e) = fs::remove_dir_all(&dir) {
                        warn!(documents = %dir.display(), "could not purge documents: {e}");
                    }
                }
            }
        }

        info!(package = %package_id, "package removed");
        Ok(())
    }
}

impl std::fmt::Debug for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageManager")
            .field("installed_dir", &self.inner.installed_dir)
            .field("tasks", &self.inner.tasks.lock().len())
            .finish_non_exhaustive()
    }
}

/// Removes the staging directory unless the commit succeeded.
struct StagingGuard {
    path: PathBuf,
    armed: bool,
}

impl StagingGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}
