//! The application manager: the authoritative registry of applications,
//! start/stop/open-url dispatch and the ordered application model.

use crate::application::{Application, Package, RunState};
use crate::container::{Container, ContainerFactory};
use crate::debugwrapper;
use crate::intents::{IntentServer, IntentTimeouts};
use crate::model::{role_value, Role, RoleValue};
use crate::process_backend::close_fds;
use crate::quicklaunch::QuickLaunch;
use crate::runtime::{Runtime, RuntimeFactory};
use hangar_core::{Error, PackageId, Result, Signal};
use hangar_database::{OpenGlConfiguration, PackageDatabase, PackageInfo};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// A pending open-url decision offered to the coordinator.
#[derive(Debug, Clone)]
pub struct OpenUrlRequest {
    /// Request identifier.
    pub id: String,
    /// The URL to open.
    pub url: String,
    /// The probed mime type (may be empty for scheme matches).
    pub mime_type: String,
    /// Candidate application ids, best match first.
    pub possible_app_ids: Vec<PackageId>,
    created: Instant,
}

/// Static configuration of the application manager.
#[derive(Debug, Clone)]
pub struct ApplicationManagerConfig {
    /// Whether the whole system runs in one process (no containers).
    pub single_process: bool,
    /// Locale used to resolve display names.
    pub locale: String,
    /// The system-wide OpenGL configuration applications are compared
    /// against for quick-launch eligibility.
    pub opengl_configuration: OpenGlConfiguration,
    /// Intent dispatch timeouts.
    pub intent_timeouts: IntentTimeouts,
    /// Whether the window-manager compositor is already up at construction
    /// time; when `false`, starts are deferred until
    /// [`ApplicationManager::notify_compositor_ready`].
    pub compositor_ready: bool,
}

impl Default for ApplicationManagerConfig {
    fn default() -> Self {
        Self {
            single_process: false,
            locale: "en".to_owned(),
            opengl_configuration: OpenGlConfiguration::default(),
            intent_timeouts: IntentTimeouts::default(),
            compositor_ready: true,
        }
    }
}

struct DeferredStart {
    app: Arc<Application>,
    runtime: Arc<dyn Runtime>,
    attach: bool,
}

struct AmInner {
    database: PackageDatabase,
    container_factory: Arc<ContainerFactory>,
    runtime_factory: Arc<RuntimeFactory>,
    quick_launch: Mutex<Option<Arc<QuickLaunch>>>,
    intents: IntentServer,
    config: ApplicationManagerConfig,

    /// The ordered model: (owning package, application) pairs.
    model: Mutex<Vec<(Arc<Package>, Arc<Application>)>>,
    runtimes: Mutex<HashMap<PackageId, Arc<dyn Runtime>>>,
    deferred_starts: Mutex<Vec<DeferredStart>>,
    open_url_requests: Mutex<Vec<OpenUrlRequest>>,
    queued_open_urls: Mutex<Vec<String>>,
    open_url_in_progress: AtomicBool,
    compositor_ready: AtomicBool,
    shutting_down: AtomicBool,
    shut_down_emitted: AtomicBool,
    container_selection_config: Mutex<Vec<(String, String)>>,
    container_selection_function:
        Mutex<Option<Box<dyn Fn(&PackageId, &str) -> String + Send + Sync>>>,

    application_added: Signal<PackageId>,
    application_about_to_be_removed: Signal<PackageId>,
    application_run_state_changed: Signal<(PackageId, RunState)>,
    application_changed: Signal<(PackageId, Vec<Role>)>,
    activated: Signal<PackageId>,
    new_runtime_created: Signal<PackageId>,
    open_url_requested: Signal<OpenUrlRequest>,
    shut_down_finished: Signal<()>,
}

/// Singleton-per-process authority over the set of applications.
///
/// Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct ApplicationManager {
    inner: Arc<AmInner>,
}

impl ApplicationManager {
    /// Create a manager over `database`, using the given factories.
    ///
    /// The model is populated from the database's current content;
    /// subsequent database changes (installer activity, hot-attached media)
    /// are tracked through its signals.
    #[must_use]
    pub fn new(
        database: PackageDatabase,
        container_factory: Arc<ContainerFactory>,
        runtime_factory: Arc<RuntimeFactory>,
        config: ApplicationManagerConfig,
    ) -> Self {
        let manager = Self {
            inner: Arc::new(AmInner {
                database: database.clone(),
                container_factory,
                runtime_factory,
                quick_launch: Mutex::new(None),
                intents: IntentServer::new(config.intent_timeouts),
                compositor_ready: AtomicBool::new(config.compositor_ready),
                config,
                model: Mutex::new(Vec::new()),
                runtimes: Mutex::new(HashMap::new()),
                deferred_starts: Mutex::new(Vec::new()),
                open_url_requests: Mutex::new(Vec::new()),
                queued_open_urls: Mutex::new(Vec::new()),
                open_url_in_progress: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                shut_down_emitted: AtomicBool::new(false),
                container_selection_config: Mutex::new(Vec::new()),
                container_selection_function: Mutex::new(None),
                application_added: Signal::new(),
                application_about_to_be_removed: Signal::new(),
                application_run_state_changed: Signal::new(),
                application_changed: Signal::new(),
                activated: Signal::new(),
                new_runtime_created: Signal::new(),
                open_url_requested: Signal::new(),
                shut_down_finished: Signal::new(),
            }),
        };

        // installed packages shadow built-in ones with the same id
        let installed = database.installed_packages();
        for info in database.built_in_packages() {
            let shadowed = installed
                .iter()
                .any(|i| i.package_id() == info.package_id());
            if !shadowed {
                manager.add_package(info);
            }
        }
        for info in installed {
            manager.add_package(info);
        }

        let weak = Arc::downgrade(&manager.inner);
        database.package_added().connect(move |info| {
            if let Some(inner) = weak.upgrade() {
                (Self { inner }).add_package(Arc::clone(info));
            }
        });
        let weak = Arc::downgrade(&manager.inner);
        database.package_about_to_be_removed().connect(move |info| {
            if let Some(inner) = weak.upgrade() {
                if let Some(id) = info.package_id() {
                    (Self { inner }).remove_package(id, true);
                }
            }
        });

        manager
    }

    /// Attach the quick-launch pool consulted on application start.
    pub fn set_quick_launch(&self, pool: Arc<QuickLaunch>) {
        *self.inner.quick_launch.lock() = Some(pool);
    }

    /// The intent routing table and its timeouts.
    #[must_use]
    pub fn intents(&self) -> &IntentServer {
        &self.inner.intents
    }

    // ----- signals -----

    /// Emitted for every application entering the model.
    #[must_use]
    pub fn application_added(&self) -> &Signal<PackageId> {
        &self.inner.application_added
    }

    /// Emitted before an application leaves the model.
    #[must_use]
    pub fn application_about_to_be_removed(&self) -> &Signal<PackageId> {
        &self.inner.application_about_to_be_removed
    }

    /// Emitted on every application run-state transition.
    #[must_use]
    pub fn application_run_state_changed(&self) -> &Signal<(PackageId, RunState)> {
        &self.inner.application_run_state_changed
    }

    /// Coarse per-application change notification with the affected roles.
    #[must_use]
    pub fn application_changed(&self) -> &Signal<(PackageId, Vec<Role>)> {
        &self.inner.application_changed
    }

    /// Emitted when an application was (re-)activated by a start request.
    #[must_use]
    pub fn activated(&self) -> &Signal<PackageId> {
        &self.inner.activated
    }

    /// Emitted when a runtime object was created for an application.
    #[must_use]
    pub fn new_runtime_created(&self) -> &Signal<PackageId> {
        &self.inner.new_runtime_created
    }

    /// Emitted instead of auto-starting when a coordinator listens; see
    /// [`open_url`](Self::open_url).
    #[must_use]
    pub fn open_url_requested(&self) -> &Signal<OpenUrlRequest> {
        &self.inner.open_url_requested
    }

    /// Emitted once after [`shut_down`](Self::shut_down), when the last
    /// runtime has disappeared.
    #[must_use]
    pub fn shut_down_finished(&self) -> &Signal<()> {
        &self.inner.shut_down_finished
    }

    // ----- model -----

    /// Number of applications in the model.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.model.lock().len()
    }

    /// All application ids, in model order.
    #[must_use]
    pub fn application_ids(&self) -> Vec<PackageId> {
        self.inner
            .model
            .lock()
            .iter()
            .map(|(_, app)| app.id().clone())
            .collect()
    }

    /// The application with the given id.
    #[must_use]
    pub fn application(&self, app_id: &PackageId) -> Option<Arc<Application>> {
        self.inner
            .model
            .lock()
            .iter()
            .find(|(_, app)| app.id() == app_id)
            .map(|(_, app)| Arc::clone(app))
    }

    /// The package owning the application with the given id.
    #[must_use]
    pub fn package_of(&self, app_id: &PackageId) -> Option<Arc<Package>> {
        self.inner
            .model
            .lock()
            .iter()
            .find(|(_, app)| app.id() == app_id)
            .map(|(pkg, _)| Arc::clone(pkg))
    }

    /// Typed role access for the view layer.
    #[must_use]
    pub fn data(&self, row: usize, role: Role) -> Option<RoleValue> {
        let model = self.inner.model.lock();
        let (package, app) = model.get(row)?;
        Some(role_value(package, app, role, &self.inner.config.locale))
    }

    /// The capabilities granted to an application (empty for unknown ids).
    #[must_use]
    pub fn capabilities(&self, app_id: &PackageId) -> Vec<String> {
        self.application(app_id)
            .map(|app| app.info().capabilities.clone())
            .unwrap_or_default()
    }

    /// The id of the application running as `pid`, if any.
    #[must_use]
    pub fn identify_application(&self, pid: u32) -> Option<PackageId> {
        self.identify_all_applications(pid).into_iter().next()
    }

    /// All application ids sharing the process `pid`.
    #[must_use]
    pub fn identify_all_applications(&self, pid: u32) -> Vec<PackageId> {
        self.inner
            .runtimes
            .lock()
            .iter()
            .filter(|(_, rt)| rt.process_id() == Some(pid))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// The runtime currently attached to an application.
    #[must_use]
    pub fn current_runtime(&self, app_id: &PackageId) -> Option<Arc<dyn Runtime>> {
        self.inner.runtimes.lock().get(app_id).cloned()
    }

    /// Whether a shutdown is in progress.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    // ----- container selection -----

    /// Set the ordered container selection rules: the first pattern (`*`,
    /// exact id or wildcard) matching the application id wins.
    pub fn set_container_selection_config(&self, rules: Vec<(String, String)>) {
        *self.inner.container_selection_config.lock() = rules;
    }

    /// Register a callback that may override the selected container id; it
    /// is called last with the tentative id.
    pub fn set_container_selection_function(
        &self,
        function: impl Fn(&PackageId, &str) -> String + Send + Sync + 'static,
    ) {
        *self.inner.container_selection_function.lock() = Some(Box::new(function));
    }

    fn resolve_container_id(&self, app_id: &PackageId) -> String {
        let mut container_id = String::new();
        {
            let rules = self.inner.container_selection_config.lock();
            if rules.is_empty() {
                container_id = "process".to_owned();
            } else {
                for (pattern, value) in rules.iter() {
                    let matches = pattern == "*"
                        || pattern == app_id.as_str()
                        || wildcard_match(pattern, app_id.as_str());
                    if matches {
                        container_id = value.clone();
                        break;
                    }
                }
            }
        }
        if let Some(function) = &*self.inner.container_selection_function.lock() {
            container_id = function(app_id, &container_id);
        }
        container_id
    }

    // ----- start / stop -----

    /// Start an application; logs and returns `false` on failure.
    pub fn start_application(&self, app_id: &PackageId, document_url: Option<&str>) -> bool {
        match self.start_application_internal(app_id, document_url, None, None, Vec::new()) {
            Ok(started) => started,
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    /// Start an application under a debug wrapper; logs and returns
    /// `false` on failure.
    pub fn debug_application(
        &self,
        debug_wrapper: &str,
        app_id: &PackageId,
        document_url: Option<&str>,
    ) -> bool {
        match self.start_application_internal(
            app_id,
            document_url,
            None,
            Some(debug_wrapper),
            Vec::new(),
        ) {
            Ok(started) => started,
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    /// The full start algorithm.
    ///
    /// `stdio_redirections` carries up to three raw file descriptors
    /// (stdin, stdout, stderr; `-1` for "keep"); ownership transfers here
    /// and the descriptors are closed on every failure path.
    ///
    /// Returns `Ok(false)` when the application is currently shutting down
    /// (a retry later will succeed).
    ///
    /// # Errors
    /// Fails when shutting down, for unknown or blocked applications, for
    /// invalid stdio or debug-wrapper specifications, and when no
    /// container/runtime backend matches.
    ///
    /// An application claiming `NotRunning` while a runtime object is
    /// still attached is an unrecoverable invariant violation and aborts
    /// the process.
    pub fn start_application_internal(
        &self,
        app_id: &PackageId,
        document_url: Option<&str>,
        document_mime_type: Option<&str>,
        debug_wrapper_specification: Option<&str>,
        stdio_redirections: Vec<i32>,
    ) -> Result<bool> {
        let mut fd_guard = FdGuard::new(stdio_redirections);

        if self.is_shutting_down() {
            return Err(Error::Package(
                "cannot start applications during shutdown".into(),
            ));
        }
        let app = self.application(app_id).ok_or_else(|| {
            Error::Package(format!("cannot start application: id '{app_id}' is not known"))
        })?;
        if app.is_blocked() {
            return Err(Error::Package(format!(
                "application {app_id} is blocked - cannot start"
            )));
        }

        let existing_runtime = self.current_runtime(app_id);
        let runtime_manager = match &existing_runtime {
            Some(runtime) => self.inner.runtime_factory.manager(runtime.manager_id()),
            None => self.inner.runtime_factory.manager(app.runtime_name()),
        }
        .ok_or_else(|| {
            Error::Package(format!(
                "no runtime manager found for runtime: {}",
                app.runtime_name()
            ))
        })?;
        let in_process = runtime_manager.in_process();

        // validate stdio redirections
        if fd_guard.fds.len() > 3 {
            return Err(Error::Package(format!(
                "tried to start application {app_id} using an invalid standard IO redirection specification"
            )));
        }
        let has_stdio_redirections = fd_guard.fds.iter().any(|&fd| fd >= 0);

        // validate the debug wrapper
        let (debug_command, debug_environment) = match debug_wrapper_specification {
            Some(spec) if !spec.is_empty() => {
                if self.inner.config.single_process {
                    return Err(Error::Package(
                        "using debug-wrappers is not supported when the application manager is running in single-process mode".into(),
                    ));
                }
                if in_process {
                    return Err(Error::Package(format!(
                        "using debug-wrappers is not supported when starting an app using an in-process runtime ({})",
                        runtime_manager.identifier()
                    )));
                }
                debugwrapper::parse_specification(spec).ok_or_else(|| {
                    Error::Package(format!(
                        "tried to start application {app_id} using an invalid debug-wrapper specification: {spec}"
                    ))
                })?
            }
            _ => (Vec::new(), BTreeMap::new()),
        };

        if let Some(runtime) = existing_runtime {
            match runtime.state() {
                RunState::StartingUp | RunState::Running => {
                    if !debug_command.is_empty() {
                        return Err(Error::Package(format!(
                            "application {app_id} is already running - cannot start with debug-wrapper"
                        )));
                    }
                    if has_stdio_redirections {
                        return Err(Error::Package(format!(
                            "application {app_id} is already running - cannot set standard IO redirections"
                        )));
                    }
                    let doc = document_url
                        .map(str::to_owned)
                        .or_else(|| app.document_url());
                    if let Some(doc) = doc {
                        runtime.open_document(&doc, document_mime_type.unwrap_or_default());
                    }
                    self.inner.activated.emit(app_id);
                    return Ok(true);
                }
                RunState::ShuttingDown => return Ok(false),
                RunState::NotRunning => {
                    // silently continuing would risk data loss
                    error!(
                        "application {app_id} is not running, but still has a runtime object attached"
                    );
                    std::process::abort();
                }
            }
        }

        let mut container: Option<Arc<dyn Container>> = None;
        let mut pooled_runtime: Option<Arc<dyn Runtime>> = None;

        if !in_process {
            let container_id = self.resolve_container_id(app_id);
            if self.inner.container_factory.manager(&container_id).is_none() {
                return Err(Error::Package(format!(
                    "no container manager found for container: {container_id}"
                )));
            }

            let pool = self.inner.quick_launch.lock().clone();
            if let Some(pool) = pool {
                let cannot_use_quick_launch = if !debug_command.is_empty() {
                    Some("the app is started using a debug-wrapper")
                } else if has_stdio_redirections {
                    Some("standard I/O is redirected")
                } else if !app
                    .info()
                    .runtime_parameters
                    .get("environmentVariables")
                    .map_or(true, |v| {
                        v.as_mapping().map_or(true, serde_yaml::Mapping::is_empty)
                    })
                {
                    Some("the app requests custom environment variables")
                } else if app.info().opengl_configuration
                    != self.inner.config.opengl_configuration
                {
                    Some("the app requests a custom OpenGL configuration")
                } else {
                    None
                };

                if let Some(reason) = cannot_use_quick_launch {
                    debug!(app = %app_id, "cannot use quick-launch because {reason}");
                } else if let Some((pooled_container, runtime)) =
                    pool.take(&container_id, app.runtime_name())
                {
                    debug!(app = %app_id, container = %container_id,
                           "found a quick-launch entry");
                    container = Some(pooled_container);
                    pooled_runtime = runtime;
                }
            }

            if container.is_none() {
                // ownership of the stdio fds transfers into the factory
                let fds = fd_guard.take();
                container = Some(self.inner.container_factory.create(
                    &container_id,
                    fds,
                    debug_environment,
                    debug_command,
                )?);
            }
        }

        let attach = pooled_runtime.is_some();
        let runtime = match pooled_runtime {
            Some(runtime) => runtime,
            None => runtime_manager.create(container.clone(), Some(Arc::clone(&app)))?,
        };
        self.inner
            .runtimes
            .lock()
            .insert(app_id.clone(), Arc::clone(&runtime));
        self.wire_runtime(&app, &runtime);
        self.inner.new_runtime_created.emit(app_id);

        let doc = document_url
            .map(str::to_owned)
            .or_else(|| app.document_url());
        if let Some(doc) = doc {
            runtime.open_document(&doc, document_mime_type.unwrap_or_default());
        }

        info!(app = %app_id, runtime = runtime_manager.identifier(), "starting application");

        // we can only start once both the container and the compositor are up
        if !in_process && !self.inner.compositor_ready.load(Ordering::SeqCst) {
            self.inner.deferred_starts.lock().push(DeferredStart {
                app,
                runtime,
                attach,
            });
            return Ok(true);
        }
        let container_ready = in_process || container.as_ref().is_some_and(|c| c.is_ready());
        if container_ready {
            Ok(self.do_start(&app, &runtime, attach))
        } else if let Some(container) = container {
            let weak = Arc::downgrade(&self.inner);
            let app = Arc::clone(&app);
            let runtime = Arc::clone(&runtime);
            let started = AtomicBool::new(false);
            container.ready().connect(move |()| {
                if started.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    (Self { inner }).do_start(&app, &runtime, attach);
                }
            });
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn do_start(&self, app: &Arc<Application>, runtime: &Arc<dyn Runtime>, attach: bool) -> bool {
        let started = if attach {
            runtime.attach_application_to_quick_launcher(Arc::clone(app))
        } else {
            runtime.start()
        };
        if started {
            self.inner.activated.emit(app.id());
        } else {
            warn!(app = %app.id(), "failed to start application");
            self.inner.runtimes.lock().remove(app.id());
        }
        started
    }

    fn wire_runtime(&self, app: &Arc<Application>, runtime: &Arc<dyn Runtime>) {
        let weak = Arc::downgrade(&self.inner);
        let app_weak = Arc::downgrade(app);
        let app_id = app.id().clone();
        runtime.state_changed().connect(move |state| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Some(app) = app_weak.upgrade() {
                app.set_run_state(*state);
            }
            inner
                .application_run_state_changed
                .emit(&(app_id.clone(), *state));
            inner
                .application_changed
                .emit(&(app_id.clone(), Role::run_state_roles().to_vec()));

            if *state == RunState::NotRunning {
                inner.runtimes.lock().remove(&app_id);
                if inner.shutting_down.load(Ordering::SeqCst)
                    && inner.runtimes.lock().is_empty()
                    && !inner.shut_down_emitted.swap(true, Ordering::SeqCst)
                {
                    inner.shut_down_finished.emit(&());
                }
            }
        });
    }

    /// Stop an application. No-op if nothing is running; idempotent while
    /// already shutting down.
    pub fn stop_application(&self, app_id: &PackageId, force_kill: bool) {
        if let Some(runtime) = self.current_runtime(app_id) {
            runtime.stop(force_kill);
        }
    }

    /// Stop all applications and emit
    /// [`shut_down_finished`](Self::shut_down_finished) once the last
    /// runtime has disappeared.
    pub fn shut_down(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let runtimes: Vec<_> = self.inner.runtimes.lock().values().cloned().collect();
        if runtimes.is_empty() {
            if !self.inner.shut_down_emitted.swap(true, Ordering::SeqCst) {
                self.inner.shut_down_finished.emit(&());
            }
            return;
        }
        for runtime in runtimes {
            runtime.stop(false);
        }
    }

    /// Unblock deferred starts once the window-manager compositor is up.
    pub fn notify_compositor_ready(&self) {
        self.inner.compositor_ready.store(true, Ordering::SeqCst);
        let deferred: Vec<_> = self.inner.deferred_starts.lock().drain(..).collect();
        for DeferredStart {
            app,
            runtime,
            attach,
        } in deferred
        {
            self.do_start(&app, &runtime, attach);
        }
    }

    // ----- open url -----

    /// Open a URL in a matching application.
    ///
    /// Candidates are resolved by `x-scheme-handler/<scheme>` mime match,
    /// falling back to a mime probe of the URL. With a coordinator
    /// listening on [`open_url_requested`](Self::open_url_requested), the
    /// decision is delegated; otherwise the first candidate is started.
    /// Re-entrant calls are queued.
    pub fn open_url(&self, url: &str) -> bool {
        if self.inner.open_url_in_progress.swap(true, Ordering::SeqCst) {
            self.inner.queued_open_urls.lock().push(url.to_owned());
            return true;
        }
        let mut result = self.open_url_now(url);
        loop {
            let next = self.inner.queued_open_urls.lock().pop();
            match next {
                Some(queued) => result = self.open_url_now(&queued),
                None => break,
            }
        }
        self.inner.open_url_in_progress.store(false, Ordering::SeqCst);
        result
    }

    fn open_url_now(&self, url: &str) -> bool {
        let scheme = url_scheme(url);
        let mut mime_type = String::new();

        let mut candidates: Vec<Arc<Application>> = Vec::new();
        if let Some(scheme) = &scheme {
            if scheme != "file" {
                let handler_mime = format!("x-scheme-handler/{scheme}");
                candidates = self.mime_type_handlers(&handler_mime);
            }
        }
        if candidates.is_empty() {
            if let Some(probed) = mime_type_for_url(url) {
                mime_type = probed.to_owned();
                candidates = self.mime_type_handlers(&mime_type);
            }
        }
        if candidates.is_empty() {
            return false;
        }

        if self.inner.open_url_requested.is_connected() {
            let request = OpenUrlRequest {
                id: uuid::Uuid::new_v4().to_string(),
                url: url.to_owned(),
                mime_type,
                possible_app_ids: candidates.iter().map(|a| a.id().clone()).collect(),
                created: Instant::now(),
            };
            self.inner.open_url_requests.lock().push(request.clone());
            self.inner.open_url_requested.emit(&request);
        } else {
            // no coordinator: just use the first match
            let first = candidates[0].id().clone();
            if let Err(e) = self.start_application_internal(
                &first,
                Some(url),
                Some(&mime_type),
                None,
                Vec::new(),
            ) {
                warn!(url, app = %first, "open-url requested an app which could not be started: {e}");
            }
        }
        true
    }

    /// Go ahead with a pending open-url request, choosing `app_id` from its
    /// candidate set. Closes the request either way.
    pub fn acknowledge_open_url_request(&self, request_id: &str, app_id: &PackageId) {
        let request = {
            let mut requests = self.inner.open_url_requests.lock();
            let index = requests.iter().position(|r| r.id == request_id);
            index.map(|i| requests.remove(i))
        };
        let Some(request) = request else {
            return;
        };
        if !request.possible_app_ids.contains(app_id) {
            warn!(url = request.url, app = %app_id,
                  "acknowledgeOpenUrlRequest for an app that is not one of the candidates");
            return;
        }
        if let Err(e) = self.start_application_internal(
            app_id,
            Some(&request.url),
            Some(&request.mime_type),
            None,
            Vec::new(),
        ) {
            warn!(url = request.url, app = %app_id,
                  "acknowledged open-url request could not be started: {e}");
        }
    }

    /// Drop a pending open-url request.
    pub fn reject_open_url_request(&self, request_id: &str) {
        self.inner
            .open_url_requests
            .lock()
            .retain(|r| r.id != request_id);
    }

    /// Drop open-url requests that waited longer than the disambiguation
    /// timeout, and expire pending intent requests.
    pub fn process_timeouts(&self) {
        let limit = self.inner.intents.timeouts().disambiguation;
        self.inner
            .open_url_requests
            .lock()
            .retain(|r| r.created.elapsed() < limit);
        self.inner.intents.process_timeouts();
    }

    fn mime_type_handlers(&self, mime_type: &str) -> Vec<Arc<Application>> {
        self.inner
            .model
            .lock()
            .iter()
            .filter(|(_, app)| app.handles_mime_type(mime_type))
            .map(|(_, app)| Arc::clone(app))
            .collect()
    }

    // ----- model maintenance -----

    fn add_package(&self, info: Arc<PackageInfo>) {
        let Some(id) = info.package_id().cloned() else {
            return;
        };
        // an update replaces the live package with the same id
        self.remove_package(&id, false);

        let package = Package::new(info);
        let mut added = Vec::new();
        {
            let mut model = self.inner.model.lock();
            for app in package.applications() {
                model.push((Arc::clone(&package), Arc::clone(app)));
                added.push(app.id().clone());
            }
        }
        for intent in &package.info().intents {
            if let Some(app) = package.applications().first() {
                self.inner
                    .intents
                    .register_handler(intent.id.clone(), app.id().clone());
            }
        }
        for app_id in added {
            debug!(app = %app_id, "application registered");
            self.inner.application_added.emit(&app_id);
        }
    }

    fn remove_package(&self, package_id: &PackageId, restore_built_in: bool) {
        let removed: Vec<(Arc<Package>, Arc<Application>)> = {
            let model = self.inner.model.lock();
            model
                .iter()
                .filter(|(pkg, _)| pkg.id() == package_id)
                .cloned()
                .collect()
        };
        if removed.is_empty() {
            return;
        }

        for (_, app) in &removed {
            if let Some(runtime) = self.current_runtime(app.id()) {
                runtime.stop(true);
            }
            self.inner.application_about_to_be_removed.emit(app.id());
            self.inner.intents.unregister_application(app.id());
        }
        self.inner
            .model
            .lock()
            .retain(|(pkg, _)| pkg.id() != package_id);

        if restore_built_in {
            // a removed update re-activates the shadowed built-in package
            let built_in = self
                .inner
                .database
                .built_in_packages()
                .into_iter()
                .find(|p| p.package_id() == Some(package_id));
            if let Some(info) = built_in {
                self.add_package(info);
            }
        }
    }
}

impl std::fmt::Debug for ApplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationManager")
            .field("applications", &self.count())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

/// Closes owned stdio file descriptors unless ownership was transferred.
struct FdGuard {
    fds: Vec<i32>,
    armed: bool,
}

impl FdGuard {
    fn new(fds: Vec<i32>) -> Self {
        Self { fds, armed: true }
    }

    fn take(&mut self) -> Vec<i32> {
        self.armed = false;
        std::mem::take(&mut self.fds)
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        if self.armed {
            close_fds(&self.fds);
        }
    }
}

fn wildcard_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains(['*', '?']) {
        return false;
    }
    let escaped = regex::escape(pattern).replace(r"\*", ".*").replace(r"\?", ".");
    regex::Regex::new(&format!("^{escaped}$"))
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

fn url_scheme(url: &str) -> Option<String> {
    let (scheme, _) = url.split_once(':')?;
    if scheme.is_empty() {
        return None;
    }
    let valid = scheme
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.');
    valid.then(|| scheme.to_ascii_lowercase())
}

/// A small built-in probe mapping well-known file extensions; stands in for
/// the OS mime database.
fn mime_type_for_url(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let extension = path.rsplit('.').next()?.to_ascii_lowercase();
    match extension.as_str() {
        "txt" | "log" => Some("text/plain"),
        "html" | "htm" => Some("text/html"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "pdf" => Some("application/pdf"),
        "json" => Some("application/json"),
        "yaml" | "yml" => Some("application/yaml"),
        "mp4" => Some("video/mp4"),
        "mp3" => Some("audio/mpeg"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_rules() {
        assert!(wildcard_match("com.example.*", "com.example.hello"));
        assert!(wildcard_match("*.hello", "com.example.hello"));
        assert!(wildcard_match("com.?xample.hello", "com.example.hello"));
        assert!(!wildcard_match("com.example.*", "org.example.hello"));
        assert!(!wildcard_match("com.example.hello", "com.example.hello")); // no wildcard chars
    }

    #[test]
    fn url_scheme_parsing() {
        assert_eq!(url_scheme("hello://x"), Some("hello".into()));
        assert_eq!(url_scheme("HTTPS://x"), Some("https".into()));
        assert_eq!(url_scheme("no-colon"), None);
        assert_eq!(url_scheme("spa ce://x"), None);
    }

    #[test]
    fn mime_probe_by_extension() {
        assert_eq!(mime_type_for_url("file:///a/b/readme.txt"), Some("text/plain"));
        assert_eq!(mime_type_for_url("https://x/y.png?size=2"), Some("image/png"));
        assert_eq!(mime_type_for_url("file:///a/unknown.zzz"), None);
    }
}
