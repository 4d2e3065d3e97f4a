//! The `process` container backend: a plain OS child process with
//! redirected stdio, plus the matching out-of-process runtime.

#![allow(unsafe_code)]

use crate::application::{Application, ExitInfo, ExitStatus, RunState};
use crate::container::{Container, ContainerManager};
use crate::debugwrapper;
use crate::runtime::{Runtime, RuntimeManager};
use hangar_core::{Error, Result, Signal};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Close a set of raw file descriptors (ignoring invalid entries).
pub(crate) fn close_fds(fds: &[i32]) {
    #[cfg(unix)]
    for &fd in fds {
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = fds;
}

/// Creates [`ProcessContainer`]s; registered as `process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessContainerManager;

impl ContainerManager for ProcessContainerManager {
    fn identifier(&self) -> &str {
        "process"
    }

    fn supports_quick_launch(&self) -> bool {
        true
    }

    fn create(
        &self,
        stdio_redirections: Vec<i32>,
        debug_environment: BTreeMap<String, String>,
        debug_command: Vec<String>,
    ) -> Result<Arc<dyn Container>> {
        Ok(Arc::new(ProcessContainer::new(
            stdio_redirections,
            debug_environment,
            debug_command,
        )))
    }
}

/// Wraps one OS child process with redirected stdio.
pub struct ProcessContainer {
    stdio: Mutex<Vec<i32>>,
    debug_environment: BTreeMap<String, String>,
    debug_command: Vec<String>,
    ready: Signal<()>,
    exited: Arc<Signal<ExitInfo>>,
    pid: Arc<AtomicU32>,
    running: Arc<AtomicBool>,
    forced: Arc<AtomicBool>,
}

impl ProcessContainer {
    fn new(
        stdio: Vec<i32>,
        debug_environment: BTreeMap<String, String>,
        debug_command: Vec<String>,
    ) -> Self {
        Self {
            stdio: Mutex::new(stdio),
            debug_environment,
            debug_command,
            ready: Signal::new(),
            exited: Arc::new(Signal::new()),
            pid: Arc::new(AtomicU32::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            forced: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Drop for ProcessContainer {
    fn drop(&mut self) {
        close_fds(&self.stdio.lock());
    }
}

impl std::fmt::Debug for ProcessContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContainer")
            .field("pid", &self.pid.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Container for ProcessContainer {
    fn manager_id(&self) -> &str {
        "process"
    }

    fn is_ready(&self) -> bool {
        // a plain child process needs no setup phase
        true
    }

    fn ready(&self) -> &Signal<()> {
        &self.ready
    }

    fn exited(&self) -> &Signal<ExitInfo> {
        &self.exited
    }

    fn start(
        &self,
        program: &Path,
        arguments: &[String],
        environment: &BTreeMap<String, String>,
    ) -> Result<u32> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Locked(format!(
                "container is already running process {}",
                self.pid.load(Ordering::SeqCst)
            )));
        }

        // a debug wrapper rewrites the command line around the program
        let argv: Vec<String> = if self.debug_command.is_empty() {
            let mut argv = vec![program.to_string_lossy().into_owned()];
            argv.extend(arguments.iter().cloned());
            argv
        } else {
            debugwrapper::substitute_command(
                &self.debug_command,
                &program.to_string_lossy(),
                arguments,
            )
        };
        let (exe, args) = argv
            .split_first()
            .ok_or_else(|| Error::Package("empty command line".into()))?;

        let mut command = Command::new(exe);
        command.args(args);
        command.envs(&self.debug_environment);
        command.envs(environment);

        let stdio = std::mem::take(&mut *self.stdio.lock());
        configure_stdio(&mut command, &stdio);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                close_fds(&stdio);
                self.running.store(false, Ordering::SeqCst);
                return Err(Error::io(program, e));
            }
        };
        // the child holds duplicates now
        close_fds(&stdio);

        let pid = child.id();
        self.pid.store(pid, Ordering::SeqCst);
        debug!(pid, program = %program.display(), "container process started");

        let exited = Arc::clone(&self.exited);
        let pid_slot = Arc::clone(&self.pid);
        let running = Arc::clone(&self.running);
        let forced = Arc::clone(&self.forced);
        let spawned = std::thread::Builder::new()
            .name(format!("container-wait-{pid}"))
            .spawn(move || {
                let exit = match child.wait() {
                    Ok(status) => classify_exit(&status, forced.load(Ordering::SeqCst)),
                    Err(e) => {
                        warn!(pid, "could not wait for child: {e}");
                        ExitInfo {
                            code: -1,
                            status: ExitStatus::CrashExit,
                        }
                    }
                };
                pid_slot.store(0, Ordering::SeqCst);
                running.store(false, Ordering::SeqCst);
                exited.emit(&exit);
            });
        if let Err(e) = spawned {
            warn!("could not spawn the container wait thread: {e}");
        }

        Ok(pid)
    }

    fn process_id(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn stop(&self, force_kill: bool) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return;
        }
        if force_kill {
            self.forced.store(true, Ordering::SeqCst);
        }
        #[cfg(unix)]
        unsafe {
            let signal = if force_kill { libc::SIGKILL } else { libc::SIGTERM };
            libc::kill(pid as libc::pid_t, signal);
        }
        #[cfg(not(unix))]
        {
            let _ = force_kill;
        }
    }
}

fn classify_exit(status: &std::process::ExitStatus, forced: bool) -> ExitInfo {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            let status = if forced {
                ExitStatus::ForcedExit
            } else if signal == libc::SIGTERM {
                // a graceful stop request that the application obeyed
                ExitStatus::NormalExit
            } else {
                ExitStatus::CrashExit
            };
            return ExitInfo {
                code: 128 + signal,
                status,
            };
        }
    }
    let _ = forced;
    ExitInfo {
        code: status.code().unwrap_or(-1),
        status: ExitStatus::NormalExit,
    }
}

#[cfg(unix)]
fn configure_stdio(command: &mut Command, stdio: &[i32]) {
    use std::os::unix::process::CommandExt;

    let fds: Vec<i32> = stdio.to_vec();
    let has_redirection = fds.iter().any(|&fd| fd >= 0);
    if !has_redirection {
        return;
    }
    unsafe {
        command.pre_exec(move || {
            // duplicate the requested redirections onto stdin/out/err and
            // close the originals to not block the controlling tty
            for (target, &fd) in fds.iter().enumerate().take(3) {
                if fd >= 0 {
                    if libc::dup2(fd, target as i32) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    libc::close(fd);
                }
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn configure_stdio(_command: &mut Command, _stdio: &[i32]) {}

/// Creates [`ProcessRuntime`]s; registered as `process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRuntimeManager;

impl RuntimeManager for ProcessRuntimeManager {
    fn identifier(&self) -> &str {
        "process"
    }

    fn in_process(&self) -> bool {
        false
    }

    fn supports_quick_launch(&self) -> bool {
        true
    }

    fn create(
        &self,
        container: Option<Arc<dyn Container>>,
        application: Option<Arc<Application>>,
    ) -> Result<Arc<dyn Runtime>> {
        let container = container.ok_or_else(|| {
            Error::Package("the process runtime needs a container to run in".into())
        })?;
        Ok(ProcessRuntime::new(container, application, false))
    }

    fn create_quick_launcher(&self, container: Arc<dyn Container>) -> Result<Arc<dyn Runtime>> {
        Ok(ProcessRuntime::new(container, None, true))
    }
}

/// Runs the application's entry point as a native executable inside its
/// container.
pub struct ProcessRuntime {
    token: [u8; 16],
    container: Arc<dyn Container>,
    application: Mutex<Option<Arc<Application>>>,
    state: Mutex<RunState>,
    state_changed: Signal<RunState>,
    quick_launcher: AtomicBool,
    stop_requested: AtomicBool,
    exit_subscribed: AtomicBool,
    weak_self: std::sync::Weak<ProcessRuntime>,
}

impl ProcessRuntime {
    fn new(
        container: Arc<dyn Container>,
        application: Option<Arc<Application>>,
        quick_launcher: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            token: *uuid::Uuid::new_v4().as_bytes(),
            container,
            application: Mutex::new(application),
            state: Mutex::new(RunState::NotRunning),
            state_changed: Signal::new(),
            quick_launcher: AtomicBool::new(quick_launcher),
            stop_requested: AtomicBool::new(false),
            exit_subscribed: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    fn set_state(&self, state: RunState) {
        {
            let mut current = self.state.lock();
            if *current == state {
                return;
            }
            *current = state;
        }
        self.state_changed.emit(&state);
    }

    fn subscribe_exit(&self) {
        if self.exit_subscribed.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = self.weak_self.clone();
        self.container.exited().connect(move |exit| {
            let Some(runtime) = weak.upgrade() else {
                return;
            };
            let exit = if runtime.stop_requested.load(Ordering::SeqCst)
                && exit.status == ExitStatus::CrashExit
            {
                // the application ignored the graceful stop and had to be
                // brought down
                ExitInfo {
                    code: exit.code,
                    status: ExitStatus::ForcedExit,
                }
            } else {
                *exit
            };
            if let Some(app) = runtime.application.lock().clone() {
                app.set_last_exit(exit);
            }
            runtime.set_state(RunState::NotRunning);
        });
    }
}

impl std::fmt::Debug for ProcessRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRuntime")
            .field("state", &*self.state.lock())
            .field("quick_launcher", &self.quick_launcher.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Runtime for ProcessRuntime {
    fn manager_id(&self) -> &str {
        "process"
    }

    fn security_token(&self) -> [u8; 16] {
        self.token
    }

    fn state(&self) -> RunState {
        *self.state.lock()
    }

    fn state_changed(&self) -> &Signal<RunState> {
        &self.state_changed
    }

    fn process_id(&self) -> Option<u32> {
        self.container.process_id()
    }

    fn container(&self) -> Option<Arc<dyn Container>> {
        Some(Arc::clone(&self.container))
    }

    fn application(&self) -> Option<Arc<Application>> {
        self.application.lock().clone()
    }

    fn is_quick_launcher(&self) -> bool {
        self.quick_launcher.load(Ordering::SeqCst)
    }

    fn attach_application_to_quick_launcher(&self, app: Arc<Application>) -> bool {
        if !self.is_quick_launcher() {
            return false;
        }
        *self.application.lock() = Some(app);
        self.quick_launcher.store(false, Ordering::SeqCst);
        self.start()
    }

    fn start(&self) -> bool {
        let Some(app) = self.application.lock().clone() else {
            // a quick-launcher idles with a warm container until an
            // application is attached
            return self.is_quick_launcher();
        };

        self.set_state(RunState::StartingUp);
        self.subscribe_exit();

        let program = app.code_file_path();
        let arguments = runtime_parameter_list(&app, "arguments");
        let environment = runtime_parameter_map(&app, "environmentVariables");

        match self.container.start(&program, &arguments, &environment) {
            Ok(pid) => {
                debug!(app = %app.id(), pid, "application started");
                self.set_state(RunState::Running);
                true
            }
            Err(e) => {
                warn!(app = %app.id(), "failed to start application: {e}");
                self.set_state(RunState::NotRunning);
                false
            }
        }
    }

    fn stop(&self, force_kill: bool) {
        match self.state() {
            RunState::Running | RunState::StartingUp => {
                self.stop_requested.store(true, Ordering::SeqCst);
                self.set_state(RunState::ShuttingDown);
                self.container.stop(force_kill);
            }
            RunState::ShuttingDown => {
                if force_kill {
                    self.container.stop(true);
                }
            }
            RunState::NotRunning => {}
        }
    }

    fn open_document(&self, url: &str, mime_type: &str) {
        // the process backend has no document channel into the application
        debug!(url, mime_type, "process runtime cannot deliver documents");
    }
}

fn runtime_parameter_list(app: &Application, key: &str) -> Vec<String> {
    app.info()
        .runtime_parameters
        .get(key)
        .and_then(|v| v.as_sequence())
        .map(|seq| {
            seq.iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

fn runtime_parameter_map(app: &Application, key: &str) -> BTreeMap<String, String> {
    app.info()
        .runtime_parameters
        .get(key)
        .and_then(|v| v.as_mapping())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| {
                    Some((k.as_str()?.to_owned(), v.as_str()?.to_owned()))
                })
                .collect()
        })
        .unwrap_or_default()
}
