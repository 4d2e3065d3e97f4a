//! Runtime abstraction and the runtime factory.
//!
//! A runtime is the engine executing one application's code inside a
//! container. It exclusively owns its container (dropping the runtime drops
//! the container) and is associated with at most one application while that
//! application runs. Every runtime carries a cryptographically generated
//! 16-byte security token, immutable after creation.

use crate::application::{Application, RunState};
use crate::container::Container;
use hangar_core::{Error, Result, Signal};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// A live runtime executing (or prepared to execute) one application.
pub trait Runtime: Send + Sync + std::fmt::Debug {
    /// Identifier of the manager that created this runtime.
    fn manager_id(&self) -> &str;

    /// The 16-byte security token generated at creation.
    fn security_token(&self) -> [u8; 16];

    /// Current run state.
    fn state(&self) -> RunState;

    /// Emitted on every state transition, in monotonic order along
    /// `NotRunning → StartingUp → Running → ShuttingDown → NotRunning`.
    fn state_changed(&self) -> &Signal<RunState>;

    /// The process id, once started.
    fn process_id(&self) -> Option<u32>;

    /// The attached container, if this runtime is out-of-process.
    fn container(&self) -> Option<Arc<dyn Container>>;

    /// The associated application, if one is attached.
    fn application(&self) -> Option<Arc<Application>>;

    /// Whether this runtime idles in the quick-launch pool.
    fn is_quick_launcher(&self) -> bool;

    /// Attach `app` to a pooled quick-launch runtime and start it.
    fn attach_application_to_quick_launcher(&self, app: Arc<Application>) -> bool;

    /// Start the application. Returns `false` if the start failed.
    fn start(&self) -> bool;

    /// Stop the application (gracefully, or hard with `force_kill`).
    /// Idempotent while already shutting down.
    fn stop(&self, force_kill: bool);

    /// Deliver a document to the running application.
    fn open_document(&self, url: &str, mime_type: &str);
}

/// Creates runtimes of one backend flavor.
pub trait RuntimeManager: Send + Sync + std::fmt::Debug {
    /// The registry key.
    fn identifier(&self) -> &str;

    /// Whether this runtime executes inside the application manager
    /// process.
    fn in_process(&self) -> bool {
        false
    }

    /// Whether runtimes of this flavor may idle in the quick-launch pool.
    fn supports_quick_launch(&self) -> bool {
        false
    }

    /// Create a runtime. Ownership of `container` transfers into the
    /// runtime.
    ///
    /// # Errors
    /// Fails if the backend's requirements (e.g. a container) are not met.
    fn create(
        &self,
        container: Option<Arc<dyn Container>>,
        application: Option<Arc<Application>>,
    ) -> Result<Arc<dyn Runtime>>;

    /// Create an application-less runtime for the quick-launch pool.
    ///
    /// # Errors
    /// Fails for backends without quick-launch support.
    fn create_quick_launcher(&self, container: Arc<dyn Container>) -> Result<Arc<dyn Runtime>> {
        drop(container);
        Err(Error::Package(format!(
            "the {} runtime does not support quick-launch",
            self.identifier()
        )))
    }
}

/// Registry of runtime backends, keyed by identifier.
#[derive(Debug, Default)]
pub struct RuntimeFactory {
    managers: Mutex<Vec<Arc<dyn RuntimeManager>>>,
}

impl RuntimeFactory {
    /// Create an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend. Registration is idempotent by identifier:
    /// registering a duplicate is a no-op returning `false`.
    pub fn register(&self, manager: Arc<dyn RuntimeManager>) -> bool {
        let mut managers = self.managers.lock();
        if managers
            .iter()
            .any(|m| m.identifier() == manager.identifier())
        {
            warn!(id = manager.identifier(), "runtime manager already registered");
            return false;
        }
        managers.push(manager);
        true
    }

    /// Look up a backend by identifier.
    #[must_use]
    pub fn manager(&self, identifier: &str) -> Option<Arc<dyn RuntimeManager>> {
        self.managers
            .lock()
            .iter()
            .find(|m| m.identifier() == identifier)
            .cloned()
    }

    /// All registered identifiers, in registration order.
    #[must_use]
    pub fn runtime_ids(&self) -> Vec<String> {
        self.managers
            .lock()
            .iter()
            .map(|m| m.identifier().to_owned())
            .collect()
    }

    /// Create a runtime for `application` via the backend registered under
    /// its runtime name.
    ///
    /// # Errors
    /// Fails for unknown identifiers and backend creation failures.
    pub fn create(
        &self,
        container: Option<Arc<dyn Container>>,
        application: &Arc<Application>,
    ) -> Result<Arc<dyn Runtime>> {
        let name = application.runtime_name().to_owned();
        let manager = self.manager(&name).ok_or_else(|| {
            Error::Package(format!("no runtime manager found for runtime: {name}"))
        })?;
        manager.create(container, Some(Arc::clone(application)))
    }

    /// Create a pooled quick-launch runtime.
    ///
    /// # Errors
    /// Fails for unknown identifiers and backends without quick-launch
    /// support.
    pub fn create_quick_launcher(
        &self,
        container: Arc<dyn Container>,
        identifier: &str,
    ) -> Result<Arc<dyn Runtime>> {
        let manager = self.manager(identifier).ok_or_else(|| {
            Error::Package(format!("no runtime manager found for runtime: {identifier}"))
        })?;
        manager.create_quick_launcher(container)
    }
}

/// A runtime executing application code inside the application manager
/// process itself (single-process deployments).
#[derive(Debug)]
pub struct InProcessRuntimeManager {
    identifier: String,
}

impl InProcessRuntimeManager {
    /// Create a manager registered under `identifier` (e.g. `qml`).
    #[must_use]
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }
}

impl RuntimeManager for InProcessRuntimeManager {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn in_process(&self) -> bool {
        true
    }

    fn create(
        &self,
        _container: Option<Arc<dyn Container>>,
        application: Option<Arc<Application>>,
    ) -> Result<Arc<dyn Runtime>> {
        Ok(Arc::new(InProcessRuntime {
            manager_id: self.identifier.clone(),
            token: *uuid::Uuid::new_v4().as_bytes(),
            application: Mutex::new(application),
            state: Mutex::new(RunState::NotRunning),
            state_changed: Signal::new(),
        }))
    }
}

/// Minimal in-process runtime: the code runs on the manager's own engine,
/// so "starting" only tracks lifecycle state.
pub struct InProcessRuntime {
    manager_id: String,
    token: [u8; 16],
    application: Mutex<Option<Arc<Application>>>,
    state: Mutex<RunState>,
    state_changed: Signal<RunState>,
}

impl InProcessRuntime {
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
}

impl std::fmt::Debug for InProcessRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessRuntime")
            .field("manager_id", &self.manager_id)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Runtime for InProcessRuntime {
    fn manager_id(&self) -> &str {
        &self.manager_id
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
        Some(std::process::id())
    }

    fn container(&self) -> Option<Arc<dyn Container>> {
        None
    }

    fn application(&self) -> Option<Arc<Application>> {
        self.application.lock().clone()
    }

    fn is_quick_launcher(&self) -> bool {
        false
    }

    fn attach_application_to_quick_launcher(&self, _app: Arc<Application>) -> bool {
        false
    }

    fn start(&self) -> bool {
        if self.application.lock().is_none() {
            return false;
        }
        self.set_state(RunState::StartingUp);
        self.set_state(RunState::Running);
        true
    }

    fn stop(&self, _force_kill: bool) {
        match self.state() {
            RunState::Running | RunState::StartingUp => {
                self.set_state(RunState::ShuttingDown);
                self.set_state(RunState::NotRunning);
            }
            RunState::ShuttingDown | RunState::NotRunning => {}
        }
    }

    fn open_document(&self, _url: &str, _mime_type: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_backend::ProcessRuntimeManager;

    #[test]
    fn registration_is_idempotent_by_identifier() {
        let factory = RuntimeFactory::new();
        assert!(factory.register(Arc::new(ProcessRuntimeManager)));
        assert!(!factory.register(Arc::new(ProcessRuntimeManager)));
        assert!(factory.register(Arc::new(InProcessRuntimeManager::new("qml"))));
        assert_eq!(factory.runtime_ids(), ["process", "qml"]);
    }

    #[test]
    fn predicates_reflect_the_backend() {
        let factory = RuntimeFactory::new();
        factory.register(Arc::new(ProcessRuntimeManager));
        factory.register(Arc::new(InProcessRuntimeManager::new("qml")));

        let process = factory.manager("process").unwrap();
        assert!(!process.in_process());
        assert!(process.supports_quick_launch());

        let qml = factory.manager("qml").unwrap();
        assert!(qml.in_process());
        assert!(!qml.supports_quick_launch());
    }

    #[test]
    fn security_tokens_are_unique() {
        let manager = InProcessRuntimeManager::new("qml");
        let a = manager.create(None, None).unwrap();
        let b = manager.create(None, None).unwrap();
        assert_ne!(a.security_token(), b.security_token());
        assert_eq!(a.security_token().len(), 16);
    }
}
