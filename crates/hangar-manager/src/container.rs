//! Container abstraction and the container factory.
//!
//! A container is the isolation wrapper around a running application's OS
//! process. Backends register a [`ContainerManager`] under their string
//! identifier; the default backend is `process` (a plain child process with
//! redirected stdio).

use crate::application::ExitInfo;
use hangar_core::{Error, Result, Signal};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// The execution environment for one application.
pub trait Container: Send + Sync + std::fmt::Debug {
    /// Identifier of the manager that created this container.
    fn manager_id(&self) -> &str;

    /// Whether the container finished its setup and can start a process.
    fn is_ready(&self) -> bool;

    /// Emitted once the container becomes ready.
    fn ready(&self) -> &Signal<()>;

    /// Emitted when the contained process exits.
    fn exited(&self) -> &Signal<ExitInfo>;

    /// Launch `program` inside the container.
    ///
    /// # Errors
    /// Fails if the container is already running a process or the program
    /// cannot be spawned.
    fn start(
        &self,
        program: &Path,
        arguments: &[String],
        environment: &BTreeMap<String, String>,
    ) -> Result<u32>;

    /// The contained process id, while one is running.
    fn process_id(&self) -> Option<u32>;

    /// Stop the contained process (SIGTERM, or SIGKILL with `force_kill`).
    fn stop(&self, force_kill: bool);
}

/// Creates containers of one backend flavor.
pub trait ContainerManager: Send + Sync + std::fmt::Debug {
    /// The registry key.
    fn identifier(&self) -> &str;

    /// Whether containers of this flavor may be pre-created for the
    /// quick-launch pool.
    fn supports_quick_launch(&self) -> bool;

    /// Create a container.
    ///
    /// Ownership of the stdio file descriptors transfers into the
    /// container; implementations must close them if creation fails.
    fn create(
        &self,
        stdio_redirections: Vec<i32>,
        debug_environment: BTreeMap<String, String>,
        debug_command: Vec<String>,
    ) -> Result<Arc<dyn Container>>;
}

/// Registry of container backends, keyed by identifier.
#[derive(Debug, Default)]
pub struct ContainerFactory {
    managers: Mutex<Vec<Arc<dyn ContainerManager>>>,
}

impl ContainerFactory {
    /// Create an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend. Registration is idempotent by identifier:
    /// registering a duplicate is a no-op returning `false`.
    pub fn register(&self, manager: Arc<dyn ContainerManager>) -> bool {
        let mut managers = self.managers.lock();
        if managers
            .iter()
            .any(|m| m.identifier() == manager.identifier())
        {
            warn!(id = manager.identifier(), "container manager already registered");
            return false;
        }
        managers.push(manager);
        true
    }

    /// Look up a backend by identifier.
    #[must_use]
    pub fn manager(&self, identifier: &str) -> Option<Arc<dyn ContainerManager>> {
        self.managers
            .lock()
            .iter()
            .find(|m| m.identifier() == identifier)
            .cloned()
    }

    /// All registered identifiers, in registration order.
    #[must_use]
    pub fn container_ids(&self) -> Vec<String> {
        self.managers
            .lock()
            .iter()
            .map(|m| m.identifier().to_owned())
            .collect()
    }

    /// Create a container via the backend registered under `identifier`.
    ///
    /// Ownership of `stdio_redirections` transfers; on failure (including
    /// an unknown identifier) the descriptors are closed here.
    ///
    /// # Errors
    /// Fails for unknown identifiers and backend creation failures.
    pub fn create(
        &self,
        identifier: &str,
        stdio_redirections: Vec<i32>,
        debug_environment: BTreeMap<String, String>,
        debug_command: Vec<String>,
    ) -> Result<Arc<dyn Container>> {
        let Some(manager) = self.manager(identifier) else {
            crate::process_backend::close_fds(&stdio_redirections);
            return Err(Error::Package(format!(
                "no container manager found for container: {identifier}"
            )));
        };
        manager.create(stdio_redirections, debug_environment, debug_command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_backend::ProcessContainerManager;

    #[test]
    fn registration_is_idempotent_by_identifier() {
        let factory = ContainerFactory::new();
        assert!(factory.register(Arc::new(ProcessContainerManager)));
        assert!(!factory.register(Arc::new(ProcessContainerManager)));
        assert_eq!(factory.container_ids(), ["process"]);
    }

    #[test]
    fn unknown_identifier_fails_creation() {
        let factory = ContainerFactory::new();
        let result = factory.create("lxc", Vec::new(), BTreeMap::new(), Vec::new());
        assert!(result.is_err());
    }

    #[test]
    fn lookup_by_identifier() {
        let factory = ContainerFactory::new();
        factory.register(Arc::new(ProcessContainerManager));
        assert!(factory.manager("process").is_some());
        assert!(factory.manager("lxc").is_none());
    }
}
