//! Task identities, states and events.

use hangar_archive::PackageMetadata;
use hangar_core::{CancelToken, Error, ErrorKind, PackageId, Result, Signal};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Server-assigned identifier of an asynchronous task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Lifecycle states of an asynchronous task.
///
/// All tasks move `Queued → Executing → (Failed | Finished)`; installation
/// tasks additionally pass through `Installing → AwaitingAcknowledge →
/// CleaningUp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for a free execution slot.
    Queued,
    /// The task body started.
    Executing,
    /// Terminal failure state.
    Failed,
    /// Terminal success state.
    Finished,
    /// Extracting and verifying the package (installation only).
    Installing,
    /// Waiting for the coordinator's go-ahead (installation only).
    AwaitingAcknowledge,
    /// Removing staging leftovers and backups (installation only).
    CleaningUp,
}

impl TaskState {
    /// Whether the task cannot change state anymore.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Finished)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Failed => "failed",
            Self::Finished => "finished",
            Self::Installing => "installing",
            Self::AwaitingAcknowledge => "awaitingAcknowledge",
            Self::CleaningUp => "cleaningUp",
        };
        f.write_str(name)
    }
}

/// Events published by the installation pipeline, in the order the
/// corresponding states are entered.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A task entered a new state.
    StateChanged {
        /// Task identifier.
        task: TaskId,
        /// The state just entered.
        state: TaskState,
    },
    /// Extraction/packing progress in `[0, 1]`.
    Progress {
        /// Task identifier.
        task: TaskId,
        /// Progress ratio.
        progress: f64,
    },
    /// An installation reached the acknowledge gate; nothing has been
    /// written into the installed tree yet.
    RequestingInstallationAcknowledge {
        /// Task identifier.
        task: TaskId,
        /// Metadata of the package awaiting installation.
        metadata: PackageMetadata,
    },
    /// Terminal failure.
    Failed {
        /// Task identifier.
        task: TaskId,
        /// Coarse error category.
        kind: ErrorKind,
        /// Human-readable message.
        message: String,
    },
    /// Terminal success. For installations this is emitted strictly after
    /// the package was registered with the database; for removals strictly
    /// after it was unregistered.
    Finished {
        /// Task identifier.
        task: TaskId,
    },
}

/// Shared control block of one task.
pub(crate) struct TaskControl {
    pub(crate) id: TaskId,
    pub(crate) cancel: CancelToken,
    state: Mutex<TaskState>,
    package_id: Mutex<Option<PackageId>>,
    ack: Mutex<Option<bool>>,
    ack_cond: Condvar,
    last_progress_percent: AtomicU64,
    events: Arc<Signal<TaskEvent>>,
}

impl TaskControl {
    pub(crate) fn new(events: Arc<Signal<TaskEvent>>) -> Arc<Self> {
        Arc::new(Self {
            id: TaskId::new(),
            cancel: CancelToken::new(),
            state: Mutex::new(TaskState::Queued),
            package_id: Mutex::new(None),
            ack: Mutex::new(None),
            ack_cond: Condvar::new(),
            last_progress_percent: AtomicU64::new(0),
            events,
        })
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub(crate) fn package_id(&self) -> Option<PackageId> {
        self.package_id.lock().clone()
    }

    pub(crate) fn set_package_id(&self, id: PackageId) {
        *self.package_id.lock() = Some(id);
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        {
            let mut current = self.state.lock();
            if *current == state || current.is_terminal() {
                return;
            }
            *current = state;
        }
        self.events.emit(&TaskEvent::StateChanged {
            task: self.id.clone(),
            state,
        });
    }

    pub(crate) fn fail(&self, error: &Error) {
        self.set_state(TaskState::Failed);
        self.events.emit(&TaskEvent::Failed {
            task: self.id.clone(),
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    pub(crate) fn finish(&self) {
        self.set_state(TaskState::Finished);
        self.events.emit(&TaskEvent::Finished {
            task: self.id.clone(),
        });
    }

    /// Emit a progress event, deduplicated to whole percent steps.
    pub(crate) fn report_progress(&self, progress: f64) {
        let percent = (progress.clamp(0.0, 1.0) * 100.0) as u64;
        if self.last_progress_percent.swap(percent, Ordering::Relaxed) != percent {
            self.events.emit(&TaskEvent::Progress {
                task: self.id.clone(),
                progress: percent as f64 / 100.0,
            });
        }
    }

    /// Announce the acknowledge gate and block until the coordinator calls
    /// [`acknowledge`](Self::resolve_acknowledge) or the task is canceled.
    pub(crate) fn await_acknowledge(&self, metadata: PackageMetadata) -> Result<()> {
        self.set_state(TaskState::AwaitingAcknowledge);
        self.events
            .emit(&TaskEvent::RequestingInstallationAcknowledge {
                task: self.id.clone(),
                metadata,
            });

        let mut decision = self.ack.lock();
        while decision.is_none() {
            self.ack_cond.wait(&mut decision);
        }
        if *decision == Some(true) && !self.cancel.is_canceled() {
            Ok(())
        } else {
            Err(Error::Canceled)
        }
    }

    /// Resolve the acknowledge gate. The first resolution wins.
    pub(crate) fn resolve_acknowledge(&self, accept: bool) {
        let mut decision = self.ack.lock();
        if decision.is_none() {
            *decision = Some(accept);
            self.ack_cond.notify_all();
        }
    }
}

impl std::fmt::Debug for TaskControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskControl")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
