//! Intent dispatch between applications, mediated by timeouts.
//!
//! An intent request travels through up to four phases, each with its own
//! configurable timeout: disambiguation (multiple handlers), waiting for
//! the handling application to start, waiting for the application's reply,
//! and waiting for a system reply. An expired phase converts the pending
//! request into a `Timeout` failure and drops its listeners.

use hangar_core::{Error, PackageId, Result, Signal};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// The four intent dispatch timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentTimeouts {
    /// Waiting for a disambiguation decision.
    pub disambiguation: Duration,
    /// Waiting for the handling application to start.
    pub start_application: Duration,
    /// Waiting for the reply from the handling application.
    pub reply_from_application: Duration,
    /// Waiting for the reply from the system.
    pub reply_from_system: Duration,
}

impl Default for IntentTimeouts {
    fn default() -> Self {
        Self {
            disambiguation: Duration::from_secs(10),
            start_application: Duration::from_secs(3),
            reply_from_application: Duration::from_secs(5),
            reply_from_system: Duration::from_secs(20),
        }
    }
}

/// Dispatch phase of a pending intent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentPhase {
    /// More than one handler matched; a coordinator has to pick.
    Disambiguation,
    /// The chosen handler application is being started.
    WaitingForStart,
    /// The request was delivered; waiting for the application's reply.
    WaitingForApplicationReply,
    /// Waiting for a system-side reply.
    WaitingForSystemReply,
}

/// A pending intent request.
#[derive(Debug, Clone)]
pub struct IntentRequest {
    /// Request identifier.
    pub id: String,
    /// The requested intent.
    pub intent_id: String,
    /// The requesting application.
    pub requesting_application: Option<PackageId>,
    /// Candidate handler applications.
    pub handlers: Vec<PackageId>,
    /// Current dispatch phase.
    pub phase: IntentPhase,
    created: Instant,
    phase_entered: Instant,
}

/// Outcome published when a request leaves the table.
#[derive(Debug, Clone)]
pub struct IntentFailure {
    /// Request identifier.
    pub request: String,
    /// The requested intent.
    pub intent_id: String,
    /// Failure message (`timeout waiting for ...`).
    pub message: String,
}

/// Routes intent requests to handler applications and enforces the phase
/// timeouts.
#[derive(Debug)]
pub struct IntentServer {
    timeouts: IntentTimeouts,
    handlers: Mutex<BTreeMap<String, Vec<PackageId>>>,
    pending: Mutex<Vec<IntentRequest>>,
    request_failed: Signal<IntentFailure>,
}

impl IntentServer {
    /// Create a server with the given timeouts.
    #[must_use]
    pub fn new(timeouts: IntentTimeouts) -> Self {
        Self {
            timeouts,
            handlers: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(Vec::new()),
            request_failed: Signal::new(),
        }
    }

    /// The configured timeouts.
    #[must_use]
    pub fn timeouts(&self) -> IntentTimeouts {
        self.timeouts
    }

    /// Emitted when a pending request fails (currently only timeouts).
    #[must_use]
    pub fn request_failed(&self) -> &Signal<IntentFailure> {
        &self.request_failed
    }

    /// Register `application` as a handler for `intent_id`.
    pub fn register_handler(&self, intent_id: impl Into<String>, application: PackageId) {
        let mut handlers = self.handlers.lock();
        let entry = handlers.entry(intent_id.into()).or_default();
        if !entry.contains(&application) {
            entry.push(application);
        }
    }

    /// Remove every handler registration of `application` (when its package
    /// is removed).
    pub fn unregister_application(&self, application: &PackageId) {
        let mut handlers = self.handlers.lock();
        for entry in handlers.values_mut() {
            entry.retain(|a| a != application);
        }
        handlers.retain(|_, entry| !entry.is_empty());
    }

    /// File a new request.
    ///
    /// A single handler goes straight to `WaitingForStart`; multiple
    /// handlers enter `Disambiguation`.
    ///
    /// # Errors
    /// Fails with an `Intents` error when no handler matches.
    pub fn request(
        &self,
        intent_id: &str,
        requesting_application: Option<PackageId>,
    ) -> Result<IntentRequest> {
        let handlers = self
            .handlers
            .lock()
            .get(intent_id)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            return Err(Error::Intents(format!(
                "no handler registered for intent {intent_id}"
            )));
        }
        let phase = if handlers.len() > 1 {
            IntentPhase::Disambiguation
        } else {
            IntentPhase::WaitingForStart
        };
        let now = Instant::now();
        let request = IntentRequest {
            id: uuid::Uuid::new_v4().to_string(),
            intent_id: intent_id.to_owned(),
            requesting_application,
            handlers,
            phase,
            created: now,
            phase_entered: now,
        };
        self.pending.lock().push(request.clone());
        Ok(request)
    }

    /// Advance a pending request into its next phase.
    ///
    /// Returns `false` for unknown (already failed or finished) requests.
    pub fn advance(&self, request_id: &str, phase: IntentPhase) -> bool {
        let mut pending = self.pending.lock();
        if let Some(request) = pending.iter_mut().find(|r| r.id == request_id) {
            request.phase = phase;
            request.phase_entered = Instant::now();
            true
        } else {
            false
        }
    }

    /// Complete a pending request, dropping it from the table.
    pub fn finish(&self, request_id: &str) -> bool {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|r| r.id != request_id);
        pending.len() != before
    }

    /// Number of pending requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Convert expired requests into `Timeout` failures and drop their
    /// listeners. Call periodically from the dispatcher.
    pub fn process_timeouts(&self) {
        self.process_timeouts_at(Instant::now());
    }

    fn process_timeouts_at(&self, now: Instant) {
        let expired: Vec<IntentRequest> = {
            let mut pending = self.pending.lock();
            let (expired, kept) = pending.drain(..).partition(|request| {
                let limit = match request.phase {
                    IntentPhase::Disambiguation => self.timeouts.disambiguation,
                    IntentPhase::WaitingForStart => self.timeouts.start_application,
                    IntentPhase::WaitingForApplicationReply => {
                        self.timeouts.reply_from_application
                    }
                    IntentPhase::WaitingForSystemReply => self.timeouts.reply_from_system,
                };
                now.duration_since(request.phase_entered) >= limit
            });
            *pending = kept;
            expired
        };

        for request in expired {
            debug!(request = %request.id, intent = %request.intent_id, phase = ?request.phase,
                   age = ?now.duration_since(request.created), "intent request timed out");
            self.request_failed.emit(&IntentFailure {
                request: request.id.clone(),
                intent_id: request.intent_id.clone(),
                message: format!("timeout while waiting in phase {:?}", request.phase),
            });
        }
    }
}

impl Default for IntentServer {
    fn default() -> Self {
        Self::new(IntentTimeouts::default())
    }
}
