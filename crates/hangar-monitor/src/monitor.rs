//! The per-application process monitor and its ring-buffer model.

use crate::process::{ProcessReader, Sample};
use crate::worker::{shared_worker, WorkerHandle, WorkerMsg};
use hangar_core::Signal;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Default number of samples kept in the model.
pub const DEFAULT_SAMPLE_COUNT: usize = 10;

/// Minimum number of samples the model can be configured to.
pub const MIN_SAMPLE_COUNT: usize = 2;

/// Model notifications; each incoming sample produces a row-moved plus a
/// data-changed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// The oldest row was moved to the newest slot.
    RowsMoved {
        /// Previous row index (the oldest row).
        from: usize,
        /// New row index (always 0).
        to: usize,
    },
    /// The row at `row` now carries fresh data.
    DataChanged {
        /// Updated row index.
        row: usize,
    },
}

static NEXT_MONITOR_ID: AtomicU64 = AtomicU64::new(1);

struct MonitorState {
    ring: Vec<Sample>,
}

struct MonitorInner {
    state: Mutex<MonitorState>,
    update_pending: AtomicBool,
    events: Signal<MonitorEvent>,
}

/// Periodic CPU/memory sampling for one process, backed by the shared
/// worker thread.
///
/// The model is a bounded ring: index 0 is the newest sample, the last
/// index the oldest. When a new sample arrives, the oldest row is rotated
/// to the front and overwritten.
pub struct ProcessMonitor {
    inner: Arc<MonitorInner>,
    worker: Arc<WorkerHandle>,
    id: u64,
    count: usize,
}

/// Configuration for a [`ProcessMonitor`].
#[derive(Debug)]
pub struct ProcessMonitorBuilder {
    pid: u32,
    count: usize,
    interval: Option<Duration>,
    proc_root: PathBuf,
    cpu_enabled: bool,
    memory_enabled: bool,
}

impl ProcessMonitorBuilder {
    /// Number of samples kept (default 10, minimum 2).
    #[must_use]
    pub fn count(mut self, count: usize) -> Self {
        self.count = count.max(MIN_SAMPLE_COUNT);
        self
    }

    /// Periodic sampling interval; `None` samples only on explicit
    /// [`ProcessMonitor::update`] calls.
    #[must_use]
    pub fn interval(mut self, interval: Option<Duration>) -> Self {
        self.interval = interval;
        self
    }

    /// Substitute proc filesystem (automated-test mode).
    #[must_use]
    pub fn proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    /// Toggle CPU sampling.
    #[must_use]
    pub fn cpu(mut self, enabled: bool) -> Self {
        self.cpu_enabled = enabled;
        self
    }

    /// Toggle memory sampling.
    #[must_use]
    pub fn memory(mut self, enabled: bool) -> Self {
        self.memory_enabled = enabled;
        self
    }

    /// Register with the shared worker and start monitoring.
    #[must_use]
    pub fn build(self) -> ProcessMonitor {
        let id = NEXT_MONITOR_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(MonitorInner {
            state: Mutex::new(MonitorState {
                ring: vec![Sample::default(); self.count],
            }),
            update_pending: AtomicBool::new(false),
            events: Signal::new(),
        });

        let mut reader = ProcessReader::with_proc_root(self.pid, self.proc_root);
        reader.enable_cpu(self.cpu_enabled);
        reader.enable_memory(self.memory_enabled);

        let weak: Weak<MonitorInner> = Arc::downgrade(&inner);
        let count = self.count;
        let callback = Box::new(move |sample: Sample| {
            if let Some(inner) = weak.upgrade() {
                {
                    let mut state = inner.state.lock();
                    state.ring.rotate_right(1);
                    state.ring[0] = sample;
                }
                inner.update_pending.store(false, Ordering::Release);
                inner.events.emit(&MonitorEvent::RowsMoved {
                    from: count - 1,
                    to: 0,
                });
                inner.events.emit(&MonitorEvent::DataChanged { row: 0 });
            }
        });

        let worker = shared_worker();
        worker.send(WorkerMsg::Add {
            id,
            reader,
            interval: self.interval,
            callback,
        });

        ProcessMonitor {
            inner,
            worker,
            id,
            count,
        }
    }
}

impl ProcessMonitor {
    /// Start configuring a monitor for `pid`.
    #[must_use]
    pub fn builder(pid: u32) -> ProcessMonitorBuilder {
        ProcessMonitorBuilder {
            pid,
            count: DEFAULT_SAMPLE_COUNT,
            interval: Some(Duration::from_secs(1)),
            proc_root: PathBuf::from("/proc"),
            cpu_enabled: true,
            memory_enabled: true,
        }
    }

    /// The model notification signal. Emitted from the worker thread.
    #[must_use]
    pub fn events(&self) -> &Signal<MonitorEvent> {
        &self.inner.events
    }

    /// A channel receiving a copy of every model notification.
    #[must_use]
    pub fn event_stream(&self) -> crossbeam_channel::Receiver<MonitorEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.inner.events.connect(move |event: &MonitorEvent| {
            let _ = tx.send(*event);
        });
        rx
    }

    /// Number of rows in the model.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Snapshot of the ring, newest sample first.
    #[must_use]
    pub fn samples(&self) -> Vec<Sample> {
        self.inner.state.lock().ring.clone()
    }

    /// Request one sample.
    ///
    /// Idempotent: while a previous request is still outstanding, further
    /// calls return immediately without queueing more work.
    pub fn update(&self) {
        if self
            .inner
            .update_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.worker.send(WorkerMsg::SampleNow { id: self.id });
        }
    }

    /// Follow the monitored application to a new process id.
    pub fn set_pid(&self, pid: u32) {
        self.worker.send(WorkerMsg::SetPid { id: self.id, pid });
    }

    /// Change the periodic sampling interval.
    pub fn set_interval(&self, interval: Option<Duration>) {
        self.worker.send(WorkerMsg::SetInterval {
            id: self.id,
            interval,
        });
    }

    /// Toggle CPU reporting. While disabled, fresh samples carry a zero
    /// CPU load, so the model decays to zero instead of holding stale data.
    pub fn enable_cpu(&self, enabled: bool) {
        self.worker.send(WorkerMsg::EnableCpu {
            id: self.id,
            enabled,
        });
    }

    /// Toggle memory reporting; same decay-to-zero rule as CPU.
    pub fn enable_memory(&self, enabled: bool) {
        self.worker.send(WorkerMsg::EnableMemory {
            id: self.id,
            enabled,
        });
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.worker.send(WorkerMsg::Remove { id: self.id });
    }
}

impl std::fmt::Debug for ProcessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMonitor")
            .field("id", &self.id)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}
