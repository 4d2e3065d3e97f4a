//! The shared sampling worker.
//!
//! All process monitors share one dedicated worker thread. The worker owns
//! the sampling primitives; monitors talk to it exclusively through
//! asynchronous messages, so no sampling I/O ever happens on the control
//! plane. The thread is created when the first monitor appears and torn
//! down when the last one goes away.

use crate::process::{ProcessReader, Sample};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::warn;

pub(crate) type SampleCallback = Box<dyn Fn(Sample) + Send>;

pub(crate) enum WorkerMsg {
    Add {
        id: u64,
        reader: ProcessReader,
        interval: Option<Duration>,
        callback: SampleCallback,
    },
    Remove {
        id: u64,
    },
    SetPid {
        id: u64,
        pid: u32,
    },
    SetInterval {
        id: u64,
        interval: Option<Duration>,
    },
    EnableCpu {
        id: u64,
        enabled: bool,
    },
    EnableMemory {
        id: u64,
        enabled: bool,
    },
    SampleNow {
        id: u64,
    },
    Shutdown,
}

pub(crate) struct WorkerHandle {
    tx: Sender<WorkerMsg>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl WorkerHandle {
    pub(crate) fn send(&self, msg: WorkerMsg) {
        let _ = self.tx.send(msg);
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerMsg::Shutdown);
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }
}

static SHARED_WORKER: Lazy<Mutex<Weak<WorkerHandle>>> = Lazy::new(|| Mutex::new(Weak::new()));

/// Get the process-wide sampling worker, creating it on first use.
pub(crate) fn shared_worker() -> Arc<WorkerHandle> {
    let mut slot = SHARED_WORKER.lock();
    if let Some(worker) = slot.upgrade() {
        return worker;
    }
    let (tx, rx) = crossbeam_channel::unbounded();
    let join = std::thread::Builder::new()
        .name("process-monitor".into())
        .spawn(move || worker_loop(&rx))
        .map_err(|e| warn!("could not start the monitor worker thread: {e}"))
        .ok();
    let worker = Arc::new(WorkerHandle {
        tx,
        join: Mutex::new(join),
    });
    *slot = Arc::downgrade(&worker);
    worker
}

struct Entry {
    reader: ProcessReader,
    interval: Option<Duration>,
    next_due: Option<Instant>,
    callback: SampleCallback,
}

impl Entry {
    fn sample(&mut self) {
        let sample = self.reader.update();
        (self.callback)(sample);
    }
}

fn worker_loop(rx: &Receiver<WorkerMsg>) {
    let mut entries: HashMap<u64, Entry> = HashMap::new();

    loop {
        let next_due = entries.values().filter_map(|e| e.next_due).min();
        let msg = match next_due {
            Some(due) => {
                let timeout = due.saturating_duration_since(Instant::now());
                match rx.recv_timeout(timeout) {
                    Ok(msg) => Some(msg),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match rx.recv() {
                Ok(msg) => Some(msg),
                Err(_) => return,
            },
        };

        match msg {
            Some(WorkerMsg::Add {
                id,
                reader,
                interval,
                callback,
            }) => {
                let next_due = interval.map(|i| Instant::now() + i);
                entries.insert(
                    id,
                    Entry {
                        reader,
                        interval,
                        next_due,
                        callback,
                    },
                );
            }
            Some(WorkerMsg::Remove { id }) => {
                entries.remove(&id);
            }
            Some(WorkerMsg::SetPid { id, pid }) => {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.reader.set_pid(pid);
                }
            }
            Some(WorkerMsg::SetInterval { id, interval }) => {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.interval = interval;
                    entry.next_due = interval.map(|i| Instant::now() + i);
                }
            }
            Some(WorkerMsg::EnableCpu { id, enabled }) => {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.reader.enable_cpu(enabled);
                }
            }
            Some(WorkerMsg::EnableMemory { id, enabled }) => {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.reader.enable_memory(enabled);
                }
            }
            Some(WorkerMsg::SampleNow { id }) => {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.sample();
                }
            }
            Some(WorkerMsg::Shutdown) => return,
            None => {
                // periodic tick: sample everything that is due
                let now = Instant::now();
                for entry in entries.values_mut() {
                    if entry.next_due.is_some_and(|due| due <= now) {
                        entry.sample();
                        entry.next_due = entry.interval.map(|i| now + i);
                    }
                }
            }
        }
    }
}
