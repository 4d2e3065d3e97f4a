//! Filesystem mount table watching.
//!
//! Subscribers register directory paths; when the mount state of a
//! subscribed path changes between two observations of the mount table, one
//! [`MountEvent`] is emitted for it. The default table is `/proc/self/mounts`
//! observed by a polling worker; tests can substitute a writable file and
//! drive observations deterministically via [`MountWatcher::poll_now`].

use hangar_core::Signal;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default mount table on Linux.
const DEFAULT_MOUNT_TAB: &str = "/proc/self/mounts";

/// Polling fallback interval.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A mount state transition of a subscribed mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEvent {
    /// The subscribed mount point.
    pub mount_point: PathBuf,
    /// The device now mounted there, or `None` after an unmount.
    pub device: Option<String>,
}

struct WatchState {
    mount_points: BTreeSet<PathBuf>,
    /// Mount table as of the last observation; captured when the first
    /// mount point is added.
    mounts: Option<BTreeMap<PathBuf, String>>,
}

struct Inner {
    mount_tab: PathBuf,
    state: Mutex<WatchState>,
    mount_changed: Signal<MountEvent>,
    stop: AtomicBool,
    poller_running: AtomicBool,
}

/// Watches the mount table and reports transitions of subscribed paths.
#[derive(Clone)]
pub struct MountWatcher {
    inner: Arc<Inner>,
}

impl MountWatcher {
    /// Create a watcher over the platform mount table.
    #[must_use]
    pub fn new() -> Self {
        Self::with_mount_tab(DEFAULT_MOUNT_TAB)
    }

    /// Create a watcher over a substitute mount table file (automated-test
    /// mode).
    #[must_use]
    pub fn with_mount_tab(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                mount_tab: path.into(),
                state: Mutex::new(WatchState {
                    mount_points: BTreeSet::new(),
                    mounts: None,
                }),
                mount_changed: Signal::new(),
                stop: AtomicBool::new(false),
                poller_running: AtomicBool::new(false),
            }),
        }
    }

    /// The signal fired on every observed state transition of a subscribed
    /// mount point. Emission happens on the polling thread.
    #[must_use]
    pub fn mount_changed(&self) -> &Signal<MountEvent> {
        &self.inner.mount_changed
    }

    /// Subscribe to state changes of `mount_point`.
    ///
    /// The very first subscription captures the baseline mount state.
    /// Starts the polling worker if it is not running yet.
    pub fn add_mount_point(&self, mount_point: impl Into<PathBuf>) {
        let mount_point = mount_point.into();
        if mount_point.as_os_str().is_empty() {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            state.mount_points.insert(mount_point);
            if state.mounts.is_none() {
                state.mounts = Some(read_mount_tab(&self.inner.mount_tab));
            }
        }
        self.ensure_poller();
    }

    /// Drop the subscription for `mount_point`.
    pub fn remove_mount_point(&self, mount_point: &Path) {
        self.inner.state.lock().mount_points.remove(mount_point);
    }

    /// The mount table as currently observed (mount point to device source).
    #[must_use]
    pub fn current_mount_points(&self) -> BTreeMap<PathBuf, String> {
        if let Some(mounts) = &self.inner.state.lock().mounts {
            return mounts.clone();
        }
        read_mount_tab(&self.inner.mount_tab)
    }

    /// Observe the mount table once, synchronously, and emit events for
    /// every subscribed path whose state changed. Used by tests and by the
    /// polling worker.
    pub fn poll_now(&self) {
        let new_mounts = read_mount_tab(&self.inner.mount_tab);
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if state.mount_points.is_empty() {
                state.mounts = Some(new_mounts);
                return;
            }
            let mount_points = state.mount_points.clone();
            let old = state.mounts.get_or_insert_with(BTreeMap::new);
            for mp in &mount_points {
                let was = old.contains_key(mp);
                let is = new_mounts.contains_key(mp);
                if was != is {
                    events.push(MountEvent {
                        mount_point: mp.clone(),
                        device: new_mounts.get(mp).cloned(),
                    });
                }
            }
            state.mounts = Some(new_mounts);
        }
        for event in events {
            debug!(mount_point = %event.mount_point.display(), device = ?event.device,
                   "mount state changed");
            self.inner.mount_changed.emit(&event);
        }
    }

    fn ensure_poller(&self) {
        if self.inner.poller_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let watcher = self.clone();
        let spawned = std::thread::Builder::new()
            .name("mount-watcher".into())
            .spawn(move || {
                while !watcher.inner.stop.load(Ordering::SeqCst) {
                    std::thread::sleep(POLL_INTERVAL);
                    watcher.poll_now();
                }
            });
        if let Err(e) = spawned {
            self.inner.poller_running.store(false, Ordering::SeqCst);
            warn!("could not start the mount watcher thread: {e}");
        }
    }

    /// Stop the polling worker. Called automatically when the last clone is
    /// dropped.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }
}

impl Default for MountWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MountWatcher {
    fn drop(&mut self) {
        // the poller holds one clone itself
        if Arc::strong_count(&self.inner) <= 2 {
            self.stop();
        }
    }
}

impl std::fmt::Debug for MountWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountWatcher")
            .field("mount_tab", &self.inner.mount_tab)
            .finish_non_exhaustive()
    }
}

/// Parse a `fstab`-style mount table into mount-point → device.
fn read_mount_tab(path: &Path) -> BTreeMap<PathBuf, String> {
    let mut result = BTreeMap::new();
    let Ok(contents) = fs::read_to_string(path) else {
        return result;
    };
    for line in contents.lines() {
        let mut fields = line.split_ascii_whitespace();
        let (Some(device), Some(mount_point)) = (fields.next(), fields.next()) else {
            continue;
        };
        result.insert(
            PathBuf::from(unescape_mount_path(mount_point)),
            device.to_owned(),
        );
    }
    result
}

/// Decode the octal escapes (`\040` for space etc.) used in mount tables.
fn unescape_mount_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        if digits.len() == 3 {
            if let Ok(code) = u8::from_str_radix(&digits, 8) {
                out.push(code as char);
                chars.nth(2);
                continue;
            }
        }
        out.push(c);
    }
    out
}
