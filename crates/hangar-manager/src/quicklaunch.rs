//! The quick-launch pool.
//!
//! To hide container startup latency, a small set of (container, runtime)
//! pairs is created ahead of time and handed out when an application starts.
//! Rebuilding the pool is rate-limited to one entry per tick and can be
//! gated on system CPU idle.

use crate::container::{Container, ContainerFactory};
use crate::runtime::{Runtime, RuntimeFactory};
use hangar_core::Signal;
use hangar_monitor::CpuReader;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Pool configuration.
#[derive(Debug)]
pub struct QuickLaunchConfig {
    /// Maximum pooled pairs per (container, runtime) combination.
    pub runtimes_per_container: usize,
    /// Defer rebuilds while the system CPU load is above this threshold.
    pub idle_load: Option<f64>,
    /// Substitute CPU reader (automated-test mode).
    pub cpu_reader: Option<CpuReader>,
}

impl Default for QuickLaunchConfig {
    fn default() -> Self {
        Self {
            runtimes_per_container: 1,
            idle_load: None,
            cpu_reader: None,
        }
    }
}

struct PoolEntry {
    container_id: String,
    /// `None` when the runtime flavor cannot idle in the pool; such entries
    /// keep a warm container only.
    runtime_id: Option<String>,
    maximum: usize,
    pairs: Vec<(Arc<dyn Container>, Option<Arc<dyn Runtime>>)>,
}

/// Pre-created container/runtime pairs, handed out on application start.
pub struct QuickLaunch {
    container_factory: Arc<ContainerFactory>,
    runtime_factory: Arc<RuntimeFactory>,
    entries: Mutex<Vec<PoolEntry>>,
    idle_threshold: Option<f64>,
    cpu: Mutex<CpuReader>,
    is_idle: AtomicBool,
    shutting_down: AtomicBool,
    finished_emitted: AtomicBool,
    shut_down_finished: Signal<()>,
}

impl QuickLaunch {
    /// Set up the pool over every quick-launch capable (container, runtime)
    /// combination currently registered.
    #[must_use]
    pub fn new(
        container_factory: Arc<ContainerFactory>,
        runtime_factory: Arc<RuntimeFactory>,
        config: QuickLaunchConfig,
    ) -> Arc<Self> {
        let mut entries = Vec::new();
        for container_id in container_factory.container_ids() {
            let supports_ql = container_factory
                .manager(&container_id)
                .is_some_and(|m| m.supports_quick_launch());
            if !supports_ql {
                continue;
            }
            for runtime_id in runtime_factory.runtime_ids() {
                let Some(runtime_manager) = runtime_factory.manager(&runtime_id) else {
                    continue;
                };
                if runtime_manager.in_process() {
                    continue;
                }
                let runtime_id = runtime_manager
                    .supports_quick_launch()
                    .then_some(runtime_id);
                debug!(
                    container = %container_id,
                    runtime = runtime_id.as_deref().unwrap_or("(no runtime)"),
                    max = config.runtimes_per_container,
                    "quick-launch pool entry"
                );
                entries.push(PoolEntry {
                    container_id: container_id.clone(),
                    runtime_id,
                    maximum: config.runtimes_per_container,
                    pairs: Vec::new(),
                });
            }
        }

        Arc::new(Self {
            container_factory,
            runtime_factory,
            entries: Mutex::new(entries),
            idle_threshold: config.idle_load,
            cpu: Mutex::new(config.cpu_reader.unwrap_or_default()),
            is_idle: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            finished_emitted: AtomicBool::new(false),
            shut_down_finished: Signal::new(),
        })
    }

    /// Emitted exactly once after [`shut_down`](Self::shut_down), when the
    /// pool population has reached zero.
    #[must_use]
    pub fn shut_down_finished(&self) -> &Signal<()> {
        &self.shut_down_finished
    }

    /// Number of pooled pairs.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.entries.lock().iter().map(|e| e.pairs.len()).sum()
    }

    /// Periodic driver: applies the CPU-idle gate and rebuilds at most one
    /// pool entry. Returns `true` while more rebuilding is pending.
    pub fn tick(&self) -> bool {
        if let Some(threshold) = self.idle_threshold {
            let load = self.cpu.lock().read_load_value();
            let now_idle = load <= threshold;
            self.is_idle.store(now_idle, Ordering::SeqCst);
            if !now_idle {
                // rebuilds are deferred until the next idle tick
                return self.deficit() > 0;
            }
        }
        self.rebuild()
    }

    /// Create at most one missing pool pair. Returns `true` while more
    /// pairs are missing.
    pub fn rebuild(&self) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        if self.idle_threshold.is_some() && !self.is_idle.load(Ordering::SeqCst) {
            // deferred until the next idle tick
            return self.deficit() > 0;
        }

        let mut todo = 0usize;
        let mut done = 0usize;
        let mut entries = self.entries.lock();
        for entry in entries.iter_mut() {
            if entry.pairs.len() >= entry.maximum {
                continue;
            }
            todo += entry.maximum - entry.pairs.len();
            if done >= 1 {
                continue;
            }

            let container = match self.container_factory.create(
                &entry.container_id,
                Vec::new(),
                BTreeMap::new(),
                Vec::new(),
            ) {
                Ok(container) => container,
                Err(e) => {
                    warn!(container = %entry.container_id,
                          "could not create quick-launch container: {e}");
                    continue;
                }
            };

            let runtime = match &entry.runtime_id {
                Some(runtime_id) => {
                    match self
                        .runtime_factory
                        .create_quick_launcher(Arc::clone(&container), runtime_id)
                    {
                        Ok(runtime) => {
                            if !runtime.start() {
                                warn!(runtime = %runtime_id,
                                      "could not start quick-launch runtime");
                                continue;
                            }
                            Some(runtime)
                        }
                        Err(e) => {
                            warn!(runtime = %runtime_id,
                                  "could not create quick-launch runtime: {e}");
                            continue;
                        }
                    }
                }
                None => None,
            };

            debug!(container = %entry.container_id,
                   runtime = entry.runtime_id.as_deref().unwrap_or("(no runtime)"),
                   "added a new entry to the quick-launch pool");
            entry.pairs.push((container, runtime));
            done += 1;
        }
        todo > done
    }

    /// Hand out a pooled pair.
    ///
    /// Two passes: first an exact (container, runtime) match, then a
    /// container-only match that lets the caller attach a fresh runtime.
    /// Ownership transfers to the caller; a rebuild is kicked off for the
    /// consumed slot.
    #[must_use]
    pub fn take(
        &self,
        container_id: &str,
        runtime_id: &str,
    ) -> Option<(Arc<dyn Container>, Option<Arc<dyn Runtime>>)> {
        let taken = {
            let mut entries = self.entries.lock();
            let mut found = None;
            for pass in 1..=2 {
                for entry in entries.iter_mut() {
                    if entry.container_id != container_id {
                        continue;
                    }
                    let matches = match pass {
                        1 => entry.runtime_id.as_deref() == Some(runtime_id),
                        _ => entry.runtime_id.is_none(),
                    };
                    if matches && !entry.pairs.is_empty() {
                        found = Some(entry.pairs.remove(0));
                        break;
                    }
                }
                if found.is_some() {
                    break;
                }
            }
            found
        };
        if taken.is_some() {
            self.rebuild();
        }
        taken
    }

    /// Stop every pooled runtime, delete the pooled containers and emit
    /// [`shut_down_finished`](Self::shut_down_finished) exactly once when
    /// the population reaches zero (immediately if it already is).
    pub fn shut_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let drained: Vec<_> = {
            let mut entries = self.entries.lock();
            entries.iter_mut().flat_map(|e| e.pairs.drain(..)).collect()
        };
        for (container, runtime) in drained {
            if let Some(runtime) = runtime {
                runtime.stop(false);
            } else {
                container.stop(false);
            }
        }
        if !self.finished_emitted.swap(true, Ordering::SeqCst) {
            self.shut_down_finished.emit(&());
        }
    }
}

impl std::fmt::Debug for QuickLaunch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuickLaunch")
            .field("pool_size", &self.pool_size())
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl QuickLaunch {
    fn deficit(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .map(|e| e.maximum.saturating_sub(e.pairs.len()))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_backend::{ProcessContainerManager, ProcessRuntimeManager};
    use crate::runtime::InProcessRuntimeManager;
    use std::sync::atomic::AtomicUsize;

    fn factories() -> (Arc<ContainerFactory>, Arc<RuntimeFactory>) {
        let cf = Arc::new(ContainerFactory::new());
        cf.register(Arc::new(ProcessContainerManager));
        let rf = Arc::new(RuntimeFactory::new());
        rf.register(Arc::new(ProcessRuntimeManager));
        rf.register(Arc::new(InProcessRuntimeManager::new("qml")));
        (cf, rf)
    }

    #[test]
    fn in_process_runtimes_get_no_pool_entry() {
        let (cf, rf) = factories();
        let pool = QuickLaunch::new(cf, rf, QuickLaunchConfig::default());
        // only process/process qualifies
        while pool.rebuild() {}
        assert_eq!(pool.pool_size(), 1);
    }

    #[test]
    fn take_prefers_exact_match_and_triggers_rebuild() {
        let (cf, rf) = factories();
        let pool = QuickLaunch::new(cf, rf, QuickLaunchConfig::default());
        while pool.rebuild() {}

        let (container, runtime) = pool.take("process", "process").expect("pooled pair");
        assert_eq!(container.manager_id(), "process");
        let runtime = runtime.expect("pooled runtime");
        assert!(runtime.is_quick_launcher());

        // the consumed slot was rebuilt inline
        assert_eq!(pool.pool_size(), 1);
    }

    #[test]
    fn take_for_unknown_combination_returns_none() {
        let (cf, rf) = factories();
        let pool = QuickLaunch::new(cf, rf, QuickLaunchConfig::default());
        while pool.rebuild() {}
        assert!(pool.take("lxc", "process").is_none());
        assert!(pool.take("process", "qml").is_none());
    }

    #[test]
    fn shut_down_finishes_exactly_once_even_when_empty() {
        let (cf, rf) = factories();
        let pool = QuickLaunch::new(cf, rf, QuickLaunchConfig::default());

        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        pool.shut_down_finished().connect(move |()| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        // empty pool: the signal still fires, exactly once
        pool.shut_down();
        pool.shut_down();
        assert_eq!(finished.load(Ordering::Relaxed), 1);
        assert_eq!(pool.pool_size(), 0);

        // no rebuilds after shutdown
        assert!(!pool.rebuild());
        assert_eq!(pool.pool_size(), 0);
    }

    #[test]
    fn busy_cpu_defers_rebuilds() {
        use std::fs;
        let dir = tempfile::tempdir().unwrap();
        let write_stat = |user: u64, idle: u64| {
            fs::write(
                dir.path().join("stat"),
                format!("cpu  {user} 0 0 {idle} 0 0 0 0 0 0\n"),
            )
            .unwrap();
        };
        write_stat(0, 1000);

        let (cf, rf) = factories();
        let pool = QuickLaunch::new(
            cf,
            rf,
            QuickLaunchConfig {
                runtimes_per_container: 1,
                idle_load: Some(0.5),
                cpu_reader: Some(CpuReader::with_proc_root(dir.path())),
            },
        );

        // first tick establishes the CPU baseline (load 0.0 -> idle)
        pool.tick();
        assert_eq!(pool.pool_size(), 1);

        // the system turns busy: taking a pair leaves the deficit in place
        write_stat(1000, 1010);
        assert!(!pool.tick());
        let _ = pool.take("process", "process").unwrap();
        assert_eq!(pool.pool_size(), 0);

        write_stat(2000, 1020);
        assert!(pool.tick(), "rebuild must stay deferred while busy");
        assert_eq!(pool.pool_size(), 0);

        // idle again: the pool refills
        write_stat(2001, 9000);
        pool.tick();
        assert_eq!(pool.pool_size(), 1);
    }
}
