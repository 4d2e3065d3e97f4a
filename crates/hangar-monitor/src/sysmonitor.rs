//! System-wide monitoring with the same bounded ring model as the process
//! monitor.

use crate::system::{CpuReader, GpuReader, IoLoad, IoReader, MemoryReader, MemoryUsage};
use hangar_core::Signal;
use crate::monitor::MonitorEvent;
use parking_lot::Mutex;
use std::path::Path;

/// One system-wide reading.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemSample {
    /// Total CPU load in `[0, 1]`.
    pub cpu_load: f64,
    /// GPU load in `[0, 1]`; stays `0.0` without a GPU source.
    pub gpu_load: f64,
    /// Memory snapshot.
    pub memory: MemoryUsage,
    /// Block-device throughput, one entry per monitored device, in the
    /// order the devices were configured.
    pub io: [IoLoad; MAX_IO_DEVICES],
}

/// Upper bound of monitored block devices.
pub const MAX_IO_DEVICES: usize = 4;

struct Readers {
    cpu: CpuReader,
    gpu: GpuReader,
    memory: MemoryReader,
    io: Vec<IoReader>,
}

/// System-wide CPU/GPU/memory/IO sampling with a bounded ring of samples
/// (newest first), driven by an external timer via [`tick`](Self::tick).
pub struct SystemMonitor {
    readers: Mutex<Readers>,
    ring: Mutex<Vec<SystemSample>>,
    count: usize,
    cpu_enabled: Mutex<bool>,
    memory_enabled: Mutex<bool>,
    events: Signal<MonitorEvent>,
}

impl SystemMonitor {
    /// Create a monitor with `count` retained samples (minimum 2), over the
    /// platform `/proc`.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self::with_proc_root(count, "/proc", &[])
    }

    /// Create a monitor over a substitute proc filesystem, watching the
    /// given block devices (automated-test mode).
    #[must_use]
    pub fn with_proc_root(count: usize, proc_root: impl AsRef<Path>, io_devices: &[&str]) -> Self {
        let proc_root = proc_root.as_ref();
        let count = count.max(crate::monitor::MIN_SAMPLE_COUNT);
        let io = io_devices
            .iter()
            .take(MAX_IO_DEVICES)
            .map(|device| IoReader::with_proc_root(*device, proc_root))
            .collect();
        Self {
            readers: Mutex::new(Readers {
                cpu: CpuReader::with_proc_root(proc_root),
                gpu: GpuReader::new(),
                memory: MemoryReader::with_proc_root(proc_root),
                io,
            }),
            ring: Mutex::new(vec![SystemSample::default(); count]),
            count,
            cpu_enabled: Mutex::new(true),
            memory_enabled: Mutex::new(true),
            events: Signal::new(),
        }
    }

    /// Number of rows in the model.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// The model notification signal (row-moved + data-changed pairs).
    #[must_use]
    pub fn events(&self) -> &Signal<MonitorEvent> {
        &self.events
    }

    /// Snapshot of the ring, newest sample first.
    #[must_use]
    pub fn samples(&self) -> Vec<SystemSample> {
        self.ring.lock().clone()
    }

    /// Toggle CPU reporting; disabled metrics decay to zero over `count`
    /// ticks.
    pub fn enable_cpu(&self, enabled: bool) {
        *self.cpu_enabled.lock() = enabled;
    }

    /// Toggle memory reporting; same decay rule as CPU.
    pub fn enable_memory(&self, enabled: bool) {
        *self.memory_enabled.lock() = enabled;
    }

    /// Whether a GPU load source is available.
    #[must_use]
    pub fn gpu_supported(&self) -> bool {
        self.readers.lock().gpu.is_supported()
    }

    /// Take one sample and rotate the ring.
    pub fn tick(&self) -> SystemSample {
        let sample = {
            let mut readers = self.readers.lock();
            let cpu_load = if *self.cpu_enabled.lock() {
                readers.cpu.read_load_value()
            } else {
                0.0
            };
            let memory = if *self.memory_enabled.lock() {
                readers.memory.read()
            } else {
                MemoryUsage::default()
            };
            let gpu_load = readers.gpu.read_load_value();
            let mut io = [IoLoad::default(); MAX_IO_DEVICES];
            for (slot, reader) in io.iter_mut().zip(readers.io.iter_mut()) {
                *slot = reader.read();
            }
            SystemSample {
                cpu_load,
                gpu_load,
                memory,
                io,
            }
        };

        {
            let mut ring = self.ring.lock();
            ring.rotate_right(1);
            ring[0] = sample;
        }
        self.events.emit(&MonitorEvent::RowsMoved {
            from: self.count - 1,
            to: 0,
        });
        self.events.emit(&MonitorEvent::DataChanged { row: 0 });
        sample
    }
}

impl std::fmt::Debug for SystemMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemMonitor")
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_proc(root: &Path, user: u64, idle: u64, available_kb: u64) {
        fs::write(
            root.join("stat"),
            format!("cpu  {user} 0 0 {idle} 0 0 0 0 0 0\n"),
        )
        .unwrap();
        fs::write(
            root.join("meminfo"),
            format!("MemTotal: 1000000 kB\nMemAvailable: {available_kb} kB\n"),
        )
        .unwrap();
        fs::write(
            root.join("diskstats"),
            "   8       0 sda 10 0 5000 50 20 0 3000 80 0 120 130\n",
        )
        .unwrap();
    }

    #[test]
    fn tick_rotates_and_samples_everything() {
        let dir = tempfile::tempdir().unwrap();
        write_proc(dir.path(), 100, 900, 750_000);

        let monitor = SystemMonitor::with_proc_root(3, dir.path(), &["sda"]);
        let first = monitor.tick();
        assert!((first.cpu_load - 0.0).abs() < f64::EPSILON); // baseline tick
        assert_eq!(first.memory.available_kb, 750_000);

        write_proc(dir.path(), 200, 900, 500_000);
        let second = monitor.tick();
        assert!(second.cpu_load > 0.9, "{second:?}");
        assert_eq!(second.memory.available_kb, 500_000);

        let samples = monitor.samples();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], second);
        assert_eq!(samples[1], first);
    }

    #[test]
    fn disabled_metrics_decay_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        write_proc(dir.path(), 100, 900, 750_000);

        let monitor = SystemMonitor::with_proc_root(2, dir.path(), &[]);
        monitor.tick();
        monitor.enable_memory(false);
        monitor.tick();
        monitor.tick();
        assert!(monitor
            .samples()
            .iter()
            .all(|s| s.memory == MemoryUsage::default()));
    }

    #[test]
    fn gpu_stays_optional() {
        let dir = tempfile::tempdir().unwrap();
        write_proc(dir.path(), 0, 100, 1);
        let monitor = SystemMonitor::with_proc_root(2, dir.path(), &[]);
        assert!(!monitor.gpu_supported());
        assert!((monitor.tick().gpu_load - 0.0).abs() < f64::EPSILON);
    }
}
