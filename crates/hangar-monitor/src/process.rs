//! Per-process CPU and memory sampling primitives.
//!
//! CPU load is computed from the user+system jiffies in `/proc/<pid>/stat`
//! divided by the wall-clock time since the previous sample and the kernel
//! tick frequency. Memory is categorized by parsing `/proc/<pid>/smaps`:
//! `r-xp` mappings count as text, anonymous private writable mappings count
//! as heap (excluding the main stack and the 8 MiB thread stacks that
//! follow a `---p` guard page), and everything contributes to the totals.
//!
//! On non-Linux platforms only kernel-provided totals are reported and the
//! text/heap breakdowns stay zero.

#![allow(unsafe_code)]

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

/// Memory usage of one process, in kilobytes, split by category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Memory {
    /// Total virtual size.
    pub total_vm: u64,
    /// Total resident set size.
    pub total_rss: u64,
    /// Total proportional set size.
    pub total_pss: u64,
    /// Executable mappings.
    pub text_vm: u64,
    /// Resident executable mappings.
    pub text_rss: u64,
    /// Proportional executable mappings.
    pub text_pss: u64,
    /// Heap-like anonymous mappings.
    pub heap_vm: u64,
    /// Resident heap-like mappings.
    pub heap_rss: u64,
    /// Proportional heap-like mappings.
    pub heap_pss: u64,
}

/// One reading of a monitored process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    /// CPU load since the previous sample, `1.0` meaning one full core.
    pub cpu_load: f64,
    /// Memory usage; all zero when memory reporting is disabled.
    pub memory: Memory,
}

/// Reads CPU and memory figures for one process id.
#[derive(Debug)]
pub struct ProcessReader {
    pid: u32,
    proc_root: PathBuf,
    cpu_enabled: bool,
    memory_enabled: bool,
    last_jiffies: u64,
    last_sample: Option<Instant>,
}

impl ProcessReader {
    /// Create a reader for `pid` using the platform `/proc`.
    #[must_use]
    pub fn new(pid: u32) -> Self {
        Self::with_proc_root(pid, "/proc")
    }

    /// Create a reader over a substitute proc filesystem (automated-test
    /// mode).
    #[must_use]
    pub fn with_proc_root(pid: u32, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            pid,
            proc_root: proc_root.into(),
            cpu_enabled: true,
            memory_enabled: true,
            last_jiffies: 0,
            last_sample: None,
        }
    }

    /// The monitored process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Point the reader at another process; resets the CPU baseline.
    pub fn set_pid(&mut self, pid: u32) {
        self.pid = pid;
        self.last_jiffies = 0;
        self.last_sample = None;
    }

    /// Toggle CPU sampling. Disabled sampling reports `0.0`.
    pub fn enable_cpu(&mut self, enabled: bool) {
        self.cpu_enabled = enabled;
    }

    /// Toggle memory sampling. Disabled sampling reports zeroed fields so
    /// observers decay to zero instead of keeping stale data.
    pub fn enable_memory(&mut self, enabled: bool) {
        self.memory_enabled = enabled;
    }

    /// Take one sample.
    #[must_use]
    pub fn update(&mut self) -> Sample {
        let cpu_load = if self.cpu_enabled { self.read_cpu_load() } else { 0.0 };
        let memory = if self.memory_enabled {
            self.read_memory().unwrap_or_default()
        } else {
            Memory::default()
        };
        Sample { cpu_load, memory }
    }

    fn read_cpu_load(&mut self) -> f64 {
        let elapsed = self
            .last_sample
            .replace(Instant::now())
            .map(|t| t.elapsed());

        let stat_path = self.proc_root.join(self.pid.to_string()).join("stat");
        let Ok(stat) = fs::read_to_string(&stat_path) else {
            self.last_jiffies = 0;
            return 0.0;
        };
        // the comm field may contain spaces, so split after its closing ')'
        let Some(rest) = stat.rfind(')').map(|p| &stat[p + 1..]) else {
            return 0.0;
        };
        let fields: Vec<&str> = rest.split_ascii_whitespace().collect();
        let utime: u64 = fields.get(11).and_then(|f| f.parse().ok()).unwrap_or(0);
        let stime: u64 = fields.get(12).and_then(|f| f.parse().ok()).unwrap_or(0);
        let jiffies = utime + stime;

        let load = match elapsed {
            Some(elapsed) if !elapsed.is_zero() && jiffies >= self.last_jiffies => {
                let delta = (jiffies - self.last_jiffies) as f64 / clock_ticks_per_second();
                delta / elapsed.as_secs_f64()
            }
            _ => 0.0,
        };
        self.last_jiffies = jiffies;
        load
    }

    #[cfg(target_os = "linux")]
    fn read_memory(&self) -> Option<Memory> {
        let smaps_path = self.proc_root.join(self.pid.to_string()).join("smaps");
        let contents = fs::read_to_string(smaps_path).ok()?;
        Some(parse_smaps(&contents))
    }

    #[cfg(not(target_os = "linux"))]
    fn read_memory(&self) -> Option<Memory> {
        // only kernel-provided totals are available here
        None
    }
}

fn clock_ticks_per_second() -> f64 {
    #[cfg(unix)]
    {
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 {
            return ticks as f64;
        }
    }
    100.0
}

/// Default size of a thread stack mapping in kB; mappings of this size that
/// follow a `---p` guard page are counted as stacks, not heap.
const THREAD_STACK_KB: u64 = 8192;

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn parse_smaps(contents: &str) -> Memory {
    struct Mapping {
        perms: String,
        inode: u64,
        is_main_stack: bool,
        size: u64,
        rss: u64,
        pss: u64,
    }

    let mut memory = Memory::default();
    let mut was_private_only = false;
    let mut current: Option<Mapping> = None;

    let mut account = |mapping: &Mapping, was_private_only: &mut bool| {
        memory.total_vm += mapping.size;
        memory.total_rss += mapping.rss;
        memory.total_pss += mapping.pss;

        if mapping.perms == "r-xp" {
            memory.text_vm += mapping.size;
            memory.text_rss += mapping.rss;
            memory.text_pss += mapping.pss;
        } else if mapping.perms == "rw-p"
            && !mapping.is_main_stack
            && mapping.inode == 0
            && (mapping.size != THREAD_STACK_KB || !*was_private_only)
        {
            memory.heap_vm += mapping.size;
            memory.heap_rss += mapping.rss;
            memory.heap_pss += mapping.pss;
        }
        *was_private_only = mapping.perms == "---p";
    };

    for line in contents.lines() {
        // a mapping header looks like:
        //   address           perms offset  dev   inode   pathname
        //   55d39366a000-55d3 r-xp  0000000 08:02 1234    /usr/bin/app
        let is_header = line
            .split_ascii_whitespace()
            .next()
            .is_some_and(|addr| addr.contains('-') && addr.chars().next().is_some_and(|c| c.is_ascii_hexdigit()));

        if is_header {
            if let Some(mapping) = current.take() {
                account(&mapping, &mut was_private_only);
            }
            let mut fields = line.split_ascii_whitespace();
            let _address = fields.next();
            let perms = fields.next().unwrap_or_default().to_owned();
            let _offset = fields.next();
            let _dev = fields.next();
            let inode: u64 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
            let pathname = fields.next().unwrap_or_default();
            current = Some(Mapping {
                perms,
                inode,
                is_main_stack: pathname == "[stack]",
                size: 0,
                rss: 0,
                pss: 0,
            });
        } else if let Some(mapping) = current.as_mut() {
            if let Some(value) = line.strip_prefix("Size:") {
                mapping.size = parse_kb(value);
            } else if let Some(value) = line.strip_prefix("Rss:") {
                mapping.rss = parse_kb(value);
            } else if let Some(value) = line.strip_prefix("Pss:") {
                mapping.pss = parse_kb(value);
            }
        }
    }
    if let Some(mapping) = current.take() {
        account(&mapping, &mut was_private_only);
    }
    memory
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_kb(value: &str) -> u64 {
    value
        .trim()
        .split_ascii_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
