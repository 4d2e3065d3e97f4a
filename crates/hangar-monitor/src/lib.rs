//! Process and system resource monitoring for the Hangar application
//! manager.
//!
//! Per-application sampling runs on one worker thread shared by all
//! [`ProcessMonitor`]s, so the control plane never blocks on `/proc` I/O.
//! The system-wide readers ([`CpuReader`], [`MemoryReader`], [`IoReader`],
//! [`GpuReader`]) are synchronous and cheap; callers poll them from their
//! own timers.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod frame;
mod monitor;
mod process;
mod sysmonitor;
mod system;
mod worker;

pub use frame::{FrameRate, FrameTimer};
pub use monitor::{
    MonitorEvent, ProcessMonitor, ProcessMonitorBuilder, DEFAULT_SAMPLE_COUNT, MIN_SAMPLE_COUNT,
};
pub use process::{Memory, ProcessReader, Sample};
pub use sysmonitor::{SystemMonitor, SystemSample, MAX_IO_DEVICES};
pub use system::{CpuReader, GpuReader, IoLoad, IoReader, MemoryReader, MemoryUsage};
