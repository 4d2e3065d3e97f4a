//! Package discovery and metadata for the Hangar application manager.
//!
//! This crate owns the manifest model ([`PackageInfo`]), the mount watcher
//! used to hot-attach installation media, and the [`PackageDatabase`] that
//! discovers, validates and caches built-in and installed packages.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod database;
mod manifest;
mod mounts;

pub use database::{
    Locations, PackageDatabase, PackageDatabaseBuilder, DEFAULT_REPORT_KEY,
};
pub use manifest::{
    ApplicationInfo, IntentInfo, OpenGlConfiguration, PackageInfo, PackageInfoFormat,
    DATA_STREAM_VERSION, MANIFEST_FORMAT_TYPE, MANIFEST_FORMAT_VERSION,
};
pub use mounts::{MountEvent, MountWatcher};
