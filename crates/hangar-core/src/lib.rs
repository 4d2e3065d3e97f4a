//! Core types for the Hangar application manager.
//!
//! This crate carries the pieces every other Hangar crate builds on: the
//! error taxonomy, the package identifier grammar, synchronous signal
//! plumbing for the single-threaded control plane, cooperative cancellation,
//! and the device hardware identifier.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod cancel;
mod error;
mod hwid;
mod id;
mod signal;

pub use cancel::CancelToken;
pub use error::{Error, ErrorKind, Result};
pub use hwid::hardware_id;
pub use id::PackageId;
pub use signal::{Signal, Subscription};
