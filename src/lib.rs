//! Atrium reactive kernel.
//!
//! Events, actions, the cyclic scheduler, time fuses and the dataflow
//! graph, wired together by [`kernel::Kernel`]. All ESP-IDF-specific
//! code is guarded by `#[cfg(target_os = "espidf")]` within each module,
//! so the whole kernel builds and tests on the host.

#![deny(unused_must_use)]

pub mod action;
pub mod config;
pub mod cyclic;
pub mod dataflow;
pub mod error;
pub mod event;
pub mod kernel;
pub mod platform;
pub mod status;
pub mod timefuse;
pub mod timer;

#[cfg(target_os = "espidf")]
mod esp_link_shims;

pub use error::{Error, Result};
pub use kernel::Kernel;
