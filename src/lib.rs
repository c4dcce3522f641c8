//! hwprobe - best-effort CPU, GPU and TPM detection
//!
//! Each domain has a dispatcher that returns an owned record. Fields whose
//! source is missing stay `None`; only a missing identity is an error.

pub mod config;
pub mod error;
pub mod hardware;
pub mod platform;
pub mod report;

pub use error::{DetectError, ProbeError};
pub use report::{collect, collect_async, Domains, Snapshot};
