//! Hardware detection module
//!
//! Detects CPU, GPU and TPM information using sysctl-style properties,
//! sysinfo, vendor driver libraries (NVML, MTML, TBS) and Linux sysfs.

pub mod cpu;
pub mod gpu;
pub mod thermal;
pub mod tpm;
pub mod utilization;

pub use cpu::{detect_cpu, CpuOptions, CpuResult};
pub use gpu::{detect_gpus, GpuOptions, GpuResult};
pub use tpm::{detect_tpm, TpmResult};
