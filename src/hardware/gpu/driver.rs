//! Vendor sub-probe interface
//!
//! An enumerator lists devices; a [`DriverProbe`] fills the fine-grained
//! fields of one device. Output slots in [`DriverResult`] that were not
//! requested are `None` and must be left alone by the probe.

use std::path::PathBuf;

use super::{GpuMemory, GpuType, GpuVendor};
use crate::error::ProbeError;

/// How a probe locates its device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCondition {
    /// Index in the vendor library's own enumeration order
    Index(u32),
    /// DRM card directory, e.g. `/sys/class/drm/card0`
    DrmCard(PathBuf),
}

/// A device found by an enumerator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    pub vendor: GpuVendor,
    pub condition: DriverCondition,
    pub device_id: Option<u64>,
    pub name: Option<String>,
}

/// Lists the GPUs visible through one API
pub trait GpuEnumerator: Send + Sync {
    /// API tag recorded in `GpuResult::platform_api`
    fn platform_api(&self) -> &'static str;

    fn enumerate(&self) -> Result<Vec<GpuDevice>, ProbeError>;
}

/// Vendor-specific detector for one device
pub trait DriverProbe: Send + Sync {
    fn vendor(&self) -> GpuVendor;

    fn detect(&self, condition: &DriverCondition, result: DriverResult<'_>) -> Result<(), ProbeError>;
}

/// Sparse output descriptor handed to a [`DriverProbe`]
pub struct DriverResult<'a> {
    pub index: &'a mut Option<u32>,
    pub temp: Option<&'a mut Option<f64>>,
    pub memory: Option<&'a mut GpuMemory>,
    pub shared: Option<&'a mut GpuMemory>,
    pub core_count: Option<&'a mut Option<u32>>,
    pub frequency: Option<&'a mut Option<u32>>,
    pub core_utilization_rate: &'a mut Option<f64>,
    pub gpu_type: &'a mut GpuType,
    pub device_id: &'a mut Option<u64>,
    pub uuid: &'a mut String,
    pub name: &'a mut String,
    pub driver: &'a mut String,
}

impl DriverResult<'_> {
    pub fn wants_temp(&self) -> bool {
        self.temp.is_some()
    }

    pub fn wants_memory(&self) -> bool {
        self.memory.is_some()
    }

    pub fn wants_shared(&self) -> bool {
        self.shared.is_some()
    }

    pub fn wants_core_count(&self) -> bool {
        self.core_count.is_some()
    }

    pub fn wants_frequency(&self) -> bool {
        self.frequency.is_some()
    }

    pub fn set_temp(&mut self, celsius: f64) {
        if let Some(slot) = self.temp.as_deref_mut() {
            *slot = Some(celsius);
        }
    }

    pub fn set_memory(&mut self, total: Option<u64>, used: Option<u64>) {
        if let Some(slot) = self.memory.as_deref_mut() {
            slot.total = total;
            slot.used = used;
        }
    }

    pub fn set_shared(&mut self, total: Option<u64>, used: Option<u64>) {
        if let Some(slot) = self.shared.as_deref_mut() {
            slot.total = total;
            slot.used = used;
        }
    }

    pub fn set_core_count(&mut self, count: u32) {
        if let Some(slot) = self.core_count.as_deref_mut() {
            *slot = Some(count);
        }
    }

    /// Max clock in MHz
    pub fn set_frequency(&mut self, mhz: u32) {
        if let Some(slot) = self.frequency.as_deref_mut() {
            *slot = Some(mhz);
        }
    }

    pub fn set_name(&mut self, name: String) {
        if !name.is_empty() {
            *self.name = name;
        }
    }
}
