//! GPU detection module
//!
//! Detects GPUs using:
//! - NVIDIA: NVML (`nvml.dll` / `libnvidia-ml.so.1`), loaded on demand
//! - Moore Threads: MTML (`libmtml.so`), loaded on demand
//! - AMD/Intel: DRM driver attributes under `/sys/class/drm` (Linux)
//!
//! Enumeration decides how many entries are returned; vendor sub-probes only
//! fill in fields. A failing sub-probe degrades its own entry and nothing else.

pub mod driver;
pub mod drm;
pub mod mtml;
pub mod nvml;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use driver::{DriverCondition, DriverProbe, DriverResult, GpuDevice, GpuEnumerator};

use crate::config::VendorConfig;
use crate::error::DetectError;
use crate::platform::library::{LibraryLoader, SystemLoader};

/// GPU vendor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    MooreThreads,
    Unknown,
}

impl GpuVendor {
    /// Vendor from a PCI vendor ID
    pub fn from_pci_vendor(id: u32) -> Self {
        match id {
            0x10de => GpuVendor::Nvidia,
            0x1002 | 0x1022 => GpuVendor::Amd,
            0x8086 => GpuVendor::Intel,
            0x1ed5 => GpuVendor::MooreThreads,
            _ => GpuVendor::Unknown,
        }
    }
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Amd => write!(f, "AMD"),
            GpuVendor::Intel => write!(f, "Intel"),
            GpuVendor::MooreThreads => write!(f, "Moore Threads"),
            GpuVendor::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Integrated or discrete adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuType {
    Integrated,
    Discrete,
    #[default]
    Unknown,
}

/// Memory usage in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuMemory {
    pub total: Option<u64>,
    pub used: Option<u64>,
}

/// Optional GPU probes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuOptions {
    /// Read the GPU temperature
    #[serde(default)]
    pub temp: bool,
    /// Query memory, core count and clocks from the vendor driver
    #[serde(default)]
    pub driver_specific: bool,
}

/// GPU information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuResult {
    pub vendor: GpuVendor,
    /// API the entry was enumerated through (e.g. "NVML")
    pub platform_api: String,
    /// GPU name (e.g., "NVIDIA GeForce RTX 4070 Super")
    pub name: String,
    pub uuid: String,
    /// Driver version or kernel driver name
    pub driver: String,
    pub index: Option<u32>,
    /// Temperature in Celsius
    pub temperature: Option<f64>,
    /// Max core clock in MHz
    pub frequency: Option<u32>,
    pub core_count: Option<u32>,
    /// Core utilization in percent
    pub core_utilization_rate: Option<f64>,
    pub dedicated: GpuMemory,
    pub shared: GpuMemory,
    pub gpu_type: GpuType,
    /// PCI device ID in the high 16 bits, vendor ID in the low 16 bits
    pub device_id: Option<u64>,
}

impl GpuResult {
    /// Entry with every optional field unset
    pub fn new(vendor: GpuVendor, platform_api: &str) -> Self {
        Self {
            vendor,
            platform_api: platform_api.to_string(),
            name: String::new(),
            uuid: String::new(),
            driver: String::new(),
            index: None,
            temperature: None,
            frequency: None,
            core_count: None,
            core_utilization_rate: None,
            dedicated: GpuMemory::default(),
            shared: GpuMemory::default(),
            gpu_type: GpuType::Unknown,
            device_id: None,
        }
    }
}

/// Enumerators, in priority order, and the vendor to sub-probe mapping
pub struct GpuBackends {
    enumerators: Vec<Box<dyn GpuEnumerator>>,
    probes: Vec<Box<dyn DriverProbe>>,
}

impl GpuBackends {
    pub fn new(enumerators: Vec<Box<dyn GpuEnumerator>>, probes: Vec<Box<dyn DriverProbe>>) -> Self {
        Self { enumerators, probes }
    }

    /// Native backends for the vendors enabled in `config`
    pub fn system(config: &VendorConfig) -> Self {
        let loader: Arc<dyn LibraryLoader> = Arc::new(SystemLoader);
        let mut enumerators: Vec<Box<dyn GpuEnumerator>> = Vec::new();
        let mut probes: Vec<Box<dyn DriverProbe>> = Vec::new();

        if let Some(library) = config.library_for(GpuVendor::Nvidia) {
            enumerators.push(Box::new(nvml::Nvml::new(Arc::clone(&loader), library)));
            probes.push(Box::new(nvml::Nvml::new(Arc::clone(&loader), library)));
        }
        if let Some(library) = config.library_for(GpuVendor::MooreThreads) {
            enumerators.push(Box::new(mtml::Mtml::new(Arc::clone(&loader), library)));
            probes.push(Box::new(mtml::Mtml::new(Arc::clone(&loader), library)));
        }

        #[cfg(target_os = "linux")]
        {
            enumerators.push(Box::new(drm::DrmCards::new(
                drm::DRM_CLASS_ROOT,
                config.enabled.clone(),
            )));
            if config.is_enabled(GpuVendor::Amd) {
                probes.push(Box::new(drm::AmdgpuProbe));
            }
            if config.is_enabled(GpuVendor::Intel) {
                probes.push(Box::new(drm::IntelProbe));
            }
        }

        Self { enumerators, probes }
    }

    /// Sub-probe registered for a vendor
    pub fn probe_for(&self, vendor: GpuVendor) -> Option<&dyn DriverProbe> {
        self.probes
            .iter()
            .find(|probe| probe.vendor() == vendor)
            .map(|probe| probe.as_ref())
    }
}

/// Detect all GPUs.
///
/// Enumeration failures and sub-probe failures degrade to fewer or sparser
/// entries; an empty list is a successful result.
pub fn detect_gpus(options: &GpuOptions, backends: &GpuBackends) -> Result<Vec<GpuResult>, DetectError> {
    let mut gpus = Vec::new();
    let mut covered: HashSet<GpuVendor> = HashSet::new();

    for enumerator in &backends.enumerators {
        let api = enumerator.platform_api();
        let devices = match enumerator.enumerate() {
            Ok(devices) => devices,
            Err(err) => {
                tracing::debug!(api, error = %err, "gpu enumeration unavailable");
                continue;
            }
        };

        let mut found = HashSet::new();
        for device in devices {
            // Already reported through a more specific API
            if covered.contains(&device.vendor) {
                continue;
            }
            found.insert(device.vendor);

            let mut gpu = GpuResult::new(device.vendor, api);
            gpu.device_id = device.device_id;
            if let Some(name) = device.name {
                gpu.name = name;
            }

            if options.temp || options.driver_specific {
                run_driver_probe(options, backends, &device.condition, &mut gpu);
            }

            gpus.push(gpu);
        }
        covered.extend(found);
    }

    tracing::info!(count = gpus.len(), "gpus detected");
    Ok(gpus)
}

fn run_driver_probe(
    options: &GpuOptions,
    backends: &GpuBackends,
    condition: &DriverCondition,
    gpu: &mut GpuResult,
) {
    let Some(probe) = backends.probe_for(gpu.vendor) else {
        tracing::debug!(vendor = %gpu.vendor, "no driver-specific probe for vendor");
        return;
    };

    let vendor = gpu.vendor;
    let result = DriverResult {
        index: &mut gpu.index,
        temp: options.temp.then_some(&mut gpu.temperature),
        memory: options.driver_specific.then_some(&mut gpu.dedicated),
        shared: options.driver_specific.then_some(&mut gpu.shared),
        core_count: options.driver_specific.then_some(&mut gpu.core_count),
        frequency: options.driver_specific.then_some(&mut gpu.frequency),
        core_utilization_rate: &mut gpu.core_utilization_rate,
        gpu_type: &mut gpu.gpu_type,
        device_id: &mut gpu.device_id,
        uuid: &mut gpu.uuid,
        name: &mut gpu.name,
        driver: &mut gpu.driver,
    };

    if let Err(err) = probe.detect(condition, result) {
        tracing::debug!(%vendor, error = %err, "driver-specific probe failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProbeError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedEnumerator {
        api: &'static str,
        devices: Result<Vec<GpuDevice>, ()>,
    }

    impl GpuEnumerator for FixedEnumerator {
        fn platform_api(&self) -> &'static str {
            self.api
        }

        fn enumerate(&self) -> Result<Vec<GpuDevice>, ProbeError> {
            self.devices
                .clone()
                .map_err(|_| ProbeError::unavailable("library missing"))
        }
    }

    fn indexed(vendor: GpuVendor, count: u32) -> Vec<GpuDevice> {
        (0..count)
            .map(|i| GpuDevice {
                vendor,
                condition: DriverCondition::Index(i),
                device_id: None,
                name: None,
            })
            .collect()
    }

    /// Always fails after counting the call
    struct FailingProbe {
        vendor: GpuVendor,
        calls: Arc<AtomicUsize>,
    }

    impl DriverProbe for FailingProbe {
        fn vendor(&self) -> GpuVendor {
            self.vendor
        }

        fn detect(&self, _: &DriverCondition, _: DriverResult<'_>) -> Result<(), ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProbeError::unavailable("nvml.dll not found"))
        }
    }

    /// Writes every slot it is offered
    struct FillingProbe;

    impl DriverProbe for FillingProbe {
        fn vendor(&self) -> GpuVendor {
            GpuVendor::Nvidia
        }

        fn detect(&self, condition: &DriverCondition, mut out: DriverResult<'_>) -> Result<(), ProbeError> {
            let DriverCondition::Index(index) = condition else {
                return Err(ProbeError::Unsupported("condition".to_string()));
            };
            *out.index = Some(*index);
            out.set_temp(61.0);
            out.set_memory(Some(8 << 30), Some(1 << 30));
            out.set_core_count(5888);
            out.set_frequency(2505);
            *out.core_utilization_rate = Some(12.0);
            *out.gpu_type = GpuType::Discrete;
            out.set_name(format!("GPU {index}"));
            Ok(())
        }
    }

    fn both() -> GpuOptions {
        GpuOptions {
            temp: true,
            driver_specific: true,
        }
    }

    #[test]
    fn zero_gpus_is_success() {
        let backends = GpuBackends::new(
            vec![Box::new(FixedEnumerator {
                api: "NVML",
                devices: Ok(Vec::new()),
            })],
            Vec::new(),
        );
        let gpus = detect_gpus(&both(), &backends).unwrap();
        assert!(gpus.is_empty());
    }

    #[test]
    fn missing_enumeration_library_is_not_an_error() {
        let backends = GpuBackends::new(
            vec![Box::new(FixedEnumerator {
                api: "NVML",
                devices: Err(()),
            })],
            Vec::new(),
        );
        assert_eq!(detect_gpus(&both(), &backends).unwrap(), Vec::new());
    }

    #[test]
    fn failing_probes_keep_every_enumerated_entry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let backends = GpuBackends::new(
            vec![Box::new(FixedEnumerator {
                api: "NVML",
                devices: Ok(indexed(GpuVendor::Nvidia, 3)),
            })],
            vec![Box::new(FailingProbe {
                vendor: GpuVendor::Nvidia,
                calls: Arc::clone(&calls),
            })],
        );

        let gpus = detect_gpus(&both(), &backends).unwrap();
        assert_eq!(gpus.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        for gpu in &gpus {
            assert_eq!(gpu, &GpuResult::new(GpuVendor::Nvidia, "NVML"));
        }
    }

    #[test]
    fn probe_is_skipped_without_options() {
        let calls = Arc::new(AtomicUsize::new(0));
        let backends = GpuBackends::new(
            vec![Box::new(FixedEnumerator {
                api: "NVML",
                devices: Ok(indexed(GpuVendor::Nvidia, 2)),
            })],
            vec![Box::new(FailingProbe {
                vendor: GpuVendor::Nvidia,
                calls: Arc::clone(&calls),
            })],
        );

        let gpus = detect_gpus(&GpuOptions::default(), &backends).unwrap();
        assert_eq!(gpus.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn temp_only_leaves_driver_specific_slots_empty() {
        let backends = GpuBackends::new(
            vec![Box::new(FixedEnumerator {
                api: "NVML",
                devices: Ok(indexed(GpuVendor::Nvidia, 1)),
            })],
            vec![Box::new(FillingProbe)],
        );
        let options = GpuOptions {
            temp: true,
            driver_specific: false,
        };

        let gpu = &detect_gpus(&options, &backends).unwrap()[0];
        assert_eq!(gpu.temperature, Some(61.0));
        assert_eq!(gpu.dedicated, GpuMemory::default());
        assert_eq!(gpu.core_count, None);
        assert_eq!(gpu.frequency, None);
        // Always-offered slots are still written
        assert_eq!(gpu.index, Some(0));
        assert_eq!(gpu.gpu_type, GpuType::Discrete);
        assert_eq!(gpu.name, "GPU 0");
    }

    #[test]
    fn driver_specific_fills_memory_and_clocks() {
        let backends = GpuBackends::new(
            vec![Box::new(FixedEnumerator {
                api: "NVML",
                devices: Ok(indexed(GpuVendor::Nvidia, 2)),
            })],
            vec![Box::new(FillingProbe)],
        );
        let options = GpuOptions {
            temp: false,
            driver_specific: true,
        };

        let gpus = detect_gpus(&options, &backends).unwrap();
        assert_eq!(gpus[1].index, Some(1));
        assert_eq!(gpus[1].temperature, None);
        assert_eq!(gpus[1].dedicated.total, Some(8 << 30));
        assert_eq!(gpus[1].core_count, Some(5888));
        assert_eq!(gpus[1].frequency, Some(2505));
    }

    #[test]
    fn vendor_without_probe_keeps_unset_fields() {
        let backends = GpuBackends::new(
            vec![Box::new(FixedEnumerator {
                api: "DRM",
                devices: Ok(indexed(GpuVendor::Unknown, 1)),
            })],
            vec![Box::new(FillingProbe)],
        );
        let gpus = detect_gpus(&both(), &backends).unwrap();
        assert_eq!(gpus, vec![GpuResult::new(GpuVendor::Unknown, "DRM")]);
    }

    #[test]
    fn later_enumerators_skip_covered_vendors() {
        let mut drm_devices = indexed(GpuVendor::Nvidia, 1);
        drm_devices.extend(indexed(GpuVendor::Intel, 1));
        let backends = GpuBackends::new(
            vec![
                Box::new(FixedEnumerator {
                    api: "NVML",
                    devices: Ok(indexed(GpuVendor::Nvidia, 1)),
                }),
                Box::new(FixedEnumerator {
                    api: "DRM",
                    devices: Ok(drm_devices),
                }),
            ],
            Vec::new(),
        );

        let gpus = detect_gpus(&GpuOptions::default(), &backends).unwrap();
        let seen: Vec<(GpuVendor, &str)> = gpus
            .iter()
            .map(|g| (g.vendor, g.platform_api.as_str()))
            .collect();
        assert_eq!(
            seen,
            vec![(GpuVendor::Nvidia, "NVML"), (GpuVendor::Intel, "DRM")]
        );
    }

    #[test]
    fn pci_vendor_ids_map_to_vendors() {
        assert_eq!(GpuVendor::from_pci_vendor(0x10de), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_pci_vendor(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_pci_vendor(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_pci_vendor(0x1ed5), GpuVendor::MooreThreads);
        assert_eq!(GpuVendor::from_pci_vendor(0x1234), GpuVendor::Unknown);
        assert_eq!(GpuVendor::MooreThreads.to_string(), "Moore Threads");
    }
}
