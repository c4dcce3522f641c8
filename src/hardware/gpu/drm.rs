//! Linux DRM backend
//!
//! Enumerates `/sys/class/drm/cardN` devices and reads the attributes that
//! the amdgpu and i915/xe kernel drivers publish next to the PCI device.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::driver::{DriverCondition, DriverProbe, DriverResult, GpuDevice, GpuEnumerator};
use super::{GpuType, GpuVendor};
use crate::error::ProbeError;

pub const DRM_CLASS_ROOT: &str = "/sys/class/drm";
pub const PLATFORM_API: &str = "DRM";

/// Largest BIOS carve-out still taken to mean an APU
const APU_CARVE_OUT: u64 = 512 * 1024 * 1024;

/// Resolves a PCI slot such as `0000:03:00.0` to an adapter name
pub type PciNameLookup = fn(&str) -> Option<String>;

/// Enumerator over DRM card nodes
pub struct DrmCards {
    root: PathBuf,
    vendors: Vec<GpuVendor>,
    pci_name: PciNameLookup,
}

impl DrmCards {
    /// `vendors` limits which known vendors are reported; unknown vendors always are
    pub fn new(root: impl Into<PathBuf>, vendors: Vec<GpuVendor>) -> Self {
        Self {
            root: root.into(),
            vendors,
            pci_name: lspci_name,
        }
    }

    /// Replace the `lspci` name lookup
    pub fn with_pci_names(mut self, lookup: PciNameLookup) -> Self {
        self.pci_name = lookup;
        self
    }

    /// lspci name, then the amdgpu `product_name`, then the PCI id
    fn adapter_name(&self, device: &Path, vendor: GpuVendor) -> String {
        uevent_value(device, "PCI_SLOT_NAME")
            .and_then(|slot| (self.pci_name)(&slot))
            .or_else(|| read_trimmed(&device.join("product_name")))
            .or_else(|| uevent_value(device, "PCI_ID"))
            .unwrap_or_else(|| format!("{vendor} GPU"))
    }

    fn wanted(&self, vendor: GpuVendor) -> bool {
        vendor == GpuVendor::Unknown || self.vendors.contains(&vendor)
    }
}

impl GpuEnumerator for DrmCards {
    fn platform_api(&self) -> &'static str {
        PLATFORM_API
    }

    fn enumerate(&self) -> Result<Vec<GpuDevice>, ProbeError> {
        let entries = fs::read_dir(&self.root).map_err(|e| ProbeError::io(&self.root, e))?;

        // Only cardN; connectors look like card0-DP-1
        let mut cards: Vec<(u32, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let number = card_number(&entry.file_name().to_string_lossy())?;
                Some((number, entry.path()))
            })
            .collect();
        cards.sort();

        let mut devices = Vec::new();
        for (_, card) in cards {
            let device = card.join("device");
            let Some(vendor_id) = read_hex(&device.join("vendor")) else {
                continue;
            };
            let vendor = GpuVendor::from_pci_vendor(vendor_id);
            if !self.wanted(vendor) {
                tracing::debug!(card = %card.display(), %vendor, "vendor disabled");
                continue;
            }

            let device_id = read_hex(&device.join("device"))
                .map(|id| (u64::from(id) << 16) | u64::from(vendor_id));
            let name = self.adapter_name(&device, vendor);

            devices.push(GpuDevice {
                vendor,
                condition: DriverCondition::DrmCard(card),
                device_id,
                name: Some(name),
            });
        }
        Ok(devices)
    }
}

/// amdgpu attributes
#[derive(Debug, Default, Clone, Copy)]
pub struct AmdgpuProbe;

impl DriverProbe for AmdgpuProbe {
    fn vendor(&self) -> GpuVendor {
        GpuVendor::Amd
    }

    fn detect(&self, condition: &DriverCondition, mut out: DriverResult<'_>) -> Result<(), ProbeError> {
        let device = device_dir(condition)?;

        if let Some(driver) = kernel_driver(&device) {
            *out.driver = driver;
        }
        if let Some(unique_id) = read_trimmed(&device.join("unique_id")) {
            *out.uuid = unique_id;
        }
        if let Some(busy) = read_u64(&device.join("gpu_busy_percent")) {
            *out.core_utilization_rate = Some(busy as f64);
        }

        let vram_total = read_u64(&device.join("mem_info_vram_total"));
        *out.gpu_type = amd_gpu_type(&device, vram_total);

        if out.wants_temp() {
            if let Some(celsius) = hwmon_temperature(&device) {
                out.set_temp(celsius);
            }
        }
        if out.wants_memory() {
            out.set_memory(vram_total, read_u64(&device.join("mem_info_vram_used")));
        }
        if out.wants_shared() {
            out.set_shared(
                read_u64(&device.join("mem_info_gtt_total")),
                read_u64(&device.join("mem_info_gtt_used")),
            );
        }
        if out.wants_frequency() {
            if let Some(mhz) = fs::read_to_string(device.join("pp_dpm_sclk"))
                .ok()
                .and_then(|table| max_dpm_clock(&table))
            {
                out.set_frequency(mhz);
            }
        }
        Ok(())
    }
}

/// i915 and xe attributes
#[derive(Debug, Default, Clone, Copy)]
pub struct IntelProbe;

impl DriverProbe for IntelProbe {
    fn vendor(&self) -> GpuVendor {
        GpuVendor::Intel
    }

    fn detect(&self, condition: &DriverCondition, mut out: DriverResult<'_>) -> Result<(), ProbeError> {
        let device = device_dir(condition)?;

        if let Some(driver) = kernel_driver(&device) {
            *out.driver = driver;
        }
        // The integrated GPU always sits on the root bus
        if let Some(bus) = pci_bus(&device) {
            *out.gpu_type = if bus == 0 {
                GpuType::Integrated
            } else {
                GpuType::Discrete
            };
        }

        if out.wants_temp() {
            if let Some(celsius) = hwmon_temperature(&device) {
                out.set_temp(celsius);
            }
        }
        if out.wants_frequency() {
            let DriverCondition::DrmCard(card) = condition else {
                return Ok(());
            };
            let mhz = read_u64(&card.join("gt_max_freq_mhz"))
                .or_else(|| read_u64(&device.join("tile0/gt0/freq0/max_freq")))
                .and_then(|mhz| u32::try_from(mhz).ok());
            if let Some(mhz) = mhz {
                out.set_frequency(mhz);
            }
        }
        Ok(())
    }
}

/// Board fan control means a discrete card; a small carve-out means an APU.
/// APU carve-outs of several GiB are indistinguishable from small cards.
fn amd_gpu_type(device: &Path, vram_total: Option<u64>) -> GpuType {
    if hwmon_has_fan(device) {
        GpuType::Discrete
    } else if vram_total.is_some_and(|total| total <= APU_CARVE_OUT) {
        GpuType::Integrated
    } else {
        GpuType::Unknown
    }
}

fn hwmon_has_fan(device: &Path) -> bool {
    let Ok(monitors) = fs::read_dir(device.join("hwmon")) else {
        return false;
    };
    monitors.flatten().any(|monitor| {
        let path = monitor.path();
        path.join("fan1_input").exists() || path.join("pwm1").exists()
    })
}

/// Adapter name from `lspci -s <slot>`
fn lspci_name(slot: &str) -> Option<String> {
    let output = Command::new("lspci").args(["-s", slot]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.lines().find_map(parse_lspci_line)
}

/// Format: "03:00.0 VGA compatible controller: Advanced Micro Devices, Inc. [AMD/ATI] Navi 21 (rev c1)"
fn parse_lspci_line(line: &str) -> Option<String> {
    let (_, name) = line.split_once(": ")?;
    let name = match name.rfind(" (rev") {
        Some(rev) => &name[..rev],
        None => name,
    };
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn device_dir(condition: &DriverCondition) -> Result<PathBuf, ProbeError> {
    let DriverCondition::DrmCard(card) = condition else {
        return Err(ProbeError::Unsupported(format!("drm cannot locate {condition:?}")));
    };
    let device = card.join("device");
    if !device.is_dir() {
        return Err(ProbeError::unavailable(format!("{} has no device", card.display())));
    }
    Ok(device)
}

fn card_number(name: &str) -> Option<u32> {
    name.strip_prefix("card")?.parse().ok()
}

fn read_trimmed(path: &Path) -> Option<String> {
    let value = fs::read_to_string(path).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn read_u64(path: &Path) -> Option<u64> {
    read_trimmed(path)?.parse().ok()
}

fn read_hex(path: &Path) -> Option<u32> {
    let value = read_trimmed(path)?;
    let digits = value.strip_prefix("0x").unwrap_or(&value);
    u32::from_str_radix(digits, 16).ok()
}

fn uevent_value(device: &Path, key: &str) -> Option<String> {
    let uevent = fs::read_to_string(device.join("uevent")).ok()?;
    uevent.lines().find_map(|line| {
        let (name, value) = line.split_once('=')?;
        (name == key).then(|| value.trim().to_string())
    })
}

fn kernel_driver(device: &Path) -> Option<String> {
    fs::read_link(device.join("driver"))
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()))
        .or_else(|| uevent_value(device, "DRIVER"))
}

/// Bus number from the `PCI_SLOT_NAME` (domain:bus:device.function)
fn pci_bus(device: &Path) -> Option<u32> {
    let slot = uevent_value(device, "PCI_SLOT_NAME")?;
    let bus = slot.split(':').nth(1)?;
    u32::from_str_radix(bus, 16).ok()
}

/// First hwmon `temp1_input`, millidegrees to Celsius
fn hwmon_temperature(device: &Path) -> Option<f64> {
    let mut monitors: Vec<PathBuf> = fs::read_dir(device.join("hwmon"))
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    monitors.sort();
    monitors.iter().find_map(|monitor| {
        let millidegrees: i64 = read_trimmed(&monitor.join("temp1_input"))?.parse().ok()?;
        Some(millidegrees as f64 / 1000.0)
    })
}

/// Highest clock in a DPM table such as `1: 2100Mhz *`
fn max_dpm_clock(table: &str) -> Option<u32> {
    table
        .lines()
        .filter_map(|line| {
            let (_, level) = line.split_once(':')?;
            let level = level.trim().to_ascii_lowercase();
            level.split("mhz").next()?.trim().parse::<u32>().ok()
        })
        .max()
}
