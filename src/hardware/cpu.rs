//! CPU detection module
//!
//! Detects CPU information using sysctl-style properties:
//! - macOS: sysctl(3) directly, IOKit DVFS tables on Apple Silicon
//! - Linux/Windows: sysinfo plus sysfs / registry under the same key names
//!
//! Only the brand string is mandatory. Every other field is best-effort and
//! stays `None` when its source is missing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::thermal::{ComponentThermals, ThermalFamily, ThermalSensors};
use super::utilization::{processor_load, sample_utilization, ProcessorLoad};
use crate::error::DetectError;
use crate::platform::ioreg::{device_registry, u32_at, DeviceRegistry};
use crate::platform::properties::{system_properties, SystemProperties, CTL_HW, HW_CPU_FREQ};

/// Maximum number of performance levels reported
pub const MAX_CORE_TYPES: usize = 16;

/// Default interval between the two utilization snapshots
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Optional CPU probes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuOptions {
    /// Read the CPU temperature
    #[serde(default)]
    pub temp: bool,
    /// Break down logical cores by performance level
    #[serde(default)]
    pub show_pe_core_count: bool,
}

/// One performance level of a heterogeneous CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreType {
    /// Ordering rank: higher means faster cores, not a clock speed
    pub freq: u32,
    /// Logical cores at this level
    pub count: u32,
}

/// CPU information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuResult {
    /// CPU name (e.g., "Apple M2 Pro")
    pub name: String,
    /// CPU vendor (may be synthesized from the name)
    pub vendor: String,
    pub cores_physical: Option<u16>,
    pub cores_logical: Option<u16>,
    pub cores_online: Option<u16>,
    /// Base frequency in GHz
    pub frequency_base: Option<f64>,
    /// Minimum frequency in GHz
    pub frequency_min: Option<f64>,
    /// Maximum frequency in GHz
    pub frequency_max: Option<f64>,
    /// Temperature in Celsius
    pub temperature: Option<f64>,
    /// Combined utilization of all processors in percent
    pub cores_utilization_rate: Option<f64>,
    /// Performance levels, fastest first
    pub core_types: Vec<CoreType>,
}

/// Data sources consulted by [`detect_cpu`]
pub struct CpuSources {
    pub properties: Box<dyn SystemProperties>,
    pub registry: Option<Box<dyn DeviceRegistry>>,
    pub load: Box<dyn ProcessorLoad>,
    pub thermals: Box<dyn ThermalSensors>,
    /// Blocking sleep between the two utilization snapshots
    pub sample_interval: Duration,
}

impl CpuSources {
    /// Native sources for the running platform
    pub fn system() -> Self {
        Self {
            properties: system_properties(),
            registry: device_registry(),
            load: processor_load(),
            thermals: Box::new(ComponentThermals),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }
}

/// Vendor names implied by a brand string prefix
const VENDOR_PREFIXES: &[(&str, &str)] = &[
    ("Apple ", "Apple"),
    ("Intel", "Intel"),
    ("AMD ", "AMD"),
    ("Qualcomm", "Qualcomm"),
];

/// Detect CPU information.
///
/// Fails only when the brand string is unavailable. Blocks for
/// `sources.sample_interval` while sampling utilization.
pub fn detect_cpu(options: &CpuOptions, sources: &CpuSources) -> Result<CpuResult, DetectError> {
    let props = sources.properties.as_ref();

    let name = props
        .string("machdep.cpu.brand_string")
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| DetectError::MissingIdentity {
            what: "CPU name",
            reason: "sysctlbyname(machdep.cpu.brand_string) failed".to_string(),
        })?;

    let mut cpu = CpuResult {
        vendor: props
            .string("machdep.cpu.vendor")
            .filter(|v| !v.is_empty())
            .or_else(|| vendor_from_name(&name).map(str::to_string))
            .unwrap_or_default(),
        name,
        ..CpuResult::default()
    };

    cpu.cores_physical = core_count(props, "hw.physicalcpu_max", "hw.physicalcpu");
    cpu.cores_logical = core_count(props, "hw.logicalcpu_max", "hw.ncpu");
    cpu.cores_online = core_count(props, "hw.logicalcpu", "hw.activecpu");
    if let (Some(online), Some(logical)) = (cpu.cores_online, cpu.cores_logical) {
        if online > logical {
            tracing::debug!(online, logical, "online cores exceed logical cores, clamping");
            cpu.cores_online = Some(logical);
        }
    }

    detect_frequency(props, sources.registry.as_deref(), &mut cpu);

    if options.show_pe_core_count {
        cpu.core_types = detect_core_types(props);
    }

    if options.temp {
        cpu.temperature = detect_temperature(sources.thermals.as_ref(), &cpu.name);
    }

    cpu.cores_utilization_rate = sample_utilization(sources.load.as_ref(), sources.sample_interval);

    tracing::info!(
        name = %cpu.name,
        logical = ?cpu.cores_logical,
        utilization = ?cpu.cores_utilization_rate,
        "cpu detected"
    );

    Ok(cpu)
}

/// Vendor implied by a known brand-string prefix
pub fn vendor_from_name(name: &str) -> Option<&'static str> {
    VENDOR_PREFIXES
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map(|(_, vendor)| *vendor)
}

/// Resolve a core count, consulting `fallback` when `primary` is missing or
/// reports exactly one (what sysctl returns for unsupported keys).
fn core_count(props: &dyn SystemProperties, primary: &str, fallback: &str) -> Option<u16> {
    let valid = |key: &str| {
        props
            .int(key)
            .and_then(|n| u16::try_from(n).ok())
            .filter(|&n| n > 0)
    };

    let first = valid(primary);
    if first.is_some_and(|n| n != 1) {
        return first;
    }
    valid(fallback).or(first)
}

fn hz_to_ghz(hz: i64) -> Option<f64> {
    (hz > 0).then(|| hz as f64 / 1_000_000_000.0)
}

/// Fill frequency fields from the DVFS table, then sysctl, then the MIB
fn detect_frequency(
    props: &dyn SystemProperties,
    registry: Option<&dyn DeviceRegistry>,
    cpu: &mut CpuResult,
) {
    if let Some(registry) = registry {
        match voltage_table_frequency(registry) {
            Some((min, max)) => {
                cpu.frequency_min = Some(min);
                cpu.frequency_max = max;
            }
            None => tracing::debug!("pmgr voltage tables unavailable"),
        }
    }

    cpu.frequency_base = props.int("hw.cpufrequency").and_then(hz_to_ghz);
    if cpu.frequency_min.is_none() {
        cpu.frequency_min = props.int("hw.cpufrequency_min").and_then(hz_to_ghz);
    }
    if cpu.frequency_max.is_none() {
        cpu.frequency_max = props.int("hw.cpufrequency_max").and_then(hz_to_ghz);
    }
    if cpu.frequency_base.is_none() {
        cpu.frequency_base = props.int_mib(&[CTL_HW, HW_CPU_FREQ]).and_then(hz_to_ghz);
    }
}

/// Min and max clock in GHz from the Apple Silicon `pmgr` DVFS tables.
///
/// Min is the lower of the first performance and efficiency entries, max
/// the last performance entry.
fn voltage_table_frequency(registry: &dyn DeviceRegistry) -> Option<(f64, Option<f64>)> {
    let p_cores = registry.property_data("pmgr", "voltage-states5-sram")?;
    let e_cores = registry.property_data("pmgr", "voltage-states1-sram")?;

    let p_min = u32_at(&p_cores, 0)?;
    let e_min = u32_at(&e_cores, 0)?;
    let min = hz_to_ghz(p_min.min(e_min) as i64)?;

    let max = if p_cores.len() >= 8 {
        u32_at(&p_cores, p_cores.len() - 8).and_then(|hz| hz_to_ghz(hz as i64))
    } else {
        None
    };

    Some((min, max))
}

/// Logical core counts per performance level, fastest level first
fn detect_core_types(props: &dyn SystemProperties) -> Vec<CoreType> {
    let levels = match props.int("hw.nperflevels") {
        Some(n) if n > 0 => n as usize,
        _ => {
            tracing::debug!("sysctl(hw.nperflevels) failed");
            return Vec::new();
        }
    };

    // A level whose core count can't be read is dropped rather than reported as 0
    let levels = levels.min(MAX_CORE_TYPES);
    (0..levels)
        .filter_map(|level| {
            let key = format!("hw.perflevel{level}.logicalcpu");
            let Some(count) = props.int(&key).and_then(|n| u32::try_from(n).ok()) else {
                tracing::debug!("sysctl({key}) failed");
                return None;
            };
            Some(CoreType {
                freq: (levels - level) as u32,
                count,
            })
        })
        .collect()
}

fn detect_temperature(thermals: &dyn ThermalSensors, name: &str) -> Option<f64> {
    let Some(family) = ThermalFamily::from_cpu_name(name) else {
        tracing::debug!(cpu = name, "unsupported Apple Silicon CPU for temperature");
        return None;
    };

    match thermals.cpu_temperature(family) {
        Ok(celsius) => Some(celsius),
        Err(err) => {
            tracing::debug!(error = %err, ?family, "cpu temperature unavailable");
            None
        }
    }
}
