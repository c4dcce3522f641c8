//! Detection snapshot aggregator

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::System;

use crate::config::Config;
use crate::error::DetectError;
use crate::hardware::cpu::{detect_cpu, CpuResult, CpuSources};
use crate::hardware::gpu::{detect_gpus, GpuBackends, GpuResult};
use crate::hardware::tpm::{detect_tpm, tpm_service, TpmResult};

/// Which domains a snapshot covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Domains {
    pub cpu: bool,
    pub gpu: bool,
    pub tpm: bool,
}

impl Domains {
    pub fn all() -> Self {
        Self {
            cpu: true,
            gpu: true,
            tpm: true,
        }
    }

    pub fn none() -> Self {
        Self {
            cpu: false,
            gpu: false,
            tpm: false,
        }
    }
}

/// Results of one detection pass
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    /// Operating system
    pub os: String,
    pub os_version: Option<String>,
    pub cpu: Option<CpuResult>,
    pub cpu_error: Option<String>,
    /// `None` when GPU detection was not requested
    pub gpus: Option<Vec<GpuResult>>,
    pub gpu_error: Option<String>,
    pub tpm: Option<TpmResult>,
    pub tpm_error: Option<String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshot {
    pub fn new() -> Self {
        Self {
            taken_at: Utc::now(),
            os: System::name().unwrap_or_else(|| "Unknown".to_string()),
            os_version: System::os_version(),
            cpu: None,
            cpu_error: None,
            gpus: None,
            gpu_error: None,
            tpm: None,
            tpm_error: None,
        }
    }

    pub fn set_cpu(&mut self, result: Result<CpuResult, DetectError>) {
        match result {
            Ok(cpu) => self.cpu = Some(cpu),
            Err(err) => {
                tracing::warn!(error = %err, "cpu detection failed");
                self.cpu_error = Some(err.to_string());
            }
        }
    }

    pub fn set_gpus(&mut self, result: Result<Vec<GpuResult>, DetectError>) {
        match result {
            Ok(gpus) => self.gpus = Some(gpus),
            Err(err) => {
                tracing::warn!(error = %err, "gpu detection failed");
                self.gpu_error = Some(err.to_string());
            }
        }
    }

    pub fn set_tpm(&mut self, result: Result<TpmResult, DetectError>) {
        match result {
            Ok(tpm) => self.tpm = Some(tpm),
            // A missing TPM is common, not worth a warning
            Err(err) => {
                tracing::debug!(error = %err, "tpm detection failed");
                self.tpm_error = Some(err.to_string());
            }
        }
    }

    /// Display the snapshot as a boxed text table
    pub fn display(&self) -> String {
        const WIDTH: usize = 62;
        let mut output = String::new();

        output.push_str(&format!("╔{}╗\n", "═".repeat(WIDTH)));
        output.push_str(&format!("║{:^WIDTH$}║\n", "HARDWARE PROBE"));
        output.push_str(&format!("╠{}╣\n", "═".repeat(WIDTH)));

        let format_line = |label: &str, content: &str| -> String {
            let content_width = WIDTH.saturating_sub(1 + label.chars().count());
            let content: String = content.chars().take(content_width).collect();
            format!("║ {label}{content:<content_width$}║\n")
        };
        let divider = format!("╠{}╣\n", "═".repeat(WIDTH));
        let mut sections = Vec::new();

        // CPU Section
        if let Some(cpu) = &self.cpu {
            let mut section = format_line("CPU: ", &cpu.name);
            if !cpu.vendor.is_empty() {
                section.push_str(&format_line("      ", &format!("Vendor: {}", cpu.vendor)));
            }
            section.push_str(&format_line(
                "      ",
                &format!(
                    "{} physical / {} logical / {} online",
                    or_unknown(cpu.cores_physical),
                    or_unknown(cpu.cores_logical),
                    or_unknown(cpu.cores_online)
                ),
            ));
            if let Some(base) = cpu.frequency_base {
                section.push_str(&format_line("      ", &format!("Base Clock: {base:.2} GHz")));
            }
            if let (Some(min), Some(max)) = (cpu.frequency_min, cpu.frequency_max) {
                section.push_str(&format_line(
                    "      ",
                    &format!("Clock Range: {min:.2} - {max:.2} GHz"),
                ));
            } else if let Some(max) = cpu.frequency_max {
                section.push_str(&format_line("      ", &format!("Max Clock: {max:.2} GHz")));
            }
            for core_type in &cpu.core_types {
                section.push_str(&format_line(
                    "      ",
                    &format!("Level {}: {} cores", core_type.freq, core_type.count),
                ));
            }
            if let Some(temp) = cpu.temperature {
                section.push_str(&format_line("      ", &format!("Temperature: {temp:.1}°C")));
            }
            if let Some(util) = cpu.cores_utilization_rate {
                section.push_str(&format_line("      ", &format!("Utilization: {util:.1}%")));
            }
            sections.push(section);
        } else if let Some(err) = &self.cpu_error {
            sections.push(format_line("CPU: ", &format!("error: {err}")));
        }

        // GPU Section
        if let Some(gpus) = &self.gpus {
            let mut section = String::new();
            if gpus.is_empty() {
                section.push_str(&format_line("GPU: ", "none detected"));
            }
            for gpu in gpus {
                let name = if gpu.name.is_empty() {
                    format!("{} GPU", gpu.vendor)
                } else {
                    gpu.name.clone()
                };
                section.push_str(&format_line("GPU: ", &name));
                section.push_str(&format_line(
                    "      ",
                    &format!("{} via {} ({:?})", gpu.vendor, gpu.platform_api, gpu.gpu_type),
                ));
                if !gpu.driver.is_empty() {
                    section.push_str(&format_line("      ", &format!("Driver: {}", gpu.driver)));
                }
                if let Some(total) = gpu.dedicated.total {
                    let memory = match gpu.dedicated.used {
                        Some(used) => format!("VRAM: {} / {}", gib(used), gib(total)),
                        None => format!("VRAM: {}", gib(total)),
                    };
                    section.push_str(&format_line("      ", &memory));
                }
                if let Some(total) = gpu.shared.total {
                    section.push_str(&format_line("      ", &format!("Shared: {}", gib(total))));
                }
                if let Some(mhz) = gpu.frequency {
                    section.push_str(&format_line("      ", &format!("Max Clock: {mhz} MHz")));
                }
                if let Some(cores) = gpu.core_count {
                    section.push_str(&format_line("      ", &format!("Cores: {cores}")));
                }
                if let Some(temp) = gpu.temperature {
                    section.push_str(&format_line("      ", &format!("Temperature: {temp:.1}°C")));
                }
                if let Some(util) = gpu.core_utilization_rate {
                    section.push_str(&format_line("      ", &format!("Utilization: {util:.0}%")));
                }
            }
            sections.push(section);
        } else if let Some(err) = &self.gpu_error {
            sections.push(format_line("GPU: ", &format!("error: {err}")));
        }

        // TPM Section
        if let Some(tpm) = &self.tpm {
            let text = match tpm.interface_name() {
                "" => tpm.version.to_string(),
                interface => format!("{} ({interface})", tpm.version),
            };
            sections.push(format_line("TPM: ", &text));
        } else if let Some(err) = &self.tpm_error {
            sections.push(format_line("TPM: ", err));
        }

        // OS Section
        let os_str = match &self.os_version {
            Some(ver) => format!("{} {}", self.os, ver),
            None => self.os.clone(),
        };
        sections.push(format_line("OS:  ", &os_str));

        output.push_str(&sections.join(&divider));
        output.push_str(&format!("╚{}╝", "═".repeat(WIDTH)));

        output
    }
}

fn or_unknown(value: Option<u16>) -> String {
    value.map_or_else(|| "?".to_string(), |v| v.to_string())
}

fn gib(bytes: u64) -> String {
    format!("{:.1} GiB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

fn run_cpu(config: &Config) -> Result<CpuResult, DetectError> {
    let sources = CpuSources::system().with_sample_interval(config.cpu.sample_interval());
    detect_cpu(&config.cpu.options(), &sources)
}

fn run_gpus(config: &Config) -> Result<Vec<GpuResult>, DetectError> {
    detect_gpus(&config.gpu.options(), &GpuBackends::system(&config.vendors))
}

fn run_tpm() -> Result<TpmResult, DetectError> {
    detect_tpm(tpm_service().as_ref())
}

/// Run the requested detectors one after another on this thread
pub fn collect(config: &Config, domains: Domains) -> Snapshot {
    let mut snapshot = Snapshot::new();
    if domains.cpu {
        snapshot.set_cpu(run_cpu(config));
    }
    if domains.gpu {
        snapshot.set_gpus(run_gpus(config));
    }
    if domains.tpm {
        snapshot.set_tpm(run_tpm());
    }
    snapshot
}

/// Run the requested detectors concurrently on the blocking pool
pub async fn collect_async(config: Config, domains: Domains) -> Result<Snapshot> {
    let config = Arc::new(config);

    let cpu = domains.cpu.then(|| {
        let config = Arc::clone(&config);
        tokio::task::spawn_blocking(move || run_cpu(&config))
    });
    let gpus = domains.gpu.then(|| {
        let config = Arc::clone(&config);
        tokio::task::spawn_blocking(move || run_gpus(&config))
    });
    let tpm = domains.tpm.then(|| tokio::task::spawn_blocking(run_tpm));

    let mut snapshot = Snapshot::new();
    if let Some(task) = cpu {
        snapshot.set_cpu(task.await.context("CPU detection task failed")?);
    }
    if let Some(task) = gpus {
        snapshot.set_gpus(task.await.context("GPU detection task failed")?);
    }
    if let Some(task) = tpm {
        snapshot.set_tpm(task.await.context("TPM detection task failed")?);
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::cpu::CoreType;
    use crate::hardware::gpu::{GpuMemory, GpuType, GpuVendor};
    use crate::hardware::tpm::{TpmInterface, TpmVersion};

    fn sample_cpu() -> CpuResult {
        CpuResult {
            name: "Apple M2 Pro".to_string(),
            vendor: "Apple".to_string(),
            cores_physical: Some(12),
            cores_logical: Some(12),
            cores_online: Some(12),
            frequency_base: None,
            frequency_min: Some(0.6),
            frequency_max: Some(3.504),
            temperature: Some(41.25),
            cores_utilization_rate: Some(7.5),
            core_types: vec![CoreType { freq: 2, count: 8 }, CoreType { freq: 1, count: 4 }],
        }
    }

    fn sample_gpu() -> GpuResult {
        let mut gpu = GpuResult::new(GpuVendor::Nvidia, "NVML");
        gpu.name = "NVIDIA GeForce RTX 4070 SUPER".to_string();
        gpu.gpu_type = GpuType::Discrete;
        gpu.dedicated = GpuMemory {
            total: Some(12 << 30),
            used: Some(3 << 30),
        };
        gpu.temperature = Some(55.0);
        gpu
    }

    #[test]
    fn display_renders_every_section_with_fixed_width() {
        let mut snapshot = Snapshot::new();
        snapshot.set_cpu(Ok(sample_cpu()));
        snapshot.set_gpus(Ok(vec![sample_gpu()]));
        snapshot.set_tpm(Ok(TpmResult {
            version: TpmVersion::V2_0,
            interface_type: Some(TpmInterface::Hardware),
        }));

        let text = snapshot.display();
        assert!(text.contains("CPU: Apple M2 Pro"));
        assert!(text.contains("12 physical / 12 logical / 12 online"));
        assert!(text.contains("Clock Range: 0.60 - 3.50 GHz"));
        assert!(text.contains("Level 2: 8 cores"));
        assert!(text.contains("GPU: NVIDIA GeForce RTX 4070 SUPER"));
        assert!(text.contains("VRAM: 3.0 GiB / 12.0 GiB"));
        assert!(text.contains("TPM: 2.0 (HW TPM)"));

        let widths: Vec<usize> = text.lines().map(|line| line.chars().count()).collect();
        assert!(widths.iter().all(|w| *w == widths[0]), "{text}");
    }

    #[test]
    fn errors_are_recorded_per_domain() {
        let mut snapshot = Snapshot::new();
        snapshot.set_cpu(Err(DetectError::MissingIdentity {
            what: "CPU name",
            reason: "machdep.cpu.brand_string is empty".to_string(),
        }));
        snapshot.set_gpus(Ok(Vec::new()));
        snapshot.set_tpm(Err(DetectError::DeviceNotFound("TPM")));

        assert!(snapshot.cpu.is_none());
        assert_eq!(snapshot.gpus, Some(Vec::new()));
        assert_eq!(snapshot.tpm_error.as_deref(), Some("TPM device is not found"));

        let text = snapshot.display();
        assert!(text.contains("CPU: error: cannot determine CPU name"));
        assert!(text.contains("GPU: none detected"));
        assert!(text.contains("TPM: TPM device is not found"));
    }

    #[test]
    fn long_values_are_truncated_to_the_box() {
        let mut snapshot = Snapshot::new();
        let mut gpu = sample_gpu();
        gpu.name = "é".repeat(200);
        snapshot.set_gpus(Ok(vec![gpu]));

        let text = snapshot.display();
        let widths: Vec<usize> = text.lines().map(|line| line.chars().count()).collect();
        assert!(widths.iter().all(|w| *w == widths[0]));
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let mut snapshot = Snapshot::new();
        snapshot.set_tpm(Ok(TpmResult {
            version: TpmVersion::V1_2,
            interface_type: None,
        }));
        let json: serde_json::Value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["tpm"]["version"], "1.2");
        assert_eq!(json["tpm"]["interface_type"], "");
        assert!(json["cpu"].is_null());
        assert!(json["taken_at"].is_string());
    }

    #[test]
    fn collect_with_no_domains_is_empty() {
        let snapshot = collect(&Config::default(), Domains::none());
        assert!(snapshot.cpu.is_none() && snapshot.cpu_error.is_none());
        assert!(snapshot.gpus.is_none() && snapshot.tpm.is_none());
    }

    #[tokio::test]
    async fn collect_async_with_no_domains_is_empty() {
        let snapshot = collect_async(Config::default(), Domains::none()).await.unwrap();
        assert!(snapshot.cpu.is_none());
        assert!(snapshot.gpu_error.is_none());
    }
}
