//! Configuration management for hwprobe
//!
//! Config file location:
//! - Linux: ~/.config/hwprobe/config.toml
//! - macOS: ~/Library/Application Support/hwprobe/config.toml
//! - Windows: %APPDATA%/hwprobe/config.toml
//!
//! You can override the config location by setting `HWPROBE_CONFIG_PATH`.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hardware::cpu::CpuOptions;
use crate::hardware::gpu::{GpuOptions, GpuVendor};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// CPU probe defaults
    #[serde(default)]
    pub cpu: CpuConfig,

    /// GPU probe defaults
    #[serde(default)]
    pub gpu: GpuConfig,

    /// Which GPU vendor backends run, and the libraries they load
    #[serde(default)]
    pub vendors: VendorConfig,
}

impl Config {
    /// Load configuration from file or create default
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from an explicit path; a missing file yields defaults
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config from {}", config_path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", config_path.display()))?;

        Ok(config.validated())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(config_path, toml)
            .with_context(|| format!("Failed to write config to {}", config_path.display()))?;

        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("HWPROBE_CONFIG_PATH") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Ok(PathBuf::from(trimmed));
            }
        }

        let proj_dirs = ProjectDirs::from("org", "hwprobe", "hwprobe")
            .context("Could not determine project directories")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Create default config file if it doesn't exist
    pub fn init() -> Result<Self> {
        let config = Self::load()?;

        // Save default config if file doesn't exist
        let config_path = Self::config_path()?;
        if !config_path.exists() {
            config.save()?;
        }

        Ok(config)
    }

    /// Replace values that would make detection misbehave
    fn validated(mut self) -> Self {
        if self.cpu.sample_interval_ms == 0 {
            tracing::warn!(
                default = default_sample_interval_ms(),
                "cpu.sample_interval_ms must be positive, using default"
            );
            self.cpu.sample_interval_ms = default_sample_interval_ms();
        }
        if self.vendors.enabled.contains(&GpuVendor::Unknown) {
            tracing::warn!("\"unknown\" is not a vendor backend, ignoring it");
            self.vendors.enabled.retain(|v| *v != GpuVendor::Unknown);
        }
        self
    }
}

fn default_sample_interval_ms() -> u64 {
    1000
}

/// CPU configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuConfig {
    /// Read the CPU temperature
    #[serde(default)]
    pub temp: bool,

    /// Report performance/efficiency core tiers
    #[serde(default)]
    pub show_pe_core_count: bool,

    /// Utilization sampling interval in milliseconds.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            temp: false,
            show_pe_core_count: false,
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

impl CpuConfig {
    pub fn options(&self) -> CpuOptions {
        CpuOptions {
            temp: self.temp,
            show_pe_core_count: self.show_pe_core_count,
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// GPU configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuConfig {
    #[serde(default)]
    pub temp: bool,

    /// Query memory, cores and clocks from the vendor driver
    #[serde(default)]
    pub driver_specific: bool,
}

impl GpuConfig {
    pub fn options(&self) -> GpuOptions {
        GpuOptions {
            temp: self.temp,
            driver_specific: self.driver_specific,
        }
    }
}

fn default_enabled_vendors() -> Vec<GpuVendor> {
    vec![
        GpuVendor::Nvidia,
        GpuVendor::Amd,
        GpuVendor::Intel,
        GpuVendor::MooreThreads,
    ]
}

fn default_nvidia_library() -> String {
    if cfg!(target_os = "windows") {
        "nvml.dll".to_string()
    } else if cfg!(target_os = "linux") {
        "libnvidia-ml.so.1".to_string()
    } else {
        String::new()
    }
}

fn default_moore_threads_library() -> String {
    if cfg!(target_os = "linux") {
        "libmtml.so".to_string()
    } else {
        String::new()
    }
}

/// GPU vendor backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorConfig {
    /// Vendors whose backends run
    #[serde(default = "default_enabled_vendors")]
    pub enabled: Vec<GpuVendor>,

    /// NVML library file name; empty disables NVML
    #[serde(default = "default_nvidia_library")]
    pub nvidia_library: String,

    /// MTML library file name; empty disables MTML
    #[serde(default = "default_moore_threads_library")]
    pub moore_threads_library: String,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_vendors(),
            nvidia_library: default_nvidia_library(),
            moore_threads_library: default_moore_threads_library(),
        }
    }
}

impl VendorConfig {
    pub fn is_enabled(&self, vendor: GpuVendor) -> bool {
        self.enabled.contains(&vendor)
    }

    /// Library to load for a vendor, if that vendor is enabled and library-backed
    pub fn library_for(&self, vendor: GpuVendor) -> Option<&str> {
        if !self.is_enabled(vendor) {
            return None;
        }
        let library = match vendor {
            GpuVendor::Nvidia => &self.nvidia_library,
            GpuVendor::MooreThreads => &self.moore_threads_library,
            _ => return None,
        };
        let library = library.trim();
        (!library.is_empty()).then_some(library)
    }
}

/// Get configuration file path for display purposes
pub fn get_config_path() -> Result<String> {
    let path = Config::config_path()?;
    Ok(path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.cpu.temp);
        assert!(!config.cpu.show_pe_core_count);
        assert_eq!(config.cpu.sample_interval(), Duration::from_secs(1));
        assert_eq!(config.gpu.options(), GpuOptions::default());
        assert_eq!(config.vendors.enabled.len(), 4);
        assert!(config.vendors.is_enabled(GpuVendor::MooreThreads));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml = toml::to_string(&config).unwrap();

        assert!(toml.contains("[cpu]"));
        assert!(toml.contains("sample_interval_ms = 1000"));
        assert!(toml.contains("[vendors]"));
        assert!(toml.contains("moore_threads"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn save_and_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.cpu.temp = true;
        config.gpu.driver_specific = true;
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);

        fs::write(&path, "[gpu]\ntemp = true\n").unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert!(loaded.gpu.temp);
        assert_eq!(loaded.cpu, CpuConfig::default());
        assert_eq!(loaded.vendors, VendorConfig::default());
    }

    #[test]
    fn invalid_values_are_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[cpu]\nsample_interval_ms = 0\n[vendors]\nenabled = [\"amd\", \"unknown\"]\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.cpu.sample_interval_ms, 1000);
        assert_eq!(config.vendors.enabled, vec![GpuVendor::Amd]);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[cpu\n").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn vendor_libraries_follow_enabled_set() {
        let vendors = VendorConfig {
            enabled: vec![GpuVendor::Nvidia, GpuVendor::Amd],
            nvidia_library: "nvml.dll".to_string(),
            moore_threads_library: "libmtml.so".to_string(),
        };
        assert_eq!(vendors.library_for(GpuVendor::Nvidia), Some("nvml.dll"));
        assert_eq!(vendors.library_for(GpuVendor::MooreThreads), None);
        // DRM-backed vendors load no library
        assert_eq!(vendors.library_for(GpuVendor::Amd), None);

        let blank = VendorConfig {
            nvidia_library: "  ".to_string(),
            ..vendors
        };
        assert_eq!(blank.library_for(GpuVendor::Nvidia), None);
    }
}
