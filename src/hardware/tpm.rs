//! TPM detection
//!
//! Windows asks the TPM Base Services (`tbs.dll`) for its device info.
//! Linux reads the same facts from `/sys/class/tpm`. Both produce the raw
//! [`TpmDeviceInfo`] codes, which [`detect_tpm`] maps to names.

use std::ffi::c_void;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Serialize, Serializer};

use crate::error::DetectError;
use crate::platform::library::{LibraryLoader, SystemLoader};

pub const TBS_LIBRARY: &str = "tbs.dll";
pub const TPM_CLASS_ROOT: &str = "/sys/class/tpm";

const TBS_SUCCESS: u32 = 0;
const TBS_E_INVALID_CONTEXT: u32 = 0x8028_4004;

const TPM_VERSION_12: u32 = 1;
const TPM_VERSION_20: u32 = 2;

const TPM_IFTYPE_UNKNOWN: u32 = 0;
const TPM_IFTYPE_1: u32 = 1;
const TPM_IFTYPE_TRUSTZONE: u32 = 2;
const TPM_IFTYPE_HW: u32 = 3;
const TPM_IFTYPE_EMULATOR: u32 = 4;
const TPM_IFTYPE_SPB: u32 = 5;

/// `TPM_DEVICE_INFO` as returned by `Tbsi_GetDeviceInfo`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TpmDeviceInfo {
    pub struct_version: u32,
    pub tpm_version: u32,
    pub interface_type: u32,
    pub imp_revision: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TpmVersion {
    #[serde(rename = "1.2")]
    V1_2,
    #[serde(rename = "2.0")]
    V2_0,
    #[serde(rename = "unknown")]
    Unknown,
}

impl TpmVersion {
    pub fn from_code(code: u32) -> Self {
        match code {
            TPM_VERSION_12 => TpmVersion::V1_2,
            TPM_VERSION_20 => TpmVersion::V2_0,
            _ => TpmVersion::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TpmVersion::V1_2 => "1.2",
            TpmVersion::V2_0 => "2.0",
            TpmVersion::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TpmVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the TPM is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmInterface {
    /// TPM 1.2 over I/O ports or MMIO
    IoPortOrMmio,
    Trustzone,
    Hardware,
    Emulator,
    SpbAttached,
}

impl TpmInterface {
    /// Interface from a `TPM_IFTYPE_*` code; undefined codes have no interface
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            TPM_IFTYPE_1 => Some(TpmInterface::IoPortOrMmio),
            TPM_IFTYPE_TRUSTZONE => Some(TpmInterface::Trustzone),
            TPM_IFTYPE_HW => Some(TpmInterface::Hardware),
            TPM_IFTYPE_EMULATOR => Some(TpmInterface::Emulator),
            TPM_IFTYPE_SPB => Some(TpmInterface::SpbAttached),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TpmInterface::IoPortOrMmio => "I/O-port or MMIO",
            TpmInterface::Trustzone => "Trustzone",
            TpmInterface::Hardware => "HW TPM",
            TpmInterface::Emulator => "SW-emulator",
            TpmInterface::SpbAttached => "SPB attached",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TpmResult {
    pub version: TpmVersion,
    #[serde(serialize_with = "serialize_interface")]
    pub interface_type: Option<TpmInterface>,
}

impl TpmResult {
    /// Interface name, empty when undetermined
    pub fn interface_name(&self) -> &'static str {
        self.interface_type.map_or("", |interface| interface.as_str())
    }
}

fn serialize_interface<S: Serializer>(interface: &Option<TpmInterface>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(interface.map_or("", |i| i.as_str()))
}

/// Source of raw TPM device info
pub trait TpmService: Send + Sync {
    fn device_info(&self) -> Result<TpmDeviceInfo, DetectError>;
}

/// Detect the TPM version and attachment
pub fn detect_tpm(service: &dyn TpmService) -> Result<TpmResult, DetectError> {
    let info = service.device_info()?;
    let result = TpmResult {
        version: TpmVersion::from_code(info.tpm_version),
        interface_type: TpmInterface::from_code(info.interface_type),
    };
    tracing::info!(
        version = %result.version,
        interface = result.interface_name(),
        "tpm detected"
    );
    Ok(result)
}

type FnGetDeviceInfo = unsafe extern "system" fn(u32, *mut c_void) -> u32;

/// TPM Base Services
pub struct TbsService {
    loader: Arc<dyn LibraryLoader>,
    library: String,
}

impl TbsService {
    pub fn new(loader: Arc<dyn LibraryLoader>, library: &str) -> Self {
        Self {
            loader,
            library: library.to_string(),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemLoader), TBS_LIBRARY)
    }
}

impl TpmService for TbsService {
    fn device_info(&self) -> Result<TpmDeviceInfo, DetectError> {
        let library = self.loader.open(&self.library)?;
        // SAFETY: prototype of Tbsi_GetDeviceInfo from tbs.h.
        let get_device_info: FnGetDeviceInfo = unsafe { library.symbol("Tbsi_GetDeviceInfo")? };

        let mut info = TpmDeviceInfo::default();
        let size = std::mem::size_of::<TpmDeviceInfo>() as u32;
        // SAFETY: info is writable for `size` bytes.
        let code = unsafe { get_device_info(size, (&mut info as *mut TpmDeviceInfo).cast()) };
        match code {
            TBS_SUCCESS => Ok(info),
            TBS_E_INVALID_CONTEXT => Err(DetectError::DeviceNotFound("TPM")),
            code => Err(DetectError::DeviceQuery {
                call: "Tbsi_GetDeviceInfo",
                code,
            }),
        }
    }
}

/// Linux TPM class devices
pub struct SysfsTpm {
    root: PathBuf,
}

impl Default for SysfsTpm {
    fn default() -> Self {
        Self::new(TPM_CLASS_ROOT)
    }
}

impl SysfsTpm {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TpmService for SysfsTpm {
    fn device_info(&self) -> Result<TpmDeviceInfo, DetectError> {
        let tpm = self.root.join("tpm0");
        if !tpm.exists() {
            return Err(DetectError::DeviceNotFound("TPM"));
        }

        let tpm_version = match fs::read_to_string(tpm.join("tpm_version_major"))
            .ok()
            .as_deref()
            .map(str::trim)
        {
            Some("2") => TPM_VERSION_20,
            Some("1") => TPM_VERSION_12,
            _ => 0,
        };

        let driver = fs::read_link(tpm.join("device/driver"))
            .ok()
            .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()));
        tracing::debug!(?driver, tpm_version, "tpm class device");

        Ok(TpmDeviceInfo {
            struct_version: 1,
            tpm_version,
            interface_type: driver.map_or(TPM_IFTYPE_UNKNOWN, |d| interface_for_driver(&d, tpm_version)),
            imp_revision: 0,
        })
    }
}

/// Kernel driver name to `TPM_IFTYPE_*`
fn interface_for_driver(driver: &str, tpm_version: u32) -> u32 {
    match driver {
        "tpm_crb" => TPM_IFTYPE_HW,
        "tpm_tis" | "tpm_tis_core" | "tpm_infineon" | "tpm_atmel" | "tpm_nsc" => {
            if tpm_version == TPM_VERSION_12 {
                TPM_IFTYPE_1
            } else {
                TPM_IFTYPE_HW
            }
        }
        "tpm_tis_spi" | "tpm_tis_synquacer" => TPM_IFTYPE_SPB,
        "tpm_ftpm_tee" => TPM_IFTYPE_TRUSTZONE,
        "tpm_vtpm_proxy" | "tpm_ibmvtpm" => TPM_IFTYPE_EMULATOR,
        d if d.starts_with("tpm_tis_i2c") || d.starts_with("tpm_i2c_") => TPM_IFTYPE_SPB,
        _ => TPM_IFTYPE_UNKNOWN,
    }
}

struct UnsupportedTpm;

impl TpmService for UnsupportedTpm {
    fn device_info(&self) -> Result<TpmDeviceInfo, DetectError> {
        Err(DetectError::Unsupported("TPM"))
    }
}

/// TPM service for the current platform
pub fn tpm_service() -> Box<dyn TpmService> {
    if cfg!(target_os = "windows") {
        Box::new(TbsService::system())
    } else if cfg!(target_os = "linux") {
        Box::new(SysfsTpm::default())
    } else {
        Box::new(UnsupportedTpm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::library::fake::FakeLoader;

    struct Fixed(TpmDeviceInfo);

    impl TpmService for Fixed {
        fn device_info(&self) -> Result<TpmDeviceInfo, DetectError> {
            Ok(self.0)
        }
    }

    fn info(tpm_version: u32, interface_type: u32) -> Fixed {
        Fixed(TpmDeviceInfo {
            struct_version: 1,
            tpm_version,
            interface_type,
            imp_revision: 0,
        })
    }

    #[test]
    fn interface_codes_map_to_names() {
        let hw = detect_tpm(&info(2, 3)).unwrap();
        assert_eq!(hw.version, TpmVersion::V2_0);
        assert_eq!(hw.interface_name(), "HW TPM");

        let trustzone = detect_tpm(&info(2, 2)).unwrap();
        assert_eq!(trustzone.interface_name(), "Trustzone");

        let undefined = detect_tpm(&info(7, 42)).unwrap();
        assert_eq!(undefined.version, TpmVersion::Unknown);
        assert_eq!(undefined.interface_type, None);
        assert_eq!(undefined.interface_name(), "");
    }

    #[test]
    fn result_serializes_names() {
        let json = serde_json::to_string(&detect_tpm(&info(1, 1)).unwrap()).unwrap();
        assert_eq!(json, r#"{"version":"1.2","interface_type":"I/O-port or MMIO"}"#);

        let json = serde_json::to_string(&detect_tpm(&info(2, 0)).unwrap()).unwrap();
        assert_eq!(json, r#"{"version":"2.0","interface_type":""}"#);
    }

    unsafe extern "system" fn device_info_hw(size: u32, out: *mut c_void) -> u32 {
        assert_eq!(size as usize, std::mem::size_of::<TpmDeviceInfo>());
        *out.cast::<TpmDeviceInfo>() = TpmDeviceInfo {
            struct_version: 1,
            tpm_version: TPM_VERSION_20,
            interface_type: TPM_IFTYPE_SPB,
            imp_revision: 0,
        };
        TBS_SUCCESS
    }

    unsafe extern "system" fn device_info_invalid_context(_: u32, _: *mut c_void) -> u32 {
        TBS_E_INVALID_CONTEXT
    }

    unsafe extern "system" fn device_info_internal_error(_: u32, _: *mut c_void) -> u32 {
        0x8028_4001
    }

    fn tbs(symbols: &[(&str, usize)]) -> TbsService {
        let loader = FakeLoader::default().with_library(TBS_LIBRARY, symbols);
        TbsService::new(Arc::new(loader), TBS_LIBRARY)
    }

    #[test]
    fn tbs_reports_device_info() {
        let service = tbs(&[("Tbsi_GetDeviceInfo", device_info_hw as usize)]);
        let result = detect_tpm(&service).unwrap();
        assert_eq!(result.version, TpmVersion::V2_0);
        assert_eq!(result.interface_type, Some(TpmInterface::SpbAttached));
    }

    #[test]
    fn absent_library_is_a_load_failure() {
        let service = TbsService::new(Arc::new(FakeLoader::default()), TBS_LIBRARY);
        let err = detect_tpm(&service).unwrap_err();
        assert!(err.to_string().starts_with("library load failed"));
    }

    #[test]
    fn missing_entry_point_is_reported() {
        let err = detect_tpm(&tbs(&[])).unwrap_err();
        assert_eq!(
            err,
            DetectError::MissingSymbol {
                library: TBS_LIBRARY.to_string(),
                symbol: "Tbsi_GetDeviceInfo".to_string(),
            }
        );
    }

    #[test]
    fn invalid_context_means_no_device() {
        let service = tbs(&[("Tbsi_GetDeviceInfo", device_info_invalid_context as usize)]);
        let err = detect_tpm(&service).unwrap_err();
        assert_eq!(err.to_string(), "TPM device is not found");
    }

    #[test]
    fn other_failure_codes_are_query_errors() {
        let service = tbs(&[("Tbsi_GetDeviceInfo", device_info_internal_error as usize)]);
        let err = detect_tpm(&service).unwrap_err();
        assert_eq!(err.to_string(), "Tbsi_GetDeviceInfo() failed (0x80284001)");
    }

    #[test]
    fn sysfs_without_tpm_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = detect_tpm(&SysfsTpm::new(dir.path())).unwrap_err();
        assert_eq!(err, DetectError::DeviceNotFound("TPM"));
    }

    #[cfg(unix)]
    #[test]
    fn sysfs_maps_driver_to_interface() {
        let dir = tempfile::TempDir::new().unwrap();
        let tpm0 = dir.path().join("tpm0");
        let driver = dir.path().join("drivers/tpm_crb");
        fs::create_dir_all(tpm0.join("device")).unwrap();
        fs::create_dir_all(&driver).unwrap();
        fs::write(tpm0.join("tpm_version_major"), "2\n").unwrap();
        std::os::unix::fs::symlink(&driver, tpm0.join("device/driver")).unwrap();

        let result = detect_tpm(&SysfsTpm::new(dir.path())).unwrap();
        assert_eq!(result.version, TpmVersion::V2_0);
        assert_eq!(result.interface_name(), "HW TPM");
    }

    #[test]
    fn sysfs_without_driver_link_has_no_interface() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("tpm0")).unwrap();
        let result = detect_tpm(&SysfsTpm::new(dir.path())).unwrap();
        assert_eq!(result.version, TpmVersion::Unknown);
        assert_eq!(result.interface_type, None);
    }

    #[test]
    fn kernel_drivers_map_to_interface_codes() {
        assert_eq!(interface_for_driver("tpm_tis", TPM_VERSION_12), TPM_IFTYPE_1);
        assert_eq!(interface_for_driver("tpm_tis", TPM_VERSION_20), TPM_IFTYPE_HW);
        assert_eq!(interface_for_driver("tpm_tis_i2c_cr50", TPM_VERSION_20), TPM_IFTYPE_SPB);
        assert_eq!(interface_for_driver("tpm_ftpm_tee", TPM_VERSION_20), TPM_IFTYPE_TRUSTZONE);
        assert_eq!(interface_for_driver("tpm_vtpm_proxy", TPM_VERSION_20), TPM_IFTYPE_EMULATOR);
        assert_eq!(interface_for_driver("mystery", TPM_VERSION_20), TPM_IFTYPE_UNKNOWN);
    }
}
