//! NVIDIA Management Library backend
//!
//! NVML is both the primary GPU enumerator and the NVIDIA sub-probe. Every
//! query opens its own session: library load, `nvmlInit_v2`, calls, then
//! `nvmlShutdown` and unload, all owned by [`NvmlSession`].

use std::ffi::{c_char, c_void};
use std::sync::Arc;

use super::driver::{DriverCondition, DriverProbe, DriverResult, GpuDevice, GpuEnumerator};
use super::{GpuType, GpuVendor};
use crate::error::ProbeError;
use crate::platform::c_buffer_to_string;
use crate::platform::library::{Library, LibraryLoader};

pub const PLATFORM_API: &str = "NVML";

const NVML_SUCCESS: u32 = 0;
const NVML_TEMPERATURE_GPU: u32 = 0;
const NVML_CLOCK_GRAPHICS: u32 = 0;
const NVML_DEVICE_NAME_V2_BUFFER_SIZE: usize = 96;
const NVML_DEVICE_UUID_V2_BUFFER_SIZE: usize = 96;
const NVML_SYSTEM_DRIVER_VERSION_BUFFER_SIZE: usize = 80;

type NvmlDevice = *mut c_void;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct NvmlMemory {
    total: u64,
    free: u64,
    used: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct NvmlUtilization {
    gpu: u32,
    memory: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct NvmlPciInfo {
    bus_id_legacy: [c_char; 16],
    domain: u32,
    bus: u32,
    device: u32,
    pci_device_id: u32,
    pci_sub_system_id: u32,
    bus_id: [c_char; 32],
}

type FnStatus = unsafe extern "C" fn() -> u32;
type FnGetCount = unsafe extern "C" fn(*mut u32) -> u32;
type FnGetHandleByIndex = unsafe extern "C" fn(u32, *mut NvmlDevice) -> u32;
type FnDeviceU32 = unsafe extern "C" fn(NvmlDevice, *mut u32) -> u32;
type FnDeviceSensor = unsafe extern "C" fn(NvmlDevice, u32, *mut u32) -> u32;
type FnDeviceString = unsafe extern "C" fn(NvmlDevice, *mut c_char, u32) -> u32;
type FnDeviceMemory = unsafe extern "C" fn(NvmlDevice, *mut NvmlMemory) -> u32;
type FnDeviceUtilization = unsafe extern "C" fn(NvmlDevice, *mut NvmlUtilization) -> u32;
type FnDevicePciInfo = unsafe extern "C" fn(NvmlDevice, *mut NvmlPciInfo) -> u32;
type FnSystemString = unsafe extern "C" fn(*mut c_char, u32) -> u32;

/// Initialized NVML; shuts down and unloads on drop
struct NvmlSession {
    library: Box<dyn Library>,
    shutdown: FnStatus,
}

impl NvmlSession {
    fn open(loader: &dyn LibraryLoader, name: &str) -> Result<Self, ProbeError> {
        let library = loader.open(name)?;
        // SAFETY: signatures follow nvml.h.
        let (init, shutdown) = unsafe {
            (
                library.symbol::<FnStatus>("nvmlInit_v2")?,
                library.symbol::<FnStatus>("nvmlShutdown")?,
            )
        };
        // SAFETY: nvmlInit_v2 takes no arguments.
        let code = unsafe { init() };
        if code != NVML_SUCCESS {
            return Err(ProbeError::Call {
                call: "nvmlInit_v2",
                code,
            });
        }
        Ok(Self { library, shutdown })
    }

    /// # Safety
    ///
    /// `F` must match the NVML prototype of `name`.
    unsafe fn required<F: Copy>(&self, name: &'static str) -> Result<F, ProbeError> {
        Ok(self.library.symbol::<F>(name)?)
    }

    /// Optional entry point; absence is logged and tolerated.
    ///
    /// # Safety
    ///
    /// `F` must match the NVML prototype of `name`.
    unsafe fn optional<F: Copy>(&self, name: &'static str) -> Option<F> {
        match self.library.symbol::<F>(name) {
            Ok(function) => Some(function),
            Err(err) => {
                tracing::debug!(error = %err, "nvml entry point missing");
                None
            }
        }
    }

    fn device_count(&self) -> Result<u32, ProbeError> {
        // SAFETY: prototype from nvml.h; count outlives the call.
        unsafe {
            let get_count: FnGetCount = self.required("nvmlDeviceGetCount_v2")?;
            let mut count = 0;
            check("nvmlDeviceGetCount_v2", get_count(&mut count))?;
            Ok(count)
        }
    }

    fn device(&self, index: u32) -> Result<NvmlDevice, ProbeError> {
        // SAFETY: prototype from nvml.h; handle outlives the call.
        unsafe {
            let get_handle: FnGetHandleByIndex = self.required("nvmlDeviceGetHandleByIndex_v2")?;
            let mut handle: NvmlDevice = std::ptr::null_mut();
            check("nvmlDeviceGetHandleByIndex_v2", get_handle(index, &mut handle))?;
            Ok(handle)
        }
    }

    fn device_u32(&self, call: &'static str, device: NvmlDevice) -> Option<u32> {
        // SAFETY: every caller passes an entry point shaped (device, unsigned int*).
        unsafe {
            let function: FnDeviceU32 = self.optional(call)?;
            let mut value = 0;
            soft_check(call, function(device, &mut value))?;
            Some(value)
        }
    }

    fn device_sensor(&self, call: &'static str, device: NvmlDevice, sensor: u32) -> Option<u32> {
        // SAFETY: every caller passes an entry point shaped (device, enum, unsigned int*).
        unsafe {
            let function: FnDeviceSensor = self.optional(call)?;
            let mut value = 0;
            soft_check(call, function(device, sensor, &mut value))?;
            Some(value)
        }
    }

    fn device_string<const N: usize>(&self, call: &'static str, device: NvmlDevice) -> Option<String> {
        // SAFETY: buffer length is passed alongside the buffer.
        unsafe {
            let function: FnDeviceString = self.optional(call)?;
            let mut buffer = [0u8; N];
            soft_check(call, function(device, buffer.as_mut_ptr().cast(), N as u32))?;
            Some(c_buffer_to_string(&buffer))
        }
    }

    fn memory(&self, device: NvmlDevice) -> Option<NvmlMemory> {
        // SAFETY: prototype from nvml.h; memory outlives the call.
        unsafe {
            let function: FnDeviceMemory = self.optional("nvmlDeviceGetMemoryInfo")?;
            let mut memory = NvmlMemory::default();
            soft_check("nvmlDeviceGetMemoryInfo", function(device, &mut memory))?;
            Some(memory)
        }
    }

    fn utilization(&self, device: NvmlDevice) -> Option<NvmlUtilization> {
        // SAFETY: prototype from nvml.h; rates outlives the call.
        unsafe {
            let function: FnDeviceUtilization = self.optional("nvmlDeviceGetUtilizationRates")?;
            let mut rates = NvmlUtilization::default();
            soft_check("nvmlDeviceGetUtilizationRates", function(device, &mut rates))?;
            Some(rates)
        }
    }

    fn pci_info(&self, device: NvmlDevice) -> Option<NvmlPciInfo> {
        // SAFETY: prototype from nvml.h; pci outlives the call.
        unsafe {
            let function: FnDevicePciInfo = self.optional("nvmlDeviceGetPciInfo_v3")?;
            let mut pci = NvmlPciInfo::default();
            soft_check("nvmlDeviceGetPciInfo_v3", function(device, &mut pci))?;
            Some(pci)
        }
    }

    fn driver_version(&self) -> Option<String> {
        // SAFETY: buffer length is passed alongside the buffer.
        unsafe {
            let function: FnSystemString = self.optional("nvmlSystemGetDriverVersion")?;
            let mut buffer = [0u8; NVML_SYSTEM_DRIVER_VERSION_BUFFER_SIZE];
            soft_check(
                "nvmlSystemGetDriverVersion",
                function(buffer.as_mut_ptr().cast(), buffer.len() as u32),
            )?;
            Some(c_buffer_to_string(&buffer))
        }
    }
}

impl Drop for NvmlSession {
    fn drop(&mut self) {
        // SAFETY: paired with the successful nvmlInit_v2 in open().
        let code = unsafe { (self.shutdown)() };
        if code != NVML_SUCCESS {
            tracing::debug!(code, "nvmlShutdown failed");
        }
    }
}

fn check(call: &'static str, code: u32) -> Result<(), ProbeError> {
    if code == NVML_SUCCESS {
        Ok(())
    } else {
        Err(ProbeError::Call { call, code })
    }
}

fn soft_check(call: &'static str, code: u32) -> Option<()> {
    match check(call, code) {
        Ok(()) => Some(()),
        Err(err) => {
            tracing::debug!(error = %err, "nvml query failed");
            None
        }
    }
}

/// NVML enumerator and NVIDIA sub-probe
pub struct Nvml {
    loader: Arc<dyn LibraryLoader>,
    library: String,
}

impl Nvml {
    pub fn new(loader: Arc<dyn LibraryLoader>, library: &str) -> Self {
        Self {
            loader,
            library: library.to_string(),
        }
    }

    fn session(&self) -> Result<NvmlSession, ProbeError> {
        NvmlSession::open(self.loader.as_ref(), &self.library)
    }
}

impl GpuEnumerator for Nvml {
    fn platform_api(&self) -> &'static str {
        PLATFORM_API
    }

    fn enumerate(&self) -> Result<Vec<GpuDevice>, ProbeError> {
        let session = self.session()?;
        let count = session.device_count()?;
        tracing::debug!(count, "nvml devices");

        let devices = (0..count)
            .map(|index| {
                let (name, device_id) = match session.device(index) {
                    Ok(device) => (
                        session.device_string::<NVML_DEVICE_NAME_V2_BUFFER_SIZE>("nvmlDeviceGetName", device),
                        session.pci_info(device).map(|pci| u64::from(pci.pci_device_id)),
                    ),
                    Err(err) => {
                        tracing::debug!(index, error = %err, "nvml device handle unavailable");
                        (None, None)
                    }
                };
                GpuDevice {
                    vendor: GpuVendor::Nvidia,
                    condition: DriverCondition::Index(index),
                    device_id,
                    name,
                }
            })
            .collect();
        Ok(devices)
    }
}

impl DriverProbe for Nvml {
    fn vendor(&self) -> GpuVendor {
        GpuVendor::Nvidia
    }

    fn detect(&self, condition: &DriverCondition, mut out: DriverResult<'_>) -> Result<(), ProbeError> {
        let DriverCondition::Index(index) = condition else {
            return Err(ProbeError::Unsupported(format!("nvml cannot locate {condition:?}")));
        };
        let session = self.session()?;
        let device = session.device(*index)?;

        *out.index = session.device_u32("nvmlDeviceGetIndex", device).or(Some(*index));
        *out.gpu_type = GpuType::Discrete;

        if let Some(name) = session.device_string::<NVML_DEVICE_NAME_V2_BUFFER_SIZE>("nvmlDeviceGetName", device) {
            out.set_name(name);
        }
        if let Some(uuid) = session.device_string::<NVML_DEVICE_UUID_V2_BUFFER_SIZE>("nvmlDeviceGetUUID", device) {
            *out.uuid = uuid;
        }
        if let Some(pci) = session.pci_info(device) {
            *out.device_id = Some(u64::from(pci.pci_device_id));
        }
        if let Some(version) = session.driver_version() {
            *out.driver = version;
        }
        if let Some(rates) = session.utilization(device) {
            *out.core_utilization_rate = Some(f64::from(rates.gpu));
        }

        if out.wants_temp() {
            if let Some(celsius) = session.device_sensor("nvmlDeviceGetTemperature", device, NVML_TEMPERATURE_GPU) {
                out.set_temp(f64::from(celsius));
            }
        }
        if out.wants_memory() {
            if let Some(memory) = session.memory(device) {
                out.set_memory(Some(memory.total), Some(memory.used));
            }
        }
        if out.wants_core_count() {
            if let Some(cores) = session.device_u32("nvmlDeviceGetNumGpuCores", device) {
                out.set_core_count(cores);
            }
        }
        if out.wants_frequency() {
            if let Some(mhz) = session.device_sensor("nvmlDeviceGetMaxClockInfo", device, NVML_CLOCK_GRAPHICS) {
                out.set_frequency(mhz);
            }
        }
        Ok(())
    }
}
