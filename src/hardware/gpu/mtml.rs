//! Moore Threads Management Library backend

use std::ffi::{c_char, c_void};
use std::sync::Arc;

use super::driver::{DriverCondition, DriverProbe, DriverResult, GpuDevice, GpuEnumerator};
use super::{GpuType, GpuVendor};
use crate::error::ProbeError;
use crate::platform::c_buffer_to_string;
use crate::platform::library::{Library, LibraryLoader};

pub const PLATFORM_API: &str = "MTML";

const MTML_SUCCESS: u32 = 0;
const MTML_BRAND_MTT: u32 = 0;
const MTML_DEVICE_NAME_BUFFER_SIZE: usize = 32;
const MTML_DEVICE_UUID_BUFFER_SIZE: usize = 48;

type Handle = *mut c_void;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct MtmlPciInfo {
    sbdf: [c_char; 32],
    segment: u32,
    bus: u32,
    device: u32,
    pci_device_id: u32,
    pci_subsystem_id: u32,
    bus_width: u32,
    pci_max_speed: f32,
    pci_cur_speed: f32,
    pci_max_width: u32,
    pci_cur_width: u32,
    pci_max_gen: u32,
    pci_cur_gen: u32,
    rsvd: [i32; 6],
}

type FnLibraryInit = unsafe extern "C" fn(*mut Handle) -> u32;
type FnLibraryShutdown = unsafe extern "C" fn(Handle) -> u32;
type FnHandleU32 = unsafe extern "C" fn(Handle, *mut u32) -> u32;
type FnHandleU64 = unsafe extern "C" fn(Handle, *mut u64) -> u32;
type FnInitByIndex = unsafe extern "C" fn(Handle, u32, *mut Handle) -> u32;
type FnInitChild = unsafe extern "C" fn(Handle, *mut Handle) -> u32;
type FnDeviceString = unsafe extern "C" fn(Handle, *mut c_char, u32) -> u32;
type FnDevicePciInfo = unsafe extern "C" fn(Handle, *mut MtmlPciInfo) -> u32;

/// Initialized MTML library handle; shut down and unloaded on drop
struct MtmlSession {
    library: Box<dyn Library>,
    handle: Handle,
    shutdown: FnLibraryShutdown,
}

impl MtmlSession {
    fn open(loader: &dyn LibraryLoader, name: &str) -> Result<Self, ProbeError> {
        let library = loader.open(name)?;
        // SAFETY: signatures follow mtml.h.
        let (init, shutdown) = unsafe {
            (
                library.symbol::<FnLibraryInit>("mtmlLibraryInit")?,
                library.symbol::<FnLibraryShutdown>("mtmlLibraryShutDown")?,
            )
        };
        let mut handle: Handle = std::ptr::null_mut();
        // SAFETY: handle outlives the call.
        let code = unsafe { init(&mut handle) };
        if code != MTML_SUCCESS || handle.is_null() {
            return Err(ProbeError::Call {
                call: "mtmlLibraryInit",
                code,
            });
        }
        Ok(Self {
            library,
            handle,
            shutdown,
        })
    }

    /// # Safety
    ///
    /// `F` must match the MTML prototype of `name`.
    unsafe fn optional<F: Copy>(&self, name: &'static str) -> Option<F> {
        match self.library.symbol::<F>(name) {
            Ok(function) => Some(function),
            Err(err) => {
                tracing::debug!(error = %err, "mtml entry point missing");
                None
            }
        }
    }

    fn device_count(&self) -> Result<u32, ProbeError> {
        // SAFETY: prototype from mtml.h; count outlives the call.
        unsafe {
            let count_devices: FnHandleU32 = self.library.symbol("mtmlLibraryCountDevice")?;
            let mut count = 0;
            check("mtmlLibraryCountDevice", count_devices(self.handle, &mut count))?;
            Ok(count)
        }
    }

    fn device(&self, index: u32) -> Result<Handle, ProbeError> {
        // SAFETY: prototype from mtml.h; device outlives the call.
        unsafe {
            let init_device: FnInitByIndex = self.library.symbol("mtmlLibraryInitDeviceByIndex")?;
            let mut device: Handle = std::ptr::null_mut();
            check(
                "mtmlLibraryInitDeviceByIndex",
                init_device(self.handle, index, &mut device),
            )?;
            Ok(device)
        }
    }

    /// Sub-handle of a device (GPU or memory unit)
    fn child(&self, call: &'static str, device: Handle) -> Option<Handle> {
        // SAFETY: every caller passes an entry point shaped (device, handle*).
        unsafe {
            let init: FnInitChild = self.optional(call)?;
            let mut child: Handle = std::ptr::null_mut();
            soft_check(call, init(device, &mut child))?;
            (!child.is_null()).then_some(child)
        }
    }

    fn u32_of(&self, call: &'static str, handle: Handle) -> Option<u32> {
        // SAFETY: every caller passes an entry point shaped (handle, unsigned int*).
        unsafe {
            let function: FnHandleU32 = self.optional(call)?;
            let mut value = 0;
            soft_check(call, function(handle, &mut value))?;
            Some(value)
        }
    }

    fn u64_of(&self, call: &'static str, handle: Handle) -> Option<u64> {
        // SAFETY: every caller passes an entry point shaped (handle, unsigned long long*).
        unsafe {
            let function: FnHandleU64 = self.optional(call)?;
            let mut value = 0;
            soft_check(call, function(handle, &mut value))?;
            Some(value)
        }
    }

    fn string_of<const N: usize>(&self, call: &'static str, device: Handle) -> Option<String> {
        // SAFETY: buffer length is passed alongside the buffer.
        unsafe {
            let function: FnDeviceString = self.optional(call)?;
            let mut buffer = [0u8; N];
            soft_check(call, function(device, buffer.as_mut_ptr().cast(), N as u32))?;
            Some(c_buffer_to_string(&buffer))
        }
    }

    fn pci_info(&self, device: Handle) -> Option<MtmlPciInfo> {
        // SAFETY: prototype from mtml.h; pci outlives the call.
        unsafe {
            let function: FnDevicePciInfo = self.optional("mtmlDeviceGetPciInfo")?;
            let mut pci = MtmlPciInfo::default();
            soft_check("mtmlDeviceGetPciInfo", function(device, &mut pci))?;
            Some(pci)
        }
    }
}

impl Drop for MtmlSession {
    fn drop(&mut self) {
        // SAFETY: handle came from a successful mtmlLibraryInit.
        let code = unsafe { (self.shutdown)(self.handle) };
        if code != MTML_SUCCESS {
            tracing::debug!(code, "mtmlLibraryShutDown failed");
        }
    }
}

fn check(call: &'static str, code: u32) -> Result<(), ProbeError> {
    if code == MTML_SUCCESS {
        Ok(())
    } else {
        Err(ProbeError::Call { call, code })
    }
}

fn soft_check(call: &'static str, code: u32) -> Option<()> {
    match check(call, code) {
        Ok(()) => Some(()),
        Err(err) => {
            tracing::debug!(error = %err, "mtml query failed");
            None
        }
    }
}

/// MTML enumerator and Moore Threads sub-probe
pub struct Mtml {
    loader: Arc<dyn LibraryLoader>,
    library: String,
}

impl Mtml {
    pub fn new(loader: Arc<dyn LibraryLoader>, library: &str) -> Self {
        Self {
            loader,
            library: library.to_string(),
        }
    }

    fn session(&self) -> Result<MtmlSession, ProbeError> {
        MtmlSession::open(self.loader.as_ref(), &self.library)
    }
}

impl GpuEnumerator for Mtml {
    fn platform_api(&self) -> &'static str {
        PLATFORM_API
    }

    fn enumerate(&self) -> Result<Vec<GpuDevice>, ProbeError> {
        let session = self.session()?;
        let count = session.device_count()?;
        tracing::debug!(count, "mtml devices");

        Ok((0..count)
            .map(|index| {
                let device = session.device(index).ok();
                GpuDevice {
                    vendor: GpuVendor::MooreThreads,
                    condition: DriverCondition::Index(index),
                    device_id: device
                        .and_then(|device| session.pci_info(device))
                        .map(|pci| u64::from(pci.pci_device_id)),
                    name: device.and_then(|device| {
                        session.string_of::<MTML_DEVICE_NAME_BUFFER_SIZE>("mtmlDeviceGetName", device)
                    }),
                }
            })
            .collect())
    }
}

impl DriverProbe for Mtml {
    fn vendor(&self) -> GpuVendor {
        GpuVendor::MooreThreads
    }

    fn detect(&self, condition: &DriverCondition, mut out: DriverResult<'_>) -> Result<(), ProbeError> {
        let DriverCondition::Index(index) = condition else {
            return Err(ProbeError::Unsupported(format!("mtml cannot locate {condition:?}")));
        };
        let session = self.session()?;
        let device = session.device(*index)?;

        *out.index = session.u32_of("mtmlDeviceGetIndex", device).or(Some(*index));
        if let Some(brand) = session.u32_of("mtmlDeviceGetBrand", device) {
            *out.gpu_type = if brand == MTML_BRAND_MTT {
                GpuType::Discrete
            } else {
                GpuType::Unknown
            };
        }
        if let Some(name) = session.string_of::<MTML_DEVICE_NAME_BUFFER_SIZE>("mtmlDeviceGetName", device) {
            out.set_name(name);
        }
        if let Some(uuid) = session.string_of::<MTML_DEVICE_UUID_BUFFER_SIZE>("mtmlDeviceGetUUID", device) {
            *out.uuid = uuid;
        }
        if let Some(pci) = session.pci_info(device) {
            *out.device_id = Some(u64::from(pci.pci_device_id));
        }

        if let Some(gpu) = session.child("mtmlDeviceInitGpu", device) {
            if let Some(rate) = session.u32_of("mtmlGpuGetUtilization", gpu) {
                *out.core_utilization_rate = Some(f64::from(rate));
            }
            if out.wants_temp() {
                if let Some(celsius) = session.u32_of("mtmlGpuGetTemperature", gpu) {
                    out.set_temp(f64::from(celsius));
                }
            }
            if out.wants_frequency() {
                if let Some(mhz) = session.u32_of("mtmlGpuGetMaxClock", gpu) {
                    out.set_frequency(mhz);
                }
            }
        }

        if out.wants_memory() {
            if let Some(memory) = session.child("mtmlDeviceInitMemory", device) {
                out.set_memory(
                    session.u64_of("mtmlMemoryGetTotal", memory),
                    session.u64_of("mtmlMemoryGetUsed", memory),
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::gpu::{GpuMemory, GpuResult};
    use crate::platform::library::fake::FakeLoader;

    const LIB: &str = "libmtml.so";
    const LIBRARY: usize = 0x1000;
    const GPU_OFFSET: usize = 0x100;
    const MEMORY_OFFSET: usize = 0x200;

    unsafe extern "C" fn library_init(lib: *mut Handle) -> u32 {
        *lib = LIBRARY as Handle;
        MTML_SUCCESS
    }

    unsafe extern "C" fn library_shutdown(lib: Handle) -> u32 {
        assert_eq!(lib as usize, LIBRARY);
        MTML_SUCCESS
    }

    unsafe extern "C" fn count_device(_: Handle, count: *mut u32) -> u32 {
        *count = 1;
        MTML_SUCCESS
    }

    unsafe extern "C" fn init_device(_: Handle, index: u32, device: *mut Handle) -> u32 {
        *device = (index as usize + 1) as Handle;
        MTML_SUCCESS
    }

    unsafe extern "C" fn init_gpu(device: Handle, gpu: *mut Handle) -> u32 {
        *gpu = (device as usize + GPU_OFFSET) as Handle;
        MTML_SUCCESS
    }

    unsafe extern "C" fn init_memory(device: Handle, memory: *mut Handle) -> u32 {
        *memory = (device as usize + MEMORY_OFFSET) as Handle;
        MTML_SUCCESS
    }

    unsafe extern "C" fn get_brand(_: Handle, brand: *mut u32) -> u32 {
        *brand = MTML_BRAND_MTT;
        MTML_SUCCESS
    }

    unsafe extern "C" fn get_name(_: Handle, buffer: *mut c_char, length: u32) -> u32 {
        let name = b"MTT S80\0";
        assert!(name.len() <= length as usize);
        std::ptr::copy_nonoverlapping(name.as_ptr(), buffer.cast::<u8>(), name.len());
        MTML_SUCCESS
    }

    unsafe extern "C" fn get_temperature(gpu: Handle, celsius: *mut u32) -> u32 {
        assert_eq!(gpu as usize, 1 + GPU_OFFSET);
        *celsius = 52;
        MTML_SUCCESS
    }

    unsafe extern "C" fn get_max_clock(_: Handle, mhz: *mut u32) -> u32 {
        *mhz = 1800;
        MTML_SUCCESS
    }

    unsafe extern "C" fn get_utilization(_: Handle, rate: *mut u32) -> u32 {
        *rate = 9;
        MTML_SUCCESS
    }

    unsafe extern "C" fn memory_total(memory: Handle, total: *mut u64) -> u32 {
        assert_eq!(memory as usize, 1 + MEMORY_OFFSET);
        *total = 16 << 30;
        MTML_SUCCESS
    }

    unsafe extern "C" fn memory_used(_: Handle, used: *mut u64) -> u32 {
        *used = 3 << 30;
        MTML_SUCCESS
    }

    fn symbols() -> Vec<(&'static str, usize)> {
        vec![
            ("mtmlLibraryInit", library_init as usize),
            ("mtmlLibraryShutDown", library_shutdown as usize),
            ("mtmlLibraryCountDevice", count_device as usize),
            ("mtmlLibraryInitDeviceByIndex", init_device as usize),
            ("mtmlDeviceInitGpu", init_gpu as usize),
            ("mtmlDeviceInitMemory", init_memory as usize),
            ("mtmlDeviceGetBrand", get_brand as usize),
            ("mtmlDeviceGetName", get_name as usize),
            ("mtmlGpuGetTemperature", get_temperature as usize),
            ("mtmlGpuGetMaxClock", get_max_clock as usize),
            ("mtmlGpuGetUtilization", get_utilization as usize),
            ("mtmlMemoryGetTotal", memory_total as usize),
            ("mtmlMemoryGetUsed", memory_used as usize),
        ]
    }

    fn mtml() -> (Mtml, Arc<FakeLoader>) {
        let loader = Arc::new(FakeLoader::default().with_library(LIB, &symbols()));
        let shared: Arc<dyn LibraryLoader> = loader.clone();
        (Mtml::new(shared, LIB), loader)
    }

    fn probe(mtml: &Mtml, temp: bool, driver_specific: bool) -> GpuResult {
        let mut gpu = GpuResult::new(GpuVendor::MooreThreads, PLATFORM_API);
        let out = DriverResult {
            index: &mut gpu.index,
            temp: temp.then_some(&mut gpu.temperature),
            memory: driver_specific.then_some(&mut gpu.dedicated),
            shared: driver_specific.then_some(&mut gpu.shared),
            core_count: driver_specific.then_some(&mut gpu.core_count),
            frequency: driver_specific.then_some(&mut gpu.frequency),
            core_utilization_rate: &mut gpu.core_utilization_rate,
            gpu_type: &mut gpu.gpu_type,
            device_id: &mut gpu.device_id,
            uuid: &mut gpu.uuid,
            name: &mut gpu.name,
            driver: &mut gpu.driver,
        };
        mtml.detect(&DriverCondition::Index(0), out).unwrap();
        gpu
    }

    #[test]
    fn enumerates_devices_with_names() {
        let (mtml, loader) = mtml();
        let devices = mtml.enumerate().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].vendor, GpuVendor::MooreThreads);
        assert_eq!(devices[0].name.as_deref(), Some("MTT S80"));
        // Pci info entry point is absent in this library
        assert_eq!(devices[0].device_id, None);
        assert_eq!(loader.closed(), 1);
    }

    #[test]
    fn full_probe_reads_gpu_and_memory_units() {
        let (mtml, _loader) = mtml();
        let gpu = probe(&mtml, true, true);
        assert_eq!(gpu.temperature, Some(52.0));
        assert_eq!(gpu.frequency, Some(1800));
        assert_eq!(gpu.core_utilization_rate, Some(9.0));
        assert_eq!(gpu.dedicated.total, Some(16 << 30));
        assert_eq!(gpu.dedicated.used, Some(3 << 30));
        assert_eq!(gpu.gpu_type, GpuType::Discrete);
        assert_eq!(gpu.index, Some(0));
        // No core count entry point in MTML
        assert_eq!(gpu.core_count, None);
    }

    #[test]
    fn unrequested_fields_stay_unset() {
        let (mtml, _loader) = mtml();
        let gpu = probe(&mtml, false, false);
        assert_eq!(gpu.temperature, None);
        assert_eq!(gpu.frequency, None);
        assert_eq!(gpu.dedicated, GpuMemory::default());
        assert_eq!(gpu.name, "MTT S80");
    }
}
