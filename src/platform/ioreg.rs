//! Device registry property readers
//!
//! Apple Silicon publishes the CPU clusters' DVFS tables as raw data
//! properties of the `pmgr` service in the IOKit registry. Each table is a
//! sequence of little-endian `(frequency_hz: u32, voltage: u32)` pairs.

/// Raw data properties of registry services
pub trait DeviceRegistry: Send + Sync {
    /// Bytes of a data property on the first service matching `service`
    fn property_data(&self, service: &str, key: &str) -> Option<Vec<u8>>;
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub use self::iokit::IoRegistry;

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
mod iokit {
    use super::DeviceRegistry;
    use std::ffi::{c_char, c_void, CString};

    type IoObject = u32;
    type CfTypeRef = *const c_void;
    type CfIndex = isize;

    const K_CF_STRING_ENCODING_UTF8: u32 = 0x0800_0100;

    #[link(name = "IOKit", kind = "framework")]
    extern "C" {
        fn IOServiceNameMatching(name: *const c_char) -> *mut c_void;
        fn IOServiceGetMatchingService(main_port: u32, matching: *mut c_void) -> IoObject;
        fn IOObjectConformsTo(object: IoObject, class_name: *const c_char) -> u32;
        fn IORegistryEntryCreateCFProperty(
            entry: IoObject,
            key: CfTypeRef,
            allocator: CfTypeRef,
            options: u32,
        ) -> CfTypeRef;
        fn IOObjectRelease(object: IoObject) -> i32;
    }

    #[link(name = "CoreFoundation", kind = "framework")]
    extern "C" {
        fn CFStringCreateWithCString(
            allocator: CfTypeRef,
            c_str: *const c_char,
            encoding: u32,
        ) -> CfTypeRef;
        fn CFGetTypeID(cf: CfTypeRef) -> usize;
        fn CFDataGetTypeID() -> usize;
        fn CFDataGetLength(data: CfTypeRef) -> CfIndex;
        fn CFDataGetBytePtr(data: CfTypeRef) -> *const u8;
        fn CFRelease(cf: CfTypeRef);
    }

    /// Released with IOObjectRelease on drop
    struct ServiceGuard(IoObject);

    impl Drop for ServiceGuard {
        fn drop(&mut self) {
            // SAFETY: the object was returned retained by IOServiceGetMatchingService.
            unsafe {
                IOObjectRelease(self.0);
            }
        }
    }

    /// Released with CFRelease on drop
    struct CfGuard(CfTypeRef);

    impl Drop for CfGuard {
        fn drop(&mut self) {
            if !self.0.is_null() {
                // SAFETY: the reference was obtained from a Create function.
                unsafe { CFRelease(self.0) }
            }
        }
    }

    #[derive(Debug, Default, Clone, Copy)]
    pub struct IoRegistry;

    impl DeviceRegistry for IoRegistry {
        fn property_data(&self, service: &str, key: &str) -> Option<Vec<u8>> {
            let service_name = CString::new(service).ok()?;
            let key_name = CString::new(key).ok()?;
            let class_name = CString::new("AppleARMIODevice").ok()?;

            // SAFETY: every pointer passed below is a valid C string or a
            // reference owned by one of the guards, which outlive the calls.
            unsafe {
                // IOServiceGetMatchingService consumes the matching dictionary
                let matching = IOServiceNameMatching(service_name.as_ptr());
                if matching.is_null() {
                    return None;
                }
                let entry = IOServiceGetMatchingService(0, matching);
                if entry == 0 {
                    tracing::debug!(service, "IOServiceGetMatchingService() found nothing");
                    return None;
                }
                let entry = ServiceGuard(entry);
                if IOObjectConformsTo(entry.0, class_name.as_ptr()) == 0 {
                    tracing::debug!(service, "service does not conform to AppleARMIODevice");
                    return None;
                }

                let cf_key = CfGuard(CFStringCreateWithCString(
                    std::ptr::null(),
                    key_name.as_ptr(),
                    K_CF_STRING_ENCODING_UTF8,
                ));
                if cf_key.0.is_null() {
                    return None;
                }
                let value = CfGuard(IORegistryEntryCreateCFProperty(
                    entry.0,
                    cf_key.0,
                    std::ptr::null(),
                    0,
                ));
                if value.0.is_null() || CFGetTypeID(value.0) != CFDataGetTypeID() {
                    return None;
                }

                let length = usize::try_from(CFDataGetLength(value.0)).ok()?;
                let bytes = CFDataGetBytePtr(value.0);
                if bytes.is_null() {
                    return None;
                }
                Some(std::slice::from_raw_parts(bytes, length).to_vec())
            }
        }
    }
}

/// Read the little-endian `u32` at `offset`
pub fn u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

/// The platform's registry reader, if it has one
pub fn device_registry() -> Option<Box<dyn DeviceRegistry>> {
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        Some(Box::new(IoRegistry))
    }
    #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
    {
        None
    }
}
