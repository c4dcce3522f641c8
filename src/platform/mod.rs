//! OS primitive accessors
//!
//! Thin wrappers over sysctl, the IOKit registry and the dynamic linker.
//! Each one is a trait so the dispatchers in [`crate::hardware`] can be
//! driven by in-memory sources in tests.

pub mod ioreg;
pub mod library;
pub mod properties;

pub use ioreg::{device_registry, DeviceRegistry};
pub use library::{DynamicLibrary, Library, LibraryLoader, SystemLoader};
pub use properties::{system_properties, SysinfoProperties, SystemProperties};

/// Decode a NUL-terminated C string held in a fixed buffer
pub fn c_buffer_to_string(buffer: &[u8]) -> String {
    let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).trim().to_string()
}
