//! Scoped dynamic library loading
//!
//! Vendor driver libraries (NVML, MTML, TBS) are optional at runtime, so they
//! are opened on demand instead of being linked. A [`DynamicLibrary`] owns the
//! OS handle and closes it when dropped, which covers every early return in
//! the probes that use it.

use std::ffi::{c_void, CString};
use std::ptr::NonNull;

use crate::error::LibraryError;

/// A loaded library that can resolve symbols by name
pub trait Library {
    /// File name the library was opened with
    fn name(&self) -> &str;

    /// Resolve a symbol to its raw address
    fn raw_symbol(&self, symbol: &str) -> Result<*mut c_void, LibraryError>;
}

impl dyn Library + '_ {
    /// Resolve a symbol as a typed function pointer.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type whose signature and calling
    /// convention match the exported symbol.
    pub unsafe fn symbol<F: Copy>(&self, symbol: &str) -> Result<F, LibraryError> {
        debug_assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*mut c_void>()
        );
        let address = self.raw_symbol(symbol)?;
        Ok(std::mem::transmute_copy::<*mut c_void, F>(&address))
    }
}

/// Opens libraries by file name
pub trait LibraryLoader: Send + Sync {
    fn open(&self, name: &str) -> Result<Box<dyn Library>, LibraryError>;
}

/// Loader backed by the platform's dynamic linker
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLoader;

impl LibraryLoader for SystemLoader {
    fn open(&self, name: &str) -> Result<Box<dyn Library>, LibraryError> {
        let library = DynamicLibrary::open(name)?;
        Ok(Box::new(library))
    }
}

/// Owned handle to a dynamically loaded library
#[derive(Debug)]
pub struct DynamicLibrary {
    name: String,
    handle: NonNull<c_void>,
}

fn c_string(library: &str, value: &str) -> Result<CString, LibraryError> {
    CString::new(value).map_err(|_| LibraryError::Load {
        library: library.to_string(),
        reason: format!("{value:?} contains a NUL byte"),
    })
}

#[cfg(unix)]
impl DynamicLibrary {
    pub fn open(name: &str) -> Result<Self, LibraryError> {
        let c_name = c_string(name, name)?;
        // SAFETY: c_name is a valid NUL-terminated string for the duration of the call.
        let handle = unsafe { libc::dlopen(c_name.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        match NonNull::new(handle) {
            Some(handle) => {
                tracing::debug!(library = name, "loaded library");
                Ok(Self {
                    name: name.to_string(),
                    handle,
                })
            }
            None => Err(LibraryError::Load {
                library: name.to_string(),
                reason: last_dl_error(),
            }),
        }
    }
}

#[cfg(unix)]
fn last_dl_error() -> String {
    // SAFETY: dlerror returns either null or a pointer to a thread-local C string.
    unsafe {
        let message = libc::dlerror();
        if message.is_null() {
            "unknown error".to_string()
        } else {
            std::ffi::CStr::from_ptr(message)
                .to_string_lossy()
                .into_owned()
        }
    }
}

#[cfg(unix)]
impl Library for DynamicLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_symbol(&self, symbol: &str) -> Result<*mut c_void, LibraryError> {
        let c_symbol = c_string(&self.name, symbol)?;
        // SAFETY: handle is a live dlopen handle owned by self.
        let address = unsafe { libc::dlsym(self.handle.as_ptr(), c_symbol.as_ptr()) };
        if address.is_null() {
            return Err(LibraryError::Symbol {
                library: self.name.clone(),
                symbol: symbol.to_string(),
            });
        }
        Ok(address)
    }
}

#[cfg(unix)]
impl Drop for DynamicLibrary {
    fn drop(&mut self) {
        // SAFETY: handle came from dlopen and is closed exactly once.
        unsafe {
            libc::dlclose(self.handle.as_ptr());
        }
        tracing::debug!(library = %self.name, "closed library");
    }
}

#[cfg(windows)]
impl DynamicLibrary {
    pub fn open(name: &str) -> Result<Self, LibraryError> {
        use windows_sys::Win32::Foundation::GetLastError;
        use windows_sys::Win32::System::LibraryLoader::LoadLibraryW;

        let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
        // SAFETY: wide is NUL-terminated and outlives the call.
        let handle = unsafe { LoadLibraryW(wide.as_ptr()) };
        match NonNull::new(handle) {
            Some(handle) => {
                tracing::debug!(library = name, "loaded library");
                Ok(Self {
                    name: name.to_string(),
                    handle,
                })
            }
            None => Err(LibraryError::Load {
                library: name.to_string(),
                // SAFETY: reads the calling thread's last-error value.
                reason: format!("LoadLibraryW error {}", unsafe { GetLastError() }),
            }),
        }
    }
}

#[cfg(windows)]
impl Library for DynamicLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_symbol(&self, symbol: &str) -> Result<*mut c_void, LibraryError> {
        use windows_sys::Win32::System::LibraryLoader::GetProcAddress;

        let c_symbol = c_string(&self.name, symbol)?;
        // SAFETY: handle is a live module handle owned by self.
        let address = unsafe { GetProcAddress(self.handle.as_ptr(), c_symbol.as_ptr().cast()) };
        match address {
            Some(function) => Ok(function as *mut c_void),
            None => Err(LibraryError::Symbol {
                library: self.name.clone(),
                symbol: symbol.to_string(),
            }),
        }
    }
}

#[cfg(windows)]
impl Drop for DynamicLibrary {
    fn drop(&mut self) {
        use windows_sys::Win32::System::LibraryLoader::FreeLibrary;

        // SAFETY: handle came from LoadLibraryW and is freed exactly once.
        unsafe {
            FreeLibrary(self.handle.as_ptr());
        }
        tracing::debug!(library = %self.name, "closed library");
    }
}

/// In-memory libraries for tests: symbols resolve to addresses of test functions.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    pub struct FakeLibrary {
        name: String,
        symbols: HashMap<String, usize>,
        closed: Arc<AtomicUsize>,
    }

    impl Library for FakeLibrary {
        fn name(&self) -> &str {
            &self.name
        }

        fn raw_symbol(&self, symbol: &str) -> Result<*mut c_void, LibraryError> {
            self.symbols
                .get(symbol)
                .map(|&address| address as *mut c_void)
                .ok_or_else(|| LibraryError::Symbol {
                    library: self.name.clone(),
                    symbol: symbol.to_string(),
                })
        }
    }

    impl Drop for FakeLibrary {
        fn drop(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Loader serving a fixed set of fake libraries
    #[derive(Default)]
    pub struct FakeLoader {
        libraries: HashMap<String, HashMap<String, usize>>,
        pub opened: Arc<AtomicUsize>,
        pub closed: Arc<AtomicUsize>,
    }

    impl FakeLoader {
        pub fn with_library(mut self, name: &str, symbols: &[(&str, usize)]) -> Self {
            let symbols = symbols
                .iter()
                .map(|(symbol, address)| (symbol.to_string(), *address))
                .collect();
            self.libraries.insert(name.to_string(), symbols);
            self
        }

        pub fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        pub fn closed(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl LibraryLoader for FakeLoader {
        fn open(&self, name: &str) -> Result<Box<dyn Library>, LibraryError> {
            let symbols = self
                .libraries
                .get(name)
                .cloned()
                .ok_or_else(|| LibraryError::Load {
                    library: name.to_string(),
                    reason: "no such file".to_string(),
                })?;
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeLibrary {
                name: name.to_string(),
                symbols,
                closed: Arc::clone(&self.closed),
            }))
        }
    }
}
