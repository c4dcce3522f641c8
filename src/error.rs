//! Error types for hwprobe
//!
//! Detection distinguishes two severities. [`DetectError`] is fatal for a
//! whole domain: the hardware identity itself could not be determined.
//! [`ProbeError`] describes a single unavailable source; backends absorb it
//! into an unset field and log it, so it never reaches the caller of a
//! dispatcher.

use thiserror::Error;

/// Fatal detection failure for one domain (CPU, GPU or TPM)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectError {
    /// The minimum identity of the device (e.g. the CPU brand string) is unavailable
    #[error("cannot determine {what}: {reason}")]
    MissingIdentity { what: &'static str, reason: String },

    /// A required service library could not be loaded
    #[error("library load failed: {library}: {reason}")]
    LibraryLoad { library: String, reason: String },

    /// A required symbol is missing from a loaded library
    #[error("symbol {symbol} not found in {library}")]
    MissingSymbol { library: String, symbol: String },

    /// The device is absent
    #[error("{0} device is not found")]
    DeviceNotFound(&'static str),

    /// A device query returned a failure code
    #[error("{call}() failed (0x{code:08x})")]
    DeviceQuery { call: &'static str, code: u32 },

    /// No backend exists for this platform
    #[error("{0} detection is not supported on this platform")]
    Unsupported(&'static str),
}

/// Degraded, field-level failure of a single data source
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    Library(#[from] LibraryError),

    /// A vendor API call returned a non-success status
    #[error("{call}() returned {code}")]
    Call { call: &'static str, code: u32 },

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The source exists but holds nothing usable
    #[error("{0}")]
    Unavailable(String),

    /// The probe cannot handle this device or family
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ProbeError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        ProbeError::Unavailable(message.into())
    }

    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        ProbeError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// Failure of the scoped dynamic library loader
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LibraryError {
    #[error("dlopen {library} failed: {reason}")]
    Load { library: String, reason: String },

    #[error("symbol {symbol} not found in {library}")]
    Symbol { library: String, symbol: String },
}

impl From<LibraryError> for DetectError {
    fn from(err: LibraryError) -> Self {
        match err {
            LibraryError::Load { library, reason } => DetectError::LibraryLoad { library, reason },
            LibraryError::Symbol { library, symbol } => {
                DetectError::MissingSymbol { library, symbol }
            }
        }
    }
}
