//! Error types for the BLE peripheral core

use std::io;

use thiserror::Error;

// ----------------------------------------------------------------------------
// Backend Status Codes
// ----------------------------------------------------------------------------

/// Generic I/O failure without an OS error number
pub(crate) const CODE_IO: i32 = -5;

/// Adapter lost power under the stack
pub(crate) const CODE_NET_DOWN: i32 = -100;

/// Controller did not answer in time
pub(crate) const CODE_TIMEOUT: i32 = -110;

/// Request abandoned because the stack went away
pub(crate) const CODE_CANCELED: i32 = -125;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors returned by the peripheral operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("BLE peripheral already initialized")]
    AlreadyInitialized,

    #[error("BLE peripheral not initialized")]
    NotInitialized,

    #[error("BLE not supported on this platform")]
    NotSupported,

    #[error("BLE backend failure (code {code})")]
    BackendFailure { code: i32 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("HCI command 0x{opcode:04X} timed out")]
    Timeout { opcode: u16 },
}

impl BleError {
    /// Backend failure carrying a raw status code
    pub fn backend(code: i32) -> Self {
        Self::BackendFailure { code }
    }

    /// Numeric status for callers that surface C-style codes
    pub fn code(&self) -> i32 {
        match self {
            Self::AlreadyInitialized => -114,
            Self::NotInitialized => -19,
            Self::NotSupported => -95,
            Self::BackendFailure { code } => *code,
            Self::InvalidArgument(_) => -22,
            Self::Timeout { .. } => CODE_TIMEOUT,
        }
    }
}

impl From<io::Error> for BleError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Unsupported => Self::NotSupported,
            _ => Self::BackendFailure {
                code: err.raw_os_error().map(|errno| -errno).unwrap_or(CODE_IO),
            },
        }
    }
}

/// Result alias for peripheral operations
pub type BleResult<T> = Result<T, BleError>;
