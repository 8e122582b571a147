//! Error types for the bridge
//!
//! A compiler diagnostic is not an error: a non-zero exit code travels back
//! to the caller as data. `BridgeError` covers only faults of the bridge
//! itself - fetches, provisioning, instantiation and invocation mechanics.

use crate::fetch::FetchError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur while preparing or invoking the compiler module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Manifest or module-binary retrieval failed
    Fetch(FetchError),

    /// The virtual filesystem could not be provisioned
    Provision { reason: String },

    /// Module failed to compile or link against the sandbox
    Instantiation { reason: String },

    /// Required export is missing
    MissingExport { name: &'static str },

    /// Export has wrong type
    WrongExportType {
        name: &'static str,
        expected: &'static str,
    },

    /// The module's allocator could not satisfy a request
    OutOfMemory { requested: u32 },

    /// Memory access outside the module's linear memory
    MemoryAccessOutOfBounds { address: u32, size: u32 },

    /// The entry point trapped without recording an exit code
    Invocation { reason: String },
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch(err) => write!(f, "{}", err),
            Self::Provision { reason } => {
                write!(f, "filesystem provisioning failed: {}", reason)
            }
            Self::Instantiation { reason } => {
                write!(f, "module instantiation failed: {}", reason)
            }
            Self::MissingExport { name } => {
                write!(f, "missing required export: '{}'", name)
            }
            Self::WrongExportType { name, expected } => {
                write!(f, "export '{}' has wrong type: expected {}", name, expected)
            }
            Self::OutOfMemory { requested } => {
                write!(f, "module allocator failed for {} bytes", requested)
            }
            Self::MemoryAccessOutOfBounds { address, size } => {
                write!(
                    f,
                    "memory access out of bounds: address {} + size {}",
                    address, size
                )
            }
            Self::Invocation { reason } => {
                write!(f, "compiler invocation trapped: {}", reason)
            }
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<FetchError> for BridgeError {
    fn from(err: FetchError) -> Self {
        Self::Fetch(err)
    }
}

/// One finished compile: exit code plus the captured streams.
///
/// `rc != 0` means the compiler reported diagnostics, not that the bridge
/// failed. Serialized into the worker's success envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOutcome {
    /// Exit code (0 = success)
    pub rc: i32,
    /// Program/compiler output
    pub stdout: String,
    /// Compiler diagnostics
    pub stderr: String,
}

impl CompileOutcome {
    pub fn is_success(&self) -> bool {
        self.rc == 0
    }
}
