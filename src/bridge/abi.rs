//! Host ABI types and constants
//!
//! The stable interface between the bridge and the compiler module.

/// ABI version number
pub const ABI_VERSION: u32 = 1;

/// Required export names
pub mod exports {
    /// The linear memory export name
    pub const MEMORY: &str = "memory";
    /// The compiler's entry point
    pub const MAIN: &str = "main";
    /// The module-heap allocator
    pub const MALLOC: &str = "malloc";
    /// Releases a `malloc` allocation
    pub const FREE: &str = "free";
}

/// Import module namespace
pub const IMPORT_NAMESPACE: &str = "env";

/// Hook function names (imported by the compiler module)
pub mod hooks {
    pub const READ: &str = "read";
    pub const WRITE: &str = "write";
    pub const OPEN: &str = "open";
    pub const CLOSE: &str = "close";
    pub const GETENV: &str = "getenv";
    pub const EXIT: &str = "exit";
}

/// Standard file descriptors
pub mod fd {
    pub const STDIN: i32 = 0;
    pub const STDOUT: i32 = 1;
    pub const STDERR: i32 = 2;
}

/// Width of a pointer in the module's 32-bit address space
pub const POINTER_WIDTH: u32 = 4;

/// Open flags for the `open` hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub i32);

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags(0);
    pub const WRITE: OpenFlags = OpenFlags(1);
    pub const READ_WRITE: OpenFlags = OpenFlags(2);
    pub const CREATE: OpenFlags = OpenFlags(4);
    pub const TRUNCATE: OpenFlags = OpenFlags(8);

    pub fn is_read(&self) -> bool {
        self.0 & 3 == 0 || (self.0 & 2) != 0
    }

    pub fn is_write(&self) -> bool {
        (self.0 & 1) != 0 || (self.0 & 2) != 0
    }

    pub fn is_create(&self) -> bool {
        (self.0 & 4) != 0
    }

    pub fn is_truncate(&self) -> bool {
        (self.0 & 8) != 0
    }
}

/// Error codes returned through the hook boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum HookError {
    /// Generic/unknown error
    Generic = -1,
    /// File not found
    NotFound = -2,
    /// Invalid argument
    InvalidArgument = -3,
    /// Invalid file descriptor
    BadFd = -4,
    /// Maximum open files exceeded
    TooManyOpenFiles = -5,
}

impl HookError {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::Generic),
            -2 => Some(Self::NotFound),
            -3 => Some(Self::InvalidArgument),
            -4 => Some(Self::BadFd),
            -5 => Some(Self::TooManyOpenFiles),
            _ => None,
        }
    }
}

/// WASM magic number: \0asm
pub const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];

/// WASM version 1
pub const WASM_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// Sanity-check a module binary's header before handing it to the engine.
pub fn validate_header(bytes: &[u8]) -> Result<(), super::error::BridgeError> {
    use super::error::BridgeError;

    if bytes.len() < 8 {
        return Err(BridgeError::Instantiation {
            reason: "module too small".to_string(),
        });
    }
    if bytes[0..4] != WASM_MAGIC {
        return Err(BridgeError::Instantiation {
            reason: "invalid magic number".to_string(),
        });
    }
    if bytes[4..8] != WASM_VERSION {
        return Err(BridgeError::Instantiation {
            reason: "unsupported WASM version".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags() {
        assert!(OpenFlags::READ.is_read());
        assert!(!OpenFlags::READ.is_write());

        assert!(OpenFlags::WRITE.is_write());
        assert!(!OpenFlags::WRITE.is_read());

        assert!(OpenFlags::READ_WRITE.is_read());
        assert!(OpenFlags::READ_WRITE.is_write());

        let create_write = OpenFlags(OpenFlags::WRITE.0 | OpenFlags::CREATE.0);
        assert!(create_write.is_write());
        assert!(create_write.is_create());
    }

    #[test]
    fn test_hook_error_codes() {
        assert_eq!(HookError::NotFound.code(), -2);
        assert_eq!(HookError::from_code(-2), Some(HookError::NotFound));
        assert_eq!(HookError::from_code(-999), None);
    }

    #[test]
    fn test_validate_header() {
        let valid = [0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];
        assert!(validate_header(&valid).is_ok());

        assert!(validate_header(&[0x00, 0x61]).is_err());

        let bad_magic = [0xFF, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];
        assert!(validate_header(&bad_magic).is_err());
    }
}
