//! Per-job runtime state
//!
//! Everything one compiler invocation can touch: its stream bridge, its
//! private filesystem, the fixed environment and a file descriptor table.
//! Built fresh per job and discarded with it. The `sys_*` methods are the
//! host side of the hooks the module imports.

use super::abi::{HookError, OpenFlags, fd};
use super::streams::StreamBridge;
use crate::vfs::{FileHandle, FileSystem, MemoryFs, OpenOptions};
use std::collections::HashMap;

/// Maximum number of open file descriptors per job
const MAX_FDS: usize = 64;

/// What a descriptor slot points at
enum FdSlot {
    /// One of the three preopened standard streams
    Stream,
    /// An open VFS file
    Vfs(FileHandle),
}

/// File descriptor table with stdin/stdout/stderr preopened.
struct FdTable {
    entries: Vec<Option<FdSlot>>,
}

impl FdTable {
    fn new() -> Self {
        Self {
            entries: vec![
                Some(FdSlot::Stream),
                Some(FdSlot::Stream),
                Some(FdSlot::Stream),
            ],
        }
    }

    fn vfs_handle(&self, fd_num: i32) -> Option<FileHandle> {
        if fd_num < 0 {
            return None;
        }
        match self.entries.get(fd_num as usize)? {
            Some(FdSlot::Vfs(handle)) => Some(*handle),
            _ => None,
        }
    }

    fn allocate(&mut self, handle: FileHandle) -> Result<i32, HookError> {
        for (i, entry) in self.entries.iter_mut().enumerate().skip(3) {
            if entry.is_none() {
                *entry = Some(FdSlot::Vfs(handle));
                return Ok(i as i32);
            }
        }

        if self.entries.len() < MAX_FDS {
            let fd_num = self.entries.len() as i32;
            self.entries.push(Some(FdSlot::Vfs(handle)));
            return Ok(fd_num);
        }

        Err(HookError::TooManyOpenFiles)
    }

    fn close(&mut self, fd_num: i32) -> Result<FileHandle, HookError> {
        // Standard streams cannot be closed
        if fd_num < 3 {
            return Err(HookError::BadFd);
        }
        let slot = self
            .entries
            .get_mut(fd_num as usize)
            .ok_or(HookError::BadFd)?;
        match slot.take() {
            Some(FdSlot::Vfs(handle)) => Ok(handle),
            other => {
                *slot = other;
                Err(HookError::BadFd)
            }
        }
    }
}

/// The state one compiler invocation runs against.
pub struct JobState {
    /// Byte-level stdio bridge
    pub streams: StreamBridge,
    /// The job's private filesystem
    pub fs: MemoryFs,
    /// Fixed environment (header locations)
    env: HashMap<String, String>,
    /// Open descriptors
    fds: FdTable,
    /// Exit code recorded via the `exit` hook
    exit_code: Option<i32>,
}

impl JobState {
    pub fn new(source: &str, fs: MemoryFs, env: HashMap<String, String>) -> Self {
        Self {
            streams: StreamBridge::new(source),
            fs,
            env,
            fds: FdTable::new(),
            exit_code: None,
        }
    }

    /// Exit code recorded by the module, if any.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Take the captured streams, leaving empty buffers behind.
    pub fn take_output(&mut self) -> (String, String) {
        std::mem::take(&mut self.streams).into_output()
    }

    // =========================================================================
    // Hook implementations
    // =========================================================================

    /// read(fd, buf) -> bytes read, 0 = end of data
    pub fn sys_read(&mut self, fd_num: i32, buf: &mut [u8]) -> i32 {
        match fd_num {
            n if n == fd::STDIN => {
                let mut filled = 0;
                while filled < buf.len() {
                    match self.streams.pull_stdin() {
                        Some(byte) => {
                            buf[filled] = byte;
                            filled += 1;
                        }
                        None => break,
                    }
                }
                filled as i32
            }
            n if n == fd::STDOUT || n == fd::STDERR => HookError::InvalidArgument.code(),
            n => match self.fds.vfs_handle(n) {
                Some(handle) => match self.fs.read(handle, buf) {
                    Ok(read) => read as i32,
                    Err(_) => HookError::Generic.code(),
                },
                None => HookError::BadFd.code(),
            },
        }
    }

    /// write(fd, data) -> bytes written
    pub fn sys_write(&mut self, fd_num: i32, data: &[u8]) -> i32 {
        match fd_num {
            n if n == fd::STDOUT => {
                for &byte in data {
                    self.streams.push_stdout(byte);
                }
                data.len() as i32
            }
            n if n == fd::STDERR => {
                for &byte in data {
                    self.streams.push_stderr(byte);
                }
                data.len() as i32
            }
            n if n == fd::STDIN => HookError::InvalidArgument.code(),
            n => match self.fds.vfs_handle(n) {
                Some(handle) => match self.fs.write(handle, data) {
                    Ok(written) => written as i32,
                    Err(_) => HookError::Generic.code(),
                },
                None => HookError::BadFd.code(),
            },
        }
    }

    /// open(path, flags) -> fd. First open of a lazily-backed include file
    /// pulls its bytes from the backing resource.
    pub fn sys_open(&mut self, path: &str, flags: OpenFlags) -> i32 {
        let options = OpenOptions::new()
            .read(flags.is_read())
            .write(flags.is_write())
            .create(flags.is_create())
            .truncate(flags.is_truncate());

        match self.fs.open(path, options) {
            Ok(handle) => match self.fds.allocate(handle) {
                Ok(fd_num) => fd_num,
                Err(err) => {
                    let _ = self.fs.close(handle);
                    err.code()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HookError::NotFound.code(),
            Err(_) => HookError::Generic.code(),
        }
    }

    /// close(fd) -> 0 or error
    pub fn sys_close(&mut self, fd_num: i32) -> i32 {
        match self.fds.close(fd_num) {
            Ok(handle) => match self.fs.close(handle) {
                Ok(()) => 0,
                Err(_) => HookError::Generic.code(),
            },
            Err(err) => err.code(),
        }
    }

    /// getenv(name) -> value, if set
    pub fn sys_getenv(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    /// exit(code) - records the code; the module unwinds to main
    pub fn sys_exit(&mut self, code: i32) {
        self.exit_code = Some(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::provision::compiler_env;

    fn state_with_source(source: &str) -> JobState {
        JobState::new(source, MemoryFs::new(), compiler_env())
    }

    #[test]
    fn test_sys_read_stdin_then_eof() {
        let mut state = state_with_source("int main;");
        let mut buf = [0u8; 4];
        assert_eq!(state.sys_read(fd::STDIN, &mut buf), 4);
        assert_eq!(&buf, b"int ");

        let mut rest = [0u8; 16];
        assert_eq!(state.sys_read(fd::STDIN, &mut rest), 5);

        // End of data, deterministically.
        assert_eq!(state.sys_read(fd::STDIN, &mut rest), 0);
        assert_eq!(state.sys_read(fd::STDIN, &mut rest), 0);
    }

    #[test]
    fn test_sys_write_routes_by_fd() {
        let mut state = state_with_source("");
        assert_eq!(state.sys_write(fd::STDOUT, b"hello"), 5);
        assert_eq!(state.sys_write(fd::STDERR, b"oops"), 4);
        assert!(state.sys_write(fd::STDIN, b"x") < 0);

        let (stdout, stderr) = state.take_output();
        assert_eq!(stdout, "hello");
        assert_eq!(stderr, "oops");
    }

    #[test]
    fn test_sys_open_missing_file() {
        let mut state = state_with_source("");
        assert_eq!(
            state.sys_open("/includes/nope.h", OpenFlags::READ),
            HookError::NotFound.code()
        );
    }

    #[test]
    fn test_sys_open_write_read_roundtrip() {
        let mut state = state_with_source("");
        let flags = OpenFlags(OpenFlags::WRITE.0 | OpenFlags::CREATE.0);
        let fd_num = state.sys_open("/out.s", flags);
        assert!(fd_num >= 3);
        assert_eq!(state.sys_write(fd_num, b"ret"), 3);
        assert_eq!(state.sys_close(fd_num), 0);

        let fd_num = state.sys_open("/out.s", OpenFlags::READ);
        let mut buf = [0u8; 3];
        assert_eq!(state.sys_read(fd_num, &mut buf), 3);
        assert_eq!(&buf, b"ret");
        assert_eq!(state.sys_close(fd_num), 0);

        // Double close fails
        assert!(state.sys_close(fd_num) < 0);
    }

    #[test]
    fn test_sys_close_std_streams_rejected() {
        let mut state = state_with_source("");
        assert!(state.sys_close(fd::STDOUT) < 0);
    }

    #[test]
    fn test_sys_getenv_fixed_pairs() {
        let state = state_with_source("");
        assert_eq!(state.sys_getenv("KEFIR_RTINC"), Some("/includes/kefir"));
        assert_eq!(
            state.sys_getenv("KEFIR_MUSL_INCLUDE"),
            Some("/includes/musl")
        );
        assert_eq!(state.sys_getenv("PATH"), None);
    }

    #[test]
    fn test_sys_exit_records_code() {
        let mut state = state_with_source("");
        assert_eq!(state.exit_code(), None);
        state.sys_exit(3);
        assert_eq!(state.exit_code(), Some(3));
    }
}
