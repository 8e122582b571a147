//! Compiler Module Bridge
//!
//! This module hosts the sandboxed Kefir compiler: an opaque WebAssembly
//! module with a C-style entry point, no native string or stream types, and
//! a manually-managed linear memory. The bridge's job is to make one compile
//! request look, from inside that module, like an ordinary command-line
//! invocation - and to make the module's output look, from outside, like a
//! structured result.
//!
//! # Host ABI v1
//!
//! ## Required Exports
//!
//! The compiler module MUST export:
//!
//! | Export    | Type                             | Description                     |
//! |-----------|----------------------------------|---------------------------------|
//! | `memory`  | Memory                           | Linear memory for data exchange |
//! | `main`    | `(argc: i32, argv: i32) -> i32`  | Entry point, returns exit code  |
//! | `malloc`  | `(size: i32) -> i32`             | Module-heap allocator           |
//! | `free`    | `(ptr: i32)`                     | Releases a `malloc` allocation  |
//!
//! ## Host Imports
//!
//! The bridge provides these hooks in the `env` namespace:
//!
//! ```text
//! read(fd: i32, buf_ptr: i32, len: i32) -> i32
//!   fd 0 pulls bytes of the job's source text; other fds read VFS files.
//!   Returns bytes read, 0 = end of data.
//!
//! write(fd: i32, buf_ptr: i32, len: i32) -> i32
//!   fd 1 appends to the job's stdout buffer, fd 2 to stderr; other fds
//!   write VFS files. Returns bytes written, < 0 = error.
//!
//! open(path_ptr: i32, path_len: i32, flags: i32) -> i32
//!   Opens a VFS file (materializing lazily-backed include files).
//!   Flags: 0 = read, 1 = write, 2 = read+write, 4 = create, 8 = truncate.
//!   Returns fd >= 3 on success, < 0 on error.
//!
//! close(fd: i32) -> i32
//!
//! getenv(name_ptr: i32, name_len: i32, buf_ptr: i32, buf_len: i32) -> i32
//!   Looks up the fixed compiler environment (header locations).
//!   Returns length written, 0 = not found.
//!
//! exit(code: i32)
//!   Records the exit code; the module is expected to unwind to main.
//! ```
//!
//! ## Argument Passing
//!
//! Arguments are marshalled by the host before `main` is called: each string
//! is copied into module memory as NUL-terminated bytes via `malloc`, then a
//! pointer table of little-endian `u32` addresses (one per argument, in
//! order) is written to a separate allocation. `main` receives the argument
//! count and the table's address. Every allocation is released after the
//! call returns, on success and failure alike.
//!
//! ## Lifecycle
//!
//! ```text
//! job received -> caches ensured -> VFS provisioned -> module instantiated
//!     -> args marshalled -> main(argc, argv) -> rc + captured streams
//! ```
//!
//! The module binary is compiled from cached bytes; the instance, its heap
//! and its filesystem live exactly as long as one job.

pub mod abi;
pub mod args;
pub mod error;
pub mod job;
pub mod module;
pub mod runner;
pub mod streams;

#[cfg(target_arch = "wasm32")]
pub mod web;

pub use abi::*;
pub use args::*;
pub use error::*;
pub use job::*;
pub use module::*;
pub use runner::*;
pub use streams::*;
