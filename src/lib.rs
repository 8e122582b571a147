//! kefir-worker - a sandboxed browser-worker host for the Kefir C compiler
//!
//! The Kefir compiler is built as a WebAssembly module with a C-style
//! `main(argc, argv)` entry point. This crate is the other half of that
//! arrangement: it runs inside a dedicated worker, receives compile jobs from
//! the page, provisions the in-memory filesystem the compiler expects, bridges
//! its byte-level stdio to per-job buffers, marshals arguments into the
//! module's linear memory, invokes the entry point and posts back a
//! `(rc, stdout, stderr)` result.
//!
//! Design principles:
//! - The compiler module is opaque: one entry point, one ABI, no assumptions
//!   about its internals.
//! - Everything fetched over the network (include manifest, module binary) is
//!   fetched exactly once per worker and cached for its lifetime.
//! - All per-job state (stream buffers, filesystem, module instance) is built
//!   fresh per job, so no job can observe another's output or files.
//!
//! The bridge itself is target-independent and fully testable natively against
//! a scripted module engine; only the thin `WebEngine`/`WebFetcher`/worker
//! glue layers touch the browser.

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

pub mod bridge;
pub mod cache;
pub mod fetch;
pub mod vfs;
pub mod worker;

/// Initialize panic hook for better error messages in the worker console
#[cfg(target_arch = "wasm32")]
fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Worker entry point: runs when the WASM module is loaded inside the worker.
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn main() {
    init_panic_hook();
    worker::web::install();
}

/// Console logging helper
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    pub fn log(s: &str);
}

/// Log to the worker console (WASM)
#[cfg(target_arch = "wasm32")]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        $crate::log(&format!($($t)*))
    };
}

/// Log to stderr (native)
#[cfg(not(target_arch = "wasm32"))]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        eprintln!($($t)*)
    };
}
