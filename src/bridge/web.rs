//! Web module engine
//!
//! Instantiates the real compiler module through the browser's WebAssembly
//! API: compiles the cached binary bytes, installs `Closure`-backed hooks in
//! the `env` namespace, and exposes the instance's memory, allocator and
//! entry point behind the [`CompilerModule`] trait.

use super::abi::{self, HookError, OpenFlags, exports, hooks};
use super::error::{BridgeError, BridgeResult};
use super::module::{CompilerModule, ModuleEngine, SharedJob};
use std::cell::RefCell;
use std::rc::Rc;

use js_sys::{Function, Object, Reflect, Uint8Array, WebAssembly};
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;

/// Memory handle filled in after instantiation; the hook closures are built
/// before the instance exists, so they read it through this cell.
type SharedMemory = Rc<RefCell<Option<WebAssembly::Memory>>>;

fn memory_read(memory: &WebAssembly::Memory, offset: u32, len: u32) -> Vec<u8> {
    let buffer = memory.buffer();
    let array = Uint8Array::new(&buffer);
    let mut result = vec![0u8; len as usize];
    for (i, byte) in result.iter_mut().enumerate() {
        *byte = array.get_index(offset + i as u32);
    }
    result
}

fn memory_write(memory: &WebAssembly::Memory, offset: u32, data: &[u8]) {
    let buffer = memory.buffer();
    let array = Uint8Array::new(&buffer);
    for (i, &byte) in data.iter().enumerate() {
        array.set_index(offset + i as u32, byte);
    }
}

fn memory_read_string(memory: &WebAssembly::Memory, ptr: u32, len: u32) -> String {
    String::from_utf8_lossy(&memory_read(memory, ptr, len)).into_owned()
}

fn memory_byte_length(memory: &WebAssembly::Memory) -> u32 {
    let buffer = memory.buffer();
    let array_buffer: js_sys::ArrayBuffer = buffer.unchecked_into();
    array_buffer.byte_length()
}

/// Engine backed by the browser's WebAssembly implementation.
pub struct WebEngine;

impl WebEngine {
    pub fn new() -> Self {
        Self
    }

    async fn compile(&self, bytes: &[u8]) -> BridgeResult<WebAssembly::Module> {
        let array = Uint8Array::new_with_length(bytes.len() as u32);
        array.copy_from(bytes);

        let promise = WebAssembly::compile(&array.buffer());
        let compiled = wasm_bindgen_futures::JsFuture::from(promise)
            .await
            .map_err(|e| BridgeError::Instantiation {
                reason: e
                    .as_string()
                    .unwrap_or_else(|| "compilation failed".to_string()),
            })?;

        compiled
            .dyn_into::<WebAssembly::Module>()
            .map_err(|_| BridgeError::Instantiation {
                reason: "failed to cast to Module".to_string(),
            })
    }

    /// Build the `env` import object wired to this job's state.
    fn build_imports(&self, job: &SharedJob, memory: &SharedMemory) -> BridgeResult<Object> {
        let imports = Object::new();
        let env = Object::new();

        add_hook_read(&env, Rc::clone(job), Rc::clone(memory))?;
        add_hook_write(&env, Rc::clone(job), Rc::clone(memory))?;
        add_hook_open(&env, Rc::clone(job), Rc::clone(memory))?;
        add_hook_close(&env, Rc::clone(job))?;
        add_hook_getenv(&env, Rc::clone(job), Rc::clone(memory))?;
        add_hook_exit(&env, Rc::clone(job))?;

        Reflect::set(&imports, &JsValue::from_str(abi::IMPORT_NAMESPACE), &env).map_err(|_| {
            BridgeError::Instantiation {
                reason: "failed to set env imports".to_string(),
            }
        })?;

        Ok(imports)
    }

    async fn instantiate_compiled(
        &self,
        module: &WebAssembly::Module,
        imports: &Object,
    ) -> BridgeResult<WebAssembly::Instance> {
        let promise = WebAssembly::instantiate_module(module, imports);
        let instance = wasm_bindgen_futures::JsFuture::from(promise)
            .await
            .map_err(|e| BridgeError::Instantiation {
                reason: e
                    .as_string()
                    .unwrap_or_else(|| "instantiation failed".to_string()),
            })?;

        instance
            .dyn_into::<WebAssembly::Instance>()
            .map_err(|_| BridgeError::Instantiation {
                reason: "failed to cast to Instance".to_string(),
            })
    }
}

impl Default for WebEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn export_function(exports_obj: &Object, name: &'static str) -> BridgeResult<Function> {
    let value = Reflect::get(exports_obj, &JsValue::from_str(name))
        .map_err(|_| BridgeError::MissingExport { name })?;
    if value.is_undefined() {
        return Err(BridgeError::MissingExport { name });
    }
    value.dyn_into().map_err(|_| BridgeError::WrongExportType {
        name,
        expected: "Function",
    })
}

impl ModuleEngine for WebEngine {
    type Module = WebModule;

    async fn instantiate(&self, bytes: &[u8], job: SharedJob) -> BridgeResult<WebModule> {
        abi::validate_header(bytes)?;

        let module = self.compile(bytes).await?;

        let memory_cell: SharedMemory = Rc::new(RefCell::new(None));
        let imports = self.build_imports(&job, &memory_cell)?;
        let instance = self.instantiate_compiled(&module, &imports).await?;

        let exports_obj = instance.exports();

        let memory = Reflect::get(&exports_obj, &JsValue::from_str(exports::MEMORY))
            .map_err(|_| BridgeError::MissingExport {
                name: exports::MEMORY,
            })?
            .dyn_into::<WebAssembly::Memory>()
            .map_err(|_| BridgeError::WrongExportType {
                name: exports::MEMORY,
                expected: "Memory",
            })?;

        // The hooks can see memory from here on.
        *memory_cell.borrow_mut() = Some(memory.clone());

        let main = export_function(&exports_obj, exports::MAIN)?;
        let malloc = export_function(&exports_obj, exports::MALLOC)?;
        let free = export_function(&exports_obj, exports::FREE)?;

        Ok(WebModule {
            memory,
            main,
            malloc,
            free,
            job,
        })
    }
}

/// A live compiler instance in the browser.
pub struct WebModule {
    memory: WebAssembly::Memory,
    main: Function,
    malloc: Function,
    free: Function,
    job: SharedJob,
}

impl CompilerModule for WebModule {
    fn memory_size(&self) -> u32 {
        memory_byte_length(&self.memory)
    }

    fn read_memory(&self, addr: u32, len: u32) -> BridgeResult<Vec<u8>> {
        let end = addr.checked_add(len);
        match end {
            Some(end) if end <= self.memory_size() => Ok(memory_read(&self.memory, addr, len)),
            _ => Err(BridgeError::MemoryAccessOutOfBounds {
                address: addr,
                size: len,
            }),
        }
    }

    fn write_memory(&mut self, addr: u32, data: &[u8]) -> BridgeResult<()> {
        let end = addr.checked_add(data.len() as u32);
        match end {
            Some(end) if end <= self.memory_size() => {
                memory_write(&self.memory, addr, data);
                Ok(())
            }
            _ => Err(BridgeError::MemoryAccessOutOfBounds {
                address: addr,
                size: data.len() as u32,
            }),
        }
    }

    fn malloc(&mut self, size: u32) -> BridgeResult<u32> {
        let result = self
            .malloc
            .call1(&JsValue::NULL, &JsValue::from(size.max(1)))
            .map_err(|_| BridgeError::OutOfMemory { requested: size })?;

        let addr = result.as_f64().unwrap_or(0.0) as u32;
        if addr == 0 {
            return Err(BridgeError::OutOfMemory { requested: size });
        }
        Ok(addr)
    }

    fn free(&mut self, addr: u32) {
        let _ = self.free.call1(&JsValue::NULL, &JsValue::from(addr));
    }

    fn invoke_main(&mut self, argc: i32, argv: u32) -> BridgeResult<i32> {
        let result = self
            .main
            .call2(&JsValue::NULL, &JsValue::from(argc), &JsValue::from(argv));

        match result {
            Ok(value) => {
                let rc = value.as_f64().unwrap_or(0.0) as i32;
                Ok(rc)
            }
            Err(e) => {
                // An exit() unwind reaches us as a JS exception; the recorded
                // code distinguishes it from a genuine trap.
                if let Some(code) = self.job.borrow().exit_code() {
                    Ok(code)
                } else {
                    let reason = e
                        .as_string()
                        .unwrap_or_else(|| "unknown trap".to_string());
                    web_sys::console::error_1(
                        &format!("[bridge] compiler trapped: {}", reason).into(),
                    );
                    Err(BridgeError::Invocation { reason })
                }
            }
        }
    }
}

// =============================================================================
// Hook closures
//
// Each closure is installed once per instance and leaked via `forget` - the
// instance, its job state and its hooks all share one job's lifetime, and the
// browser reclaims them together when the instance is collected.
// =============================================================================

fn install(env: &Object, name: &str, function: &JsValue) -> BridgeResult<()> {
    Reflect::set(env, &JsValue::from_str(name), function).map_err(|_| {
        BridgeError::Instantiation {
            reason: format!("failed to set {} import", name),
        }
    })
}

/// read(fd, buf_ptr, len) -> bytes read
fn add_hook_read(env: &Object, job: SharedJob, memory: SharedMemory) -> BridgeResult<()> {
    let closure = Closure::wrap(Box::new(move |fd: i32, buf_ptr: i32, len: i32| -> i32 {
        let mut buf = vec![0u8; len.max(0) as usize];
        let read = job.borrow_mut().sys_read(fd, &mut buf);
        if read > 0 {
            if let Some(ref memory) = *memory.borrow() {
                memory_write(memory, buf_ptr as u32, &buf[..read as usize]);
            }
        }
        read
    }) as Box<dyn Fn(i32, i32, i32) -> i32>);

    install(env, hooks::READ, closure.as_ref())?;
    closure.forget();
    Ok(())
}

/// write(fd, buf_ptr, len) -> bytes written
fn add_hook_write(env: &Object, job: SharedJob, memory: SharedMemory) -> BridgeResult<()> {
    let closure = Closure::wrap(Box::new(move |fd: i32, buf_ptr: i32, len: i32| -> i32 {
        let data = match *memory.borrow() {
            Some(ref memory) => memory_read(memory, buf_ptr as u32, len.max(0) as u32),
            None => return HookError::Generic.code(),
        };
        job.borrow_mut().sys_write(fd, &data)
    }) as Box<dyn Fn(i32, i32, i32) -> i32>);

    install(env, hooks::WRITE, closure.as_ref())?;
    closure.forget();
    Ok(())
}

/// open(path_ptr, path_len, flags) -> fd
fn add_hook_open(env: &Object, job: SharedJob, memory: SharedMemory) -> BridgeResult<()> {
    let closure = Closure::wrap(Box::new(
        move |path_ptr: i32, path_len: i32, flags: i32| -> i32 {
            let path = match *memory.borrow() {
                Some(ref memory) => {
                    memory_read_string(memory, path_ptr as u32, path_len.max(0) as u32)
                }
                None => return HookError::Generic.code(),
            };
            job.borrow_mut().sys_open(&path, OpenFlags(flags))
        },
    ) as Box<dyn Fn(i32, i32, i32) -> i32>);

    install(env, hooks::OPEN, closure.as_ref())?;
    closure.forget();
    Ok(())
}

/// close(fd) -> 0 or error
fn add_hook_close(env: &Object, job: SharedJob) -> BridgeResult<()> {
    let closure = Closure::wrap(
        Box::new(move |fd: i32| -> i32 { job.borrow_mut().sys_close(fd) })
            as Box<dyn Fn(i32) -> i32>,
    );

    install(env, hooks::CLOSE, closure.as_ref())?;
    closure.forget();
    Ok(())
}

/// getenv(name_ptr, name_len, buf_ptr, buf_len) -> length written, 0 = unset
fn add_hook_getenv(env: &Object, job: SharedJob, memory: SharedMemory) -> BridgeResult<()> {
    let closure = Closure::wrap(Box::new(
        move |name_ptr: i32, name_len: i32, buf_ptr: i32, buf_len: i32| -> i32 {
            let memory_ref = memory.borrow();
            let Some(ref memory) = *memory_ref else {
                return HookError::Generic.code();
            };

            let name = memory_read_string(memory, name_ptr as u32, name_len.max(0) as u32);
            let state = job.borrow();
            match state.sys_getenv(&name) {
                Some(value) => {
                    let bytes = value.as_bytes();
                    let write_len = bytes.len().min(buf_len.max(0) as usize);
                    memory_write(memory, buf_ptr as u32, &bytes[..write_len]);
                    write_len as i32
                }
                None => 0,
            }
        },
    ) as Box<dyn Fn(i32, i32, i32, i32) -> i32>);

    install(env, hooks::GETENV, closure.as_ref())?;
    closure.forget();
    Ok(())
}

/// exit(code)
fn add_hook_exit(env: &Object, job: SharedJob) -> BridgeResult<()> {
    let closure = Closure::wrap(Box::new(move |code: i32| {
        job.borrow_mut().sys_exit(code);
    }) as Box<dyn Fn(i32)>);

    install(env, hooks::EXIT, closure.as_ref())?;
    closure.forget();
    Ok(())
}
