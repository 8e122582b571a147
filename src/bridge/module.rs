//! Opaque foreign call boundary
//!
//! The compiler is a capability: something that can be instantiated from
//! bytes with a job's hooks attached, poked through its linear memory and
//! allocator, and invoked through one fixed entry point. The bridge never
//! looks past this interface, which keeps it testable against a scripted
//! stand-in that records calls and plays back configured behavior.

use super::error::{BridgeError, BridgeResult};
use super::job::JobState;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Per-job state shared between the bridge and the module's hooks.
pub type SharedJob = Rc<RefCell<JobState>>;

/// An instantiated compiler module.
pub trait CompilerModule {
    /// Linear memory size in bytes.
    fn memory_size(&self) -> u32;

    /// Read bytes out of module memory.
    fn read_memory(&self, addr: u32, len: u32) -> BridgeResult<Vec<u8>>;

    /// Write bytes into module memory.
    fn write_memory(&mut self, addr: u32, data: &[u8]) -> BridgeResult<()>;

    /// Allocate on the module's private heap (exported `malloc`).
    fn malloc(&mut self, size: u32) -> BridgeResult<u32>;

    /// Release a `malloc` allocation (exported `free`).
    fn free(&mut self, addr: u32);

    /// Call the entry point. Synchronous from the module's perspective;
    /// returns the compiler's exit code.
    fn invoke_main(&mut self, argc: i32, argv: u32) -> BridgeResult<i32>;
}

/// Instantiates compiler modules from cached binary bytes.
pub trait ModuleEngine {
    type Module: CompilerModule;

    /// Compile `bytes` and instantiate with the job's hooks installed.
    fn instantiate(
        &self,
        bytes: &[u8],
        job: SharedJob,
    ) -> impl Future<Output = BridgeResult<Self::Module>>;
}

// =============================================================================
// Scripted engine - the native stand-in for the real module
// =============================================================================

/// What a scripted module does when its entry point runs. Receives the argv
/// the module decoded from its own memory and the job state behind the hooks.
pub type ModuleScript = Box<dyn FnMut(&[String], &mut JobState) -> i32>;

/// Allocator accounting shared across every module the engine instantiates.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AllocStats {
    pub malloc_calls: u64,
    pub free_calls: u64,
    pub live_allocations: u64,
    pub live_bytes: u64,
}

/// Engine returning [`ScriptedModule`]s. Records instantiation count, the
/// last argv decoded by a module, and allocator traffic, so tests can pin
/// down exactly what the bridge did.
pub struct ScriptedEngine {
    script: Rc<dyn Fn() -> ModuleScript>,
    instantiations: Rc<RefCell<u32>>,
    last_argv: Rc<RefCell<Vec<String>>>,
    stats: Rc<RefCell<AllocStats>>,
}

impl ScriptedEngine {
    /// Engine whose modules run `script` as their entry point.
    pub fn new(script: impl Fn() -> ModuleScript + 'static) -> Self {
        Self {
            script: Rc::new(script),
            instantiations: Rc::new(RefCell::new(0)),
            last_argv: Rc::new(RefCell::new(Vec::new())),
            stats: Rc::new(RefCell::new(AllocStats::default())),
        }
    }

    /// Engine whose modules immediately return `rc`.
    pub fn returning(rc: i32) -> Self {
        Self::new(move || Box::new(move |_args, _state| rc))
    }

    /// How many modules have been instantiated.
    pub fn instantiations(&self) -> u32 {
        *self.instantiations.borrow()
    }

    /// The argv decoded by the most recent entry-point call.
    pub fn last_argv(&self) -> Vec<String> {
        self.last_argv.borrow().clone()
    }

    /// Allocator accounting across all instantiated modules.
    pub fn alloc_stats(&self) -> AllocStats {
        self.stats.borrow().clone()
    }
}

impl ModuleEngine for ScriptedEngine {
    type Module = ScriptedModule;

    async fn instantiate(&self, bytes: &[u8], job: SharedJob) -> BridgeResult<ScriptedModule> {
        super::abi::validate_header(bytes)?;
        *self.instantiations.borrow_mut() += 1;
        Ok(ScriptedModule::new(
            job,
            (self.script)(),
            Rc::clone(&self.last_argv),
            Rc::clone(&self.stats),
        ))
    }
}

/// Scripted module: a flat `Vec<u8>` memory, a bump allocator with live
/// accounting, and an entry point that decodes argv the way the real module
/// would before handing control to the script.
pub struct ScriptedModule {
    memory: Vec<u8>,
    /// Bump pointer; address 0 stays unused so 0 can mean "allocation failed"
    brk: u32,
    /// Live allocations: address -> size
    live: HashMap<u32, u32>,
    job: SharedJob,
    script: ModuleScript,
    recorded_argv: Rc<RefCell<Vec<String>>>,
    stats: Rc<RefCell<AllocStats>>,
}

impl ScriptedModule {
    /// Default memory size: 16 pages (1 MiB)
    const MEMORY_SIZE: usize = 16 * 65536;

    fn new(
        job: SharedJob,
        script: ModuleScript,
        recorded_argv: Rc<RefCell<Vec<String>>>,
        stats: Rc<RefCell<AllocStats>>,
    ) -> Self {
        Self {
            memory: vec![0; Self::MEMORY_SIZE],
            brk: 8,
            live: HashMap::new(),
            job,
            script,
            recorded_argv,
            stats,
        }
    }

    /// Live allocation count for this instance.
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    /// Bytes currently allocated in this instance.
    pub fn live_bytes(&self) -> u64 {
        self.live.values().map(|&s| s as u64).sum()
    }

    fn check_bounds(&self, addr: u32, len: u32) -> BridgeResult<()> {
        let end = addr.checked_add(len);
        match end {
            Some(end) if end as usize <= self.memory.len() => Ok(()),
            _ => Err(BridgeError::MemoryAccessOutOfBounds {
                address: addr,
                size: len,
            }),
        }
    }

    /// Read a NUL-terminated string out of memory.
    fn read_cstring(&self, addr: u32) -> BridgeResult<String> {
        let start = addr as usize;
        if start >= self.memory.len() {
            return Err(BridgeError::MemoryAccessOutOfBounds {
                address: addr,
                size: 1,
            });
        }
        let end = self.memory[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .unwrap_or(self.memory.len());
        Ok(String::from_utf8_lossy(&self.memory[start..end]).into_owned())
    }

    /// Decode the argv pointer table the marshaller wrote.
    fn decode_argv(&self, argc: i32, argv: u32) -> BridgeResult<Vec<String>> {
        let mut args = Vec::with_capacity(argc.max(0) as usize);
        for i in 0..argc.max(0) as u32 {
            let slot = argv + i * super::abi::POINTER_WIDTH;
            let bytes = self.read_memory(slot, super::abi::POINTER_WIDTH)?;
            let ptr = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            args.push(self.read_cstring(ptr)?);
        }
        Ok(args)
    }
}

impl CompilerModule for ScriptedModule {
    fn memory_size(&self) -> u32 {
        self.memory.len() as u32
    }

    fn read_memory(&self, addr: u32, len: u32) -> BridgeResult<Vec<u8>> {
        self.check_bounds(addr, len)?;
        let start = addr as usize;
        Ok(self.memory[start..start + len as usize].to_vec())
    }

    fn write_memory(&mut self, addr: u32, data: &[u8]) -> BridgeResult<()> {
        self.check_bounds(addr, data.len() as u32)?;
        let start = addr as usize;
        self.memory[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn malloc(&mut self, size: u32) -> BridgeResult<u32> {
        // Bump allocation, 8-byte aligned. Freed blocks are not recycled;
        // the accounting is what matters for a single invocation.
        let aligned = size.max(1).div_ceil(8) * 8;
        let addr = self.brk;
        let end = addr
            .checked_add(aligned)
            .ok_or(BridgeError::OutOfMemory { requested: size })?;
        if end as usize > self.memory.len() {
            return Err(BridgeError::OutOfMemory { requested: size });
        }
        self.brk = end;
        self.live.insert(addr, size);

        let mut stats = self.stats.borrow_mut();
        stats.malloc_calls += 1;
        stats.live_allocations += 1;
        stats.live_bytes += size as u64;
        Ok(addr)
    }

    fn free(&mut self, addr: u32) {
        if let Some(size) = self.live.remove(&addr) {
            let mut stats = self.stats.borrow_mut();
            stats.free_calls += 1;
            stats.live_allocations -= 1;
            stats.live_bytes -= size as u64;
        }
    }

    fn invoke_main(&mut self, argc: i32, argv: u32) -> BridgeResult<i32> {
        let args = self.decode_argv(argc, argv)?;
        *self.recorded_argv.borrow_mut() = args.clone();

        let job = Rc::clone(&self.job);
        let mut state = job.borrow_mut();
        let rc = (self.script)(&args, &mut state);
        Ok(rc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::abi::{WASM_MAGIC, WASM_VERSION};
    use crate::vfs::MemoryFs;
    use futures::executor::block_on;
    use std::collections::HashMap as Env;

    fn fake_binary() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&WASM_MAGIC);
        bytes.extend_from_slice(&WASM_VERSION);
        bytes
    }

    fn fresh_job() -> SharedJob {
        Rc::new(RefCell::new(JobState::new(
            "",
            MemoryFs::new(),
            Env::new(),
        )))
    }

    #[test]
    fn test_instantiate_validates_header() {
        let engine = ScriptedEngine::returning(0);
        let err = block_on(engine.instantiate(b"not wasm", fresh_job()));
        assert!(err.is_err());
        assert_eq!(engine.instantiations(), 0);
    }

    #[test]
    fn test_bump_allocator_accounting() {
        let engine = ScriptedEngine::returning(0);
        let mut module = block_on(engine.instantiate(&fake_binary(), fresh_job())).unwrap();

        let a = module.malloc(5).unwrap();
        let b = module.malloc(16).unwrap();
        assert_ne!(a, b);
        assert_eq!(module.live_allocations(), 2);
        assert_eq!(module.live_bytes(), 21);

        module.free(a);
        assert_eq!(module.live_allocations(), 1);
        assert_eq!(module.live_bytes(), 16);

        module.free(b);
        assert_eq!(module.live_bytes(), 0);

        let stats = engine.alloc_stats();
        assert_eq!(stats.malloc_calls, 2);
        assert_eq!(stats.free_calls, 2);
        assert_eq!(stats.live_bytes, 0);
    }

    #[test]
    fn test_invoke_decodes_argv_from_memory() {
        let engine = ScriptedEngine::returning(42);
        let mut module = block_on(engine.instantiate(&fake_binary(), fresh_job())).unwrap();

        // Lay out two NUL-terminated strings and a pointer table by hand.
        let s0 = module.malloc(6).unwrap();
        module.write_memory(s0, b"kefir\0").unwrap();
        let s1 = module.malloc(3).unwrap();
        module.write_memory(s1, b"-c\0").unwrap();
        let table = module.malloc(8).unwrap();
        let mut packed = Vec::new();
        packed.extend_from_slice(&s0.to_le_bytes());
        packed.extend_from_slice(&s1.to_le_bytes());
        module.write_memory(table, &packed).unwrap();

        let rc = module.invoke_main(2, table).unwrap();
        assert_eq!(rc, 42);
        assert_eq!(engine.last_argv(), vec!["kefir", "-c"]);
    }

    #[test]
    fn test_script_sees_job_state() {
        let engine = ScriptedEngine::new(|| {
            Box::new(|_args, state| {
                while let Some(byte) = state.streams.pull_stdin() {
                    state.streams.push_stdout(byte);
                }
                0
            })
        });

        let job = Rc::new(RefCell::new(JobState::new(
            "echo me",
            MemoryFs::new(),
            Env::new(),
        )));
        let mut module = block_on(engine.instantiate(&fake_binary(), Rc::clone(&job))).unwrap();
        module.invoke_main(0, 0).unwrap();

        let (stdout, _) = job.borrow_mut().take_output();
        assert_eq!(stdout, "echo me");
    }

    #[test]
    fn test_out_of_bounds_read() {
        let engine = ScriptedEngine::returning(0);
        let module = block_on(engine.instantiate(&fake_binary(), fresh_job())).unwrap();
        assert!(module.read_memory(module.memory_size() - 2, 8).is_err());
    }
}
