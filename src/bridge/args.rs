//! Argument marshaller
//!
//! Copies the effective argument list into the module's linear memory: one
//! NUL-terminated allocation per string plus a pointer table of little-endian
//! addresses. The allocations live on the module's private heap, so the
//! release step is tied to a guard - dropping [`MarshalledArgs`] frees every
//! string and the table on every exit path, success or failure.

use super::abi::POINTER_WIDTH;
use super::error::BridgeResult;
use super::module::CompilerModule;
use std::cell::RefCell;
use std::rc::Rc;

/// Arguments resident in module memory, released on drop.
pub struct MarshalledArgs<M: CompilerModule> {
    module: Rc<RefCell<M>>,
    /// One allocation per argument string, in argument order
    strings: Vec<u32>,
    /// The pointer table allocation
    table: u32,
}

impl<M: CompilerModule> MarshalledArgs<M> {
    /// Copy `args` into the module. On failure every allocation made so far
    /// is freed before the error propagates.
    pub fn copy_into(module: &Rc<RefCell<M>>, args: &[String]) -> BridgeResult<Self> {
        let mut strings = Vec::with_capacity(args.len());

        let result = {
            let mut m = module.borrow_mut();
            let mut build = || -> BridgeResult<u32> {
                for arg in args {
                    let bytes = arg.as_bytes();
                    let addr = m.malloc(bytes.len() as u32 + 1)?;
                    strings.push(addr);
                    m.write_memory(addr, bytes)?;
                    m.write_memory(addr + bytes.len() as u32, &[0])?;
                }

                let table = m.malloc(args.len() as u32 * POINTER_WIDTH)?;
                let mut packed = Vec::with_capacity(strings.len() * POINTER_WIDTH as usize);
                for addr in &strings {
                    packed.extend_from_slice(&addr.to_le_bytes());
                }
                m.write_memory(table, &packed)?;
                Ok(table)
            };
            build()
        };

        match result {
            Ok(table) => Ok(Self {
                module: Rc::clone(module),
                strings,
                table,
            }),
            Err(err) => {
                let mut m = module.borrow_mut();
                for addr in strings {
                    m.free(addr);
                }
                Err(err)
            }
        }
    }

    /// Argument count for the entry point.
    pub fn argc(&self) -> i32 {
        self.strings.len() as i32
    }

    /// Pointer table address for the entry point.
    pub fn argv(&self) -> u32 {
        self.table
    }
}

impl<M: CompilerModule> Drop for MarshalledArgs<M> {
    fn drop(&mut self) {
        let mut m = self.module.borrow_mut();
        for addr in self.strings.drain(..) {
            m.free(addr);
        }
        m.free(self.table);
    }
}
