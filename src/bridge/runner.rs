//! Invocation runner
//!
//! The per-job pipeline: ensure the caches, provision a fresh filesystem,
//! instantiate the module from the cached bytes, marshal the effective
//! arguments, call the entry point and collect `(rc, stdout, stderr)`.
//!
//! A fresh module instance is built per job. Costlier than reusing one, but
//! the module's heap and filesystem die with the job, so nothing can leak
//! into the next invocation and provisioning never collides with leftover
//! directories.

use super::args::MarshalledArgs;
use super::error::{BridgeError, BridgeResult, CompileOutcome};
use super::job::JobState;
use super::module::{CompilerModule, ModuleEngine};
use crate::cache::WorkerCaches;
use crate::fetch::ResourceFetcher;
use crate::vfs::memory::LazyLoader;
use crate::vfs::{MemoryFs, compiler_env, provision_includes};
use std::cell::RefCell;
use std::rc::Rc;

/// The name the compiler sees as argv[0].
pub const INVOCATION_NAME: &str = "kefir";

/// Fixed flags every job inherits: the target triple and the auxiliary
/// include path. User flags follow, so the compiler's own later-wins parsing
/// lets jobs override the overridable parts.
pub const FIXED_FLAGS: &[&str] = &["--target", "x86_64-linux-musl", "-I", "/includes/extra"];

/// Prefix the fixed invocation defaults onto a job's argument list.
pub fn effective_args(user_args: &[String]) -> Vec<String> {
    let mut args = Vec::with_capacity(1 + FIXED_FLAGS.len() + user_args.len());
    args.push(INVOCATION_NAME.to_string());
    args.extend(FIXED_FLAGS.iter().map(|s| s.to_string()));
    args.extend(user_args.iter().cloned());
    args
}

/// Long-lived host for compiler invocations: one per worker, shared by every
/// job, owning the process-wide caches.
pub struct CompilerHost<E, F> {
    engine: E,
    fetcher: Rc<F>,
    caches: WorkerCaches,
}

impl<E, F> CompilerHost<E, F>
where
    E: ModuleEngine,
    F: ResourceFetcher + 'static,
{
    pub fn new(engine: E, fetcher: F) -> Self {
        Self {
            engine,
            fetcher: Rc::new(fetcher),
            caches: WorkerCaches::new(),
        }
    }

    pub fn caches(&self) -> &WorkerCaches {
        &self.caches
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Run one compile job to completion.
    ///
    /// Suspends at most three times: the manifest fetch, the binary fetch
    /// (both first-job-only once the caches are warm) and module
    /// instantiation. The entry point itself runs synchronously.
    pub async fn run_job(&self, user_args: &[String], source: &str) -> BridgeResult<CompileOutcome> {
        let manifest = self.caches.manifest(&self.fetcher).await?;
        let binary = self.caches.module_binary(&self.fetcher).await?;

        // Fresh filesystem, provisioned from the manifest with lazy entries.
        let mut fs = MemoryFs::new();
        let fetcher = Rc::clone(&self.fetcher);
        let loader: LazyLoader = Rc::new(move |resource| fetcher.fetch_bytes_blocking(resource));
        provision_includes(&mut fs, &manifest, loader).map_err(|err| BridgeError::Provision {
            reason: err.to_string(),
        })?;

        let job = Rc::new(RefCell::new(JobState::new(source, fs, compiler_env())));

        let module = self.engine.instantiate(&binary, Rc::clone(&job)).await?;
        let module = Rc::new(RefCell::new(module));

        let args = effective_args(user_args);
        let marshalled = MarshalledArgs::copy_into(&module, &args)?;
        let rc = module
            .borrow_mut()
            .invoke_main(marshalled.argc(), marshalled.argv())?;
        drop(marshalled);

        // An exit() recorded inside the module wins over the returned value.
        let rc = job.borrow().exit_code().unwrap_or(rc);
        let (stdout, stderr) = job.borrow_mut().take_output();

        Ok(CompileOutcome { rc, stdout, stderr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_effective_args_exact_order() {
        let effective = effective_args(&args(&["-c"]));
        assert_eq!(
            effective,
            args(&[
                "kefir",
                "--target",
                "x86_64-linux-musl",
                "-I",
                "/includes/extra",
                "-c",
            ])
        );
    }

    #[test]
    fn test_effective_args_empty_user_list() {
        let effective = effective_args(&[]);
        assert_eq!(effective.len(), 1 + FIXED_FLAGS.len());
        assert_eq!(effective[0], "kefir");
    }

    #[test]
    fn test_user_flags_follow_fixed_flags() {
        // Later-wins override relies on user flags sorting after the defaults.
        let effective = effective_args(&args(&["--target", "x86_64-linux-gnu"]));
        let first = effective.iter().position(|a| a == "--target").unwrap();
        let last = effective.iter().rposition(|a| a == "--target").unwrap();
        assert!(first < last);
        assert_eq!(effective[last + 1], "x86_64-linux-gnu");
    }
}
