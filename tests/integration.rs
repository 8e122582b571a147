//! Integration tests for the kefir worker bridge
//!
//! Exercises the full job pipeline - caches, provisioning, instantiation,
//! marshalling, invocation, envelopes - against a scripted module engine and
//! a counting fetcher, natively.

use futures::executor::block_on;
use kefir_worker::bridge::module::{ModuleScript, ScriptedEngine};
use kefir_worker::bridge::runner::CompilerHost;
use kefir_worker::cache::{MANIFEST_RESOURCE, MODULE_RESOURCE};
use kefir_worker::fetch::{FetchError, FetchResult, ResourceFetcher};
use kefir_worker::worker::{JobRequest, JobResponse, channel, dispatch, serve};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

// ============================================================================
// Test doubles
// ============================================================================

/// Shared fetch counters, kept by the test while the host owns the fetcher.
#[derive(Clone, Default)]
struct FetchCounters {
    manifest: Rc<Cell<u32>>,
    binary: Rc<Cell<u32>>,
    includes: Rc<RefCell<HashMap<String, u32>>>,
}

/// Fetcher serving a fixed manifest, a fake module binary and synthetic
/// include files, counting every fetch.
struct CountingFetcher {
    counters: FetchCounters,
    manifest_text: String,
    manifest_available: Rc<Cell<bool>>,
    binary_available: Rc<Cell<bool>>,
}

impl CountingFetcher {
    fn new(manifest_text: &str) -> (Self, FetchCounters, Rc<Cell<bool>>, Rc<Cell<bool>>) {
        let counters = FetchCounters::default();
        let manifest_available = Rc::new(Cell::new(true));
        let binary_available = Rc::new(Cell::new(true));
        (
            Self {
                counters: counters.clone(),
                manifest_text: manifest_text.to_string(),
                manifest_available: Rc::clone(&manifest_available),
                binary_available: Rc::clone(&binary_available),
            },
            counters,
            manifest_available,
            binary_available,
        )
    }
}

fn fake_binary() -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&kefir_worker::bridge::abi::WASM_MAGIC);
    bytes.extend_from_slice(&kefir_worker::bridge::abi::WASM_VERSION);
    bytes
}

impl ResourceFetcher for CountingFetcher {
    async fn fetch_text(&self, resource: &str) -> FetchResult<String> {
        if resource != MANIFEST_RESOURCE {
            return Err(FetchError::Status {
                resource: resource.to_string(),
                status: 404,
            });
        }
        self.counters.manifest.set(self.counters.manifest.get() + 1);
        if !self.manifest_available.get() {
            return Err(FetchError::Unavailable {
                resource: resource.to_string(),
                reason: "offline".to_string(),
            });
        }
        Ok(self.manifest_text.clone())
    }

    async fn fetch_bytes(&self, resource: &str) -> FetchResult<Vec<u8>> {
        if resource != MODULE_RESOURCE {
            return Err(FetchError::Status {
                resource: resource.to_string(),
                status: 404,
            });
        }
        self.counters.binary.set(self.counters.binary.get() + 1);
        if !self.binary_available.get() {
            return Err(FetchError::Unavailable {
                resource: resource.to_string(),
                reason: "offline".to_string(),
            });
        }
        Ok(fake_binary())
    }

    fn fetch_bytes_blocking(&self, resource: &str) -> FetchResult<Vec<u8>> {
        *self
            .counters
            .includes
            .borrow_mut()
            .entry(resource.to_string())
            .or_insert(0) += 1;
        Ok(format!("// {}", resource).into_bytes())
    }
}

/// A stand-in compiler: drains stdin, echoes it to stdout with a prefix, and
/// reports the argument count on stderr.
fn echo_script() -> ModuleScript {
    Box::new(|args, state| {
        let mut source = Vec::new();
        while let Some(byte) = state.streams.pull_stdin() {
            source.push(byte);
        }
        for byte in b"compiled: " {
            state.streams.push_stdout(*byte);
        }
        for byte in &source {
            state.streams.push_stdout(*byte);
        }
        for byte in format!("args: {}\n", args.len()).bytes() {
            state.streams.push_stderr(byte);
        }
        0
    })
}

fn echo_host() -> (
    CompilerHost<ScriptedEngine, CountingFetcher>,
    FetchCounters,
) {
    let (fetcher, counters, _, _) = CountingFetcher::new("kefir/rt.h\nmusl/stdio.h\n");
    let host = CompilerHost::new(ScriptedEngine::new(echo_script), fetcher);
    (host, counters)
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// Message contract
// ============================================================================

#[test]
fn test_exactly_one_response_per_request() {
    let (host, _) = echo_host();
    let (tx, rx) = channel::channel();

    for i in 0..3 {
        tx.send(JobRequest(vec![], format!("job {}", i))).unwrap();
    }
    tx.close();

    let responses: Rc<RefCell<Vec<JobResponse>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&responses);
    block_on(serve(&host, rx, move |response| {
        sink.borrow_mut().push(response)
    }));

    let responses = responses.borrow();
    assert_eq!(responses.len(), 3);
    // FIFO order, and each job saw its own source text.
    for (i, response) in responses.iter().enumerate() {
        assert!(response.success);
        let result = response.result.as_ref().unwrap();
        assert_eq!(result.stdout, format!("compiled: job {}", i));
    }
}

#[test]
fn test_failure_produces_single_error_envelope() {
    let (fetcher, _, manifest_available, _) = CountingFetcher::new("a.h\n");
    manifest_available.set(false);
    let host = CompilerHost::new(ScriptedEngine::new(echo_script), fetcher);

    let response = block_on(dispatch(&host, JobRequest(vec![], "x".to_string())));
    assert!(!response.success);
    assert!(response.result.is_none());
    assert!(response.error.unwrap().contains("includes.list"));
}

// ============================================================================
// Cache idempotence
// ============================================================================

#[test]
fn test_resources_fetched_once_across_jobs() {
    let (host, counters) = echo_host();

    for _ in 0..3 {
        let outcome = block_on(host.run_job(&[], "int main(){}")).unwrap();
        assert_eq!(outcome.rc, 0);
    }

    assert_eq!(counters.manifest.get(), 1);
    assert_eq!(counters.binary.get(), 1);
}

#[test]
fn test_manifest_fetch_failure_does_not_poison_later_jobs() {
    let (fetcher, counters, manifest_available, _) = CountingFetcher::new("a.h\n");
    manifest_available.set(false);
    let host = CompilerHost::new(ScriptedEngine::new(echo_script), fetcher);

    assert!(block_on(host.run_job(&[], "x")).is_err());
    assert!(!host.caches().manifest_populated());

    // Resource comes back; the next job succeeds and re-fetches.
    manifest_available.set(true);
    let outcome = block_on(host.run_job(&[], "x")).unwrap();
    assert_eq!(outcome.rc, 0);
    assert_eq!(counters.manifest.get(), 2);
    assert!(host.caches().manifest_populated());
}

#[test]
fn test_binary_fetch_failure_leaves_manifest_cached() {
    let (fetcher, counters, _, binary_available) = CountingFetcher::new("a.h\n");
    binary_available.set(false);
    let host = CompilerHost::new(ScriptedEngine::new(echo_script), fetcher);

    assert!(block_on(host.run_job(&[], "x")).is_err());
    assert!(host.caches().manifest_populated());
    assert!(!host.caches().module_populated());

    binary_available.set(true);
    assert!(block_on(host.run_job(&[], "x")).is_ok());
    // Manifest was never re-fetched; binary needed two attempts.
    assert_eq!(counters.manifest.get(), 1);
    assert_eq!(counters.binary.get(), 2);
}

// ============================================================================
// Effective arguments
// ============================================================================

#[test]
fn test_effective_arguments_reach_the_module_in_order() {
    let (host, _) = echo_host();

    block_on(host.run_job(&args(&["-c"]), "int main(){return 0;}")).unwrap();

    assert_eq!(
        host.engine().last_argv(),
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

// ============================================================================
// Stream isolation
// ============================================================================

#[test]
fn test_sequential_jobs_never_share_streams() {
    let (host, _) = echo_host();

    let first = block_on(host.run_job(&[], "first source")).unwrap();
    let second = block_on(host.run_job(&[], "second source")).unwrap();

    assert_eq!(first.stdout, "compiled: first source");
    assert_eq!(second.stdout, "compiled: second source");
    assert!(!second.stdout.contains("first"));
    assert!(!first.stderr.is_empty());
    assert_eq!(first.stderr, second.stderr); // same arg count, fresh buffer
}

#[test]
fn test_stdin_exhaustion_sentinel_is_deterministic() {
    let script = || -> ModuleScript {
        Box::new(|_args, state| {
            let mut consumed = 0usize;
            while state.streams.pull_stdin().is_some() {
                consumed += 1;
            }
            // Past the end, the sentinel must repeat.
            let settled =
                state.streams.pull_stdin().is_none() && state.streams.pull_stdin().is_none();
            for byte in format!("consumed={} settled={}", consumed, settled).bytes() {
                state.streams.push_stdout(byte);
            }
            0
        })
    };

    let (fetcher, _, _, _) = CountingFetcher::new("a.h\n");
    let host = CompilerHost::new(ScriptedEngine::new(script), fetcher);

    let outcome = block_on(host.run_job(&[], "abcd")).unwrap();
    assert_eq!(outcome.stdout, "consumed=4 settled=true");
}

// ============================================================================
// Marshalled memory release
// ============================================================================

#[test]
fn test_thousand_jobs_leak_nothing() {
    let (host, _) = echo_host();

    for i in 0..1000 {
        let outcome = block_on(host.run_job(&args(&["-c"]), "int main(){}")).unwrap();
        assert_eq!(outcome.rc, 0, "job {} failed", i);
    }

    let stats = host.engine().alloc_stats();
    assert_eq!(stats.malloc_calls, stats.free_calls);
    assert_eq!(stats.live_allocations, 0);
    assert_eq!(stats.live_bytes, 0);
}

// ============================================================================
// Provisioned filesystem
// ============================================================================

#[test]
fn test_include_files_materialize_on_first_open_only() {
    use kefir_worker::bridge::abi::OpenFlags;

    let script = || -> ModuleScript {
        Box::new(|_args, state| {
            let fd = state.sys_open("/includes/musl/stdio.h", OpenFlags::READ);
            assert!(fd >= 3);
            let mut buf = [0u8; 64];
            let read = state.sys_read(fd, &mut buf);
            assert!(read > 0);
            state.sys_close(fd);
            for byte in &buf[..read as usize] {
                state.streams.push_stdout(*byte);
            }
            0
        })
    };

    let (fetcher, counters, _, _) = CountingFetcher::new("kefir/rt.h\nmusl/stdio.h\n");
    let host = CompilerHost::new(ScriptedEngine::new(script), fetcher);

    let outcome = block_on(host.run_job(&[], "")).unwrap();
    assert_eq!(outcome.stdout, "// musl/stdio.h");

    // Only the opened include was fetched; the other stayed lazy.
    let includes = counters.includes.borrow();
    assert_eq!(includes.get("musl/stdio.h"), Some(&1));
    assert_eq!(includes.get("kefir/rt.h"), None);
}

#[test]
fn test_provisioning_shared_parents_is_idempotent() {
    // Two entries under one parent: provisioning runs once per job and must
    // not trip over directories it already created.
    let (fetcher, _, _, _) = CountingFetcher::new("a/b/x\na/b/y\n");
    let host = CompilerHost::new(ScriptedEngine::new(echo_script), fetcher);

    for _ in 0..2 {
        let outcome = block_on(host.run_job(&[], "x")).unwrap();
        assert_eq!(outcome.rc, 0);
    }
}

#[test]
fn test_compiler_environment_visible_inside_job() {
    let script = || -> ModuleScript {
        Box::new(|_args, state| {
            for key in ["KEFIR_RTINC", "KEFIR_MUSL_INCLUDE"] {
                let line = format!("{}={}\n", key, state.sys_getenv(key).unwrap_or("?"));
                for byte in line.bytes() {
                    state.streams.push_stdout(byte);
                }
            }
            0
        })
    };

    let (fetcher, _, _, _) = CountingFetcher::new("a.h\n");
    let host = CompilerHost::new(ScriptedEngine::new(script), fetcher);

    let outcome = block_on(host.run_job(&[], "")).unwrap();
    assert_eq!(
        outcome.stdout,
        "KEFIR_RTINC=/includes/kefir\nKEFIR_MUSL_INCLUDE=/includes/musl\n"
    );
}

// ============================================================================
// Exit codes are data
// ============================================================================

#[test]
fn test_nonzero_exit_code_is_not_a_bridge_error() {
    let script = || -> ModuleScript {
        Box::new(|_args, state| {
            for byte in b"error: expected ';'\n" {
                state.streams.push_stderr(*byte);
            }
            1
        })
    };

    let (fetcher, _, _, _) = CountingFetcher::new("a.h\n");
    let host = CompilerHost::new(ScriptedEngine::new(script), fetcher);

    let response = block_on(dispatch(&host, JobRequest(vec![], "int bad".to_string())));
    assert!(response.success);
    let result = response.result.unwrap();
    assert_eq!(result.rc, 1);
    assert!(result.stderr.contains("expected ';'"));
}

#[test]
fn test_exit_hook_code_wins_over_return_value() {
    let script = || -> ModuleScript {
        Box::new(|_args, state| {
            state.sys_exit(7);
            // The returned value is superseded by the recorded exit code.
            0
        })
    };

    let (fetcher, _, _, _) = CountingFetcher::new("a.h\n");
    let host = CompilerHost::new(ScriptedEngine::new(script), fetcher);

    let outcome = block_on(host.run_job(&[], "")).unwrap();
    assert_eq!(outcome.rc, 7);
}

// ============================================================================
// Module lifecycle
// ============================================================================

#[test]
fn test_fresh_module_instance_per_job() {
    let (host, _) = echo_host();

    for _ in 0..4 {
        block_on(host.run_job(&[], "x")).unwrap();
    }

    assert_eq!(host.engine().instantiations(), 4);
}
