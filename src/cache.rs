//! Process-wide lazy resource caches
//!
//! The include manifest and the compiler's module binary are each fetched at
//! most once per worker lifetime, no matter how many jobs run. Two jobs racing
//! on an unpopulated cache share a single in-flight fetch. No fancy lock-free
//! machinery - a RefCell-wrapped state cell is enough in a single-threaded
//! worker. Tractable > Clever.

use crate::fetch::{FetchError, FetchResult, ResourceFetcher};
use futures::FutureExt;
use futures::future::{LocalBoxFuture, Shared};
use std::cell::RefCell;
use std::rc::Rc;

/// Well-known resource naming the auxiliary include files, one per line.
pub const MANIFEST_RESOURCE: &str = "includes.list";

/// Well-known resource holding the compiler's WASM binary.
pub const MODULE_RESOURCE: &str = "kefir.wasm";

type SharedFetch<T> = Shared<LocalBoxFuture<'static, FetchResult<T>>>;

enum Slot<T: Clone + 'static> {
    /// Nothing fetched yet (or the last attempt failed)
    Idle,
    /// A fetch is in flight; late callers await the same future
    Pending(SharedFetch<T>),
    /// Populated for the rest of the worker's life
    Ready(T),
}

/// A lazily-populated, single-flight cell.
///
/// Invariants:
/// - at most one fetch is ever in flight;
/// - once `Ready`, the value is returned with no I/O forever after;
/// - a failed fetch resets the cell to `Idle`, so a later job retries.
pub struct SingleFlight<T: Clone + 'static> {
    slot: RefCell<Slot<T>>,
}

impl<T: Clone + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            slot: RefCell::new(Slot::Idle),
        }
    }

    /// True once a value has been cached.
    pub fn is_populated(&self) -> bool {
        matches!(&*self.slot.borrow(), Slot::Ready(_))
    }

    /// Return the cached value, joining or starting a fetch as needed.
    ///
    /// `start` is only called when the cell is `Idle`.
    pub async fn get_or_fetch<F>(&self, start: F) -> FetchResult<T>
    where
        F: FnOnce() -> LocalBoxFuture<'static, FetchResult<T>>,
    {
        let shared = {
            let mut slot = self.slot.borrow_mut();
            match &*slot {
                Slot::Ready(value) => return Ok(value.clone()),
                Slot::Pending(fetch) => fetch.clone(),
                Slot::Idle => {
                    let fetch = start().shared();
                    *slot = Slot::Pending(fetch.clone());
                    fetch
                }
            }
        };

        match shared.await {
            Ok(value) => {
                *self.slot.borrow_mut() = Slot::Ready(value.clone());
                Ok(value)
            }
            Err(err) => {
                // Leave the cache unpopulated so the next job can retry.
                let mut slot = self.slot.borrow_mut();
                if matches!(&*slot, Slot::Pending(_)) {
                    *slot = Slot::Idle;
                }
                Err(err)
            }
        }
    }
}

impl<T: Clone + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The two independent caches every job consults before running.
pub struct WorkerCaches {
    manifest: SingleFlight<Rc<Vec<String>>>,
    module: SingleFlight<Rc<Vec<u8>>>,
}

impl WorkerCaches {
    pub fn new() -> Self {
        Self {
            manifest: SingleFlight::new(),
            module: SingleFlight::new(),
        }
    }

    /// The include-file manifest: fetched once, split into non-empty lines.
    pub async fn manifest<F>(&self, fetcher: &Rc<F>) -> FetchResult<Rc<Vec<String>>>
    where
        F: ResourceFetcher + 'static,
    {
        let fetcher = Rc::clone(fetcher);
        self.manifest
            .get_or_fetch(move || {
                async move {
                    let text = fetcher.fetch_text(MANIFEST_RESOURCE).await?;
                    Ok(Rc::new(split_manifest(&text)))
                }
                .boxed_local()
            })
            .await
    }

    /// The compiler's module binary: fetched once, never re-validated.
    pub async fn module_binary<F>(&self, fetcher: &Rc<F>) -> FetchResult<Rc<Vec<u8>>>
    where
        F: ResourceFetcher + 'static,
    {
        let fetcher = Rc::clone(fetcher);
        self.module
            .get_or_fetch(move || {
                async move {
                    let bytes = fetcher.fetch_bytes(MODULE_RESOURCE).await?;
                    Ok(Rc::new(bytes))
                }
                .boxed_local()
            })
            .await
    }

    pub fn manifest_populated(&self) -> bool {
        self.manifest.is_populated()
    }

    pub fn module_populated(&self) -> bool {
        self.module.is_populated()
    }
}

impl Default for WorkerCaches {
    fn default() -> Self {
        Self::new()
    }
}

/// Split manifest text into entries, discarding empty lines.
pub fn split_manifest(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Helper for propagating fetch failures out of the job pipeline.
pub fn fetch_unavailable(resource: &str, reason: &str) -> FetchError {
    FetchError::Unavailable {
        resource: resource.to_string(),
        reason: reason.to_string(),
    }
}
