//! Resource retrieval boundary
//!
//! Everything the worker pulls over the network goes through one narrow
//! trait: a single opaque asynchronous read per resource, plus a synchronous
//! read used only when the compiler opens a lazily-materialized include file
//! mid-invocation (the entry point call cannot suspend, so those reads block
//! on a synchronous XHR, which workers permit).

use std::fmt;

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::JsCast;
#[cfg(target_arch = "wasm32")]
use wasm_bindgen_futures::JsFuture;

/// Result type for resource fetches
pub type FetchResult<T> = Result<T, FetchError>;

/// Errors from the retrieval boundary.
///
/// `Clone` because a single in-flight fetch may have several jobs awaiting it
/// and each gets its own copy of the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The resource could not be retrieved at all
    Unavailable { resource: String, reason: String },

    /// The server answered with a non-success status
    Status { resource: String, status: u16 },

    /// The response body could not be decoded as expected
    Decode { resource: String },
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { resource, reason } => {
                write!(f, "failed to fetch '{}': {}", resource, reason)
            }
            Self::Status { resource, status } => {
                write!(f, "fetch of '{}' returned status {}", resource, status)
            }
            Self::Decode { resource } => {
                write!(f, "could not decode response body of '{}'", resource)
            }
        }
    }
}

impl std::error::Error for FetchError {}

/// The retrieval boundary.
///
/// Implementations are expected to be dumb pipes: no caching, no retries.
/// Caching is the job of [`crate::cache`], and retry policy belongs to the
/// caller (a failed fetch leaves the cache empty so the next job retries).
pub trait ResourceFetcher {
    /// One asynchronous read of a text resource.
    fn fetch_text(&self, resource: &str) -> impl Future<Output = FetchResult<String>>;

    /// One asynchronous read of a binary resource.
    fn fetch_bytes(&self, resource: &str) -> impl Future<Output = FetchResult<Vec<u8>>>;

    /// Blocking read of a binary resource.
    ///
    /// Only called from inside a compiler invocation, when the module opens a
    /// lazily-backed include file for the first time.
    fn fetch_bytes_blocking(&self, resource: &str) -> FetchResult<Vec<u8>>;
}

/// Fetcher over the worker's own network primitives.
#[cfg(target_arch = "wasm32")]
pub struct WebFetcher {
    /// URL prefix prepended to every resource path (empty = worker-relative)
    base: String,
}

#[cfg(target_arch = "wasm32")]
impl WebFetcher {
    pub fn new() -> Self {
        Self {
            base: String::new(),
        }
    }

    pub fn with_base(base: &str) -> Self {
        Self {
            base: base.to_string(),
        }
    }

    fn url(&self, resource: &str) -> String {
        format!("{}{}", self.base, resource)
    }

    async fn response_for(&self, resource: &str) -> FetchResult<web_sys::Response> {
        let scope: web_sys::WorkerGlobalScope = js_sys::global()
            .dyn_into()
            .map_err(|_| FetchError::Unavailable {
                resource: resource.to_string(),
                reason: "not running inside a worker scope".to_string(),
            })?;

        let response = JsFuture::from(scope.fetch_with_str(&self.url(resource)))
            .await
            .map_err(|e| FetchError::Unavailable {
                resource: resource.to_string(),
                reason: e
                    .as_string()
                    .unwrap_or_else(|| "network error".to_string()),
            })?;

        let response: web_sys::Response =
            response.dyn_into().map_err(|_| FetchError::Decode {
                resource: resource.to_string(),
            })?;

        if !response.ok() {
            return Err(FetchError::Status {
                resource: resource.to_string(),
                status: response.status(),
            });
        }

        Ok(response)
    }
}

#[cfg(target_arch = "wasm32")]
impl Default for WebFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "wasm32")]
impl ResourceFetcher for WebFetcher {
    async fn fetch_text(&self, resource: &str) -> FetchResult<String> {
        let response = self.response_for(resource).await?;

        let text_promise = response.text().map_err(|_| FetchError::Decode {
            resource: resource.to_string(),
        })?;
        let text = JsFuture::from(text_promise)
            .await
            .map_err(|_| FetchError::Decode {
                resource: resource.to_string(),
            })?;

        text.as_string().ok_or(FetchError::Decode {
            resource: resource.to_string(),
        })
    }

    async fn fetch_bytes(&self, resource: &str) -> FetchResult<Vec<u8>> {
        let response = self.response_for(resource).await?;

        let buf_promise = response.array_buffer().map_err(|_| FetchError::Decode {
            resource: resource.to_string(),
        })?;
        let buf = JsFuture::from(buf_promise)
            .await
            .map_err(|_| FetchError::Decode {
                resource: resource.to_string(),
            })?;

        Ok(js_sys::Uint8Array::new(&buf).to_vec())
    }

    fn fetch_bytes_blocking(&self, resource: &str) -> FetchResult<Vec<u8>> {
        let xhr = web_sys::XmlHttpRequest::new().map_err(|_| FetchError::Unavailable {
            resource: resource.to_string(),
            reason: "XMLHttpRequest unavailable".to_string(),
        })?;

        xhr.open_with_async("GET", &self.url(resource), false)
            .map_err(|_| FetchError::Unavailable {
                resource: resource.to_string(),
                reason: "failed to open request".to_string(),
            })?;

        // Byte-exact text transport: each char code's low byte is one byte of
        // the payload. The only way to get binary data out of a sync XHR.
        xhr.override_mime_type("text/plain; charset=x-user-defined")
            .map_err(|_| FetchError::Decode {
                resource: resource.to_string(),
            })?;

        xhr.send().map_err(|_| FetchError::Unavailable {
            resource: resource.to_string(),
            reason: "send failed".to_string(),
        })?;

        let status = xhr.status().unwrap_or(0);
        if !(200..300).contains(&status) {
            return Err(FetchError::Status {
                resource: resource.to_string(),
                status,
            });
        }

        let text = xhr
            .response_text()
            .ok()
            .flatten()
            .ok_or(FetchError::Decode {
                resource: resource.to_string(),
            })?;

        Ok(text.chars().map(|c| (c as u32 & 0xFF) as u8).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FetchError::Status {
            resource: "kefir.wasm".to_string(),
            status: 404,
        };
        assert!(err.to_string().contains("kefir.wasm"));
        assert!(err.to_string().contains("404"));

        let err = FetchError::Unavailable {
            resource: "includes.list".to_string(),
            reason: "offline".to_string(),
        };
        assert_eq!(err.to_string(), "failed to fetch 'includes.list': offline");
    }
}
