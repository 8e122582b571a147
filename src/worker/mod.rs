//! Job dispatcher
//!
//! The worker's message surface. Inbound: a two-element pair
//! `[argumentList, sourceText]`. Outbound: exactly one envelope per request -
//! `{"success": true, "result": {"rc", "stdout", "stderr"}}` on completion,
//! `{"success": false, "error": "..."}` if any pipeline stage fails.
//!
//! Jobs are handled one at a time in arrival order. Should two requests ever
//! interleave at an await point, they still cannot observe each other: the
//! caches are single-flight and every job's streams, filesystem and module
//! instance are allocated per job.

pub mod channel;

#[cfg(target_arch = "wasm32")]
pub mod web;

use crate::bridge::error::CompileOutcome;
use crate::bridge::module::ModuleEngine;
use crate::bridge::runner::CompilerHost;
use crate::console_log;
use crate::fetch::ResourceFetcher;
use serde::{Deserialize, Serialize};

/// One compile request: extra compiler flags plus the program text supplied
/// as standard input. Serializes as the two-element array the page sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest(pub Vec<String>, pub String);

impl JobRequest {
    pub fn args(&self) -> &[String] {
        &self.0
    }

    pub fn source(&self) -> &str {
        &self.1
    }
}

/// The single response envelope posted back for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CompileOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResponse {
    pub fn completed(outcome: CompileOutcome) -> Self {
        Self {
            success: true,
            result: Some(outcome),
            error: None,
        }
    }

    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

/// Run one request through the pipeline and fold the outcome into an
/// envelope. Never panics a job into silence: every path yields a response.
pub async fn dispatch<E, F>(host: &CompilerHost<E, F>, request: JobRequest) -> JobResponse
where
    E: ModuleEngine,
    F: ResourceFetcher + 'static,
{
    match host.run_job(request.args(), request.source()).await {
        Ok(outcome) => JobResponse::completed(outcome),
        Err(err) => {
            console_log!("[worker] job failed: {}", err);
            JobResponse::failed(err)
        }
    }
}

/// Request/response loop: pull jobs off the channel in FIFO order, run each
/// to completion, post exactly one envelope per job. Returns when the sender
/// closes the channel.
pub async fn serve<E, F>(
    host: &CompilerHost<E, F>,
    requests: channel::Receiver<JobRequest>,
    mut post: impl FnMut(JobResponse),
) where
    E: ModuleEngine,
    F: ResourceFetcher + 'static,
{
    while let Some(request) = requests.recv().await {
        post(dispatch(host, request).await);
    }
}
