//! Browser worker glue
//!
//! Registers the `onmessage` handler on the dedicated worker scope and turns
//! each message into one pipeline run plus one `postMessage` reply. The
//! compiler host (and with it both resource caches) lives as long as the
//! worker, so the manifest and module binary are fetched once no matter how
//! many jobs arrive.

use super::{JobRequest, JobResponse, dispatch};
use crate::bridge::runner::CompilerHost;
use crate::bridge::web::WebEngine;
use crate::console_log;
use crate::fetch::WebFetcher;
use std::rc::Rc;

use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use web_sys::{DedicatedWorkerGlobalScope, MessageEvent};

thread_local! {
    static HOST: Rc<CompilerHost<WebEngine, WebFetcher>> =
        Rc::new(CompilerHost::new(WebEngine::new(), WebFetcher::new()));
}

/// Serialize an envelope, falling back to a hand-built error envelope if the
/// response itself will not encode. One reply per request, no exceptions.
fn encode(response: &JobResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|err| {
        format!(
            r#"{{"success":false,"error":"failed to encode response: {}"}}"#,
            err
        )
    })
}

fn post(scope: &DedicatedWorkerGlobalScope, response: &JobResponse) {
    if scope
        .post_message(&JsValue::from_str(&encode(response)))
        .is_err()
    {
        console_log!("[worker] failed to post response");
    }
}

/// Install the message handler. Called once from the crate's start hook.
pub fn install() {
    let scope: DedicatedWorkerGlobalScope = js_sys::global().unchecked_into();
    let scope_for_handler = scope.clone();

    let handler = Closure::wrap(Box::new(move |event: MessageEvent| {
        let scope = scope_for_handler.clone();

        let request = event
            .data()
            .as_string()
            .ok_or_else(|| "message is not a string".to_string())
            .and_then(|text| {
                serde_json::from_str::<JobRequest>(&text)
                    .map_err(|err| format!("malformed job request: {}", err))
            });

        let request = match request {
            Ok(request) => request,
            Err(reason) => {
                post(&scope, &JobResponse::failed(reason));
                return;
            }
        };

        wasm_bindgen_futures::spawn_local(async move {
            let host = HOST.with(Rc::clone);
            let response = dispatch(&host, request).await;
            post(&scope, &response);
        });
    }) as Box<dyn FnMut(MessageEvent)>);

    scope.set_onmessage(Some(handler.as_ref().unchecked_ref()));
    handler.forget();

    console_log!("[worker] kefir worker ready");
}
