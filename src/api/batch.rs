//! Batch conversation fan-out: one management call resolves conversation
//! listings from many sandboxes concurrently, in-cluster.

use std::collections::HashMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use futures::StreamExt;
use log::debug;
use serde_json::value::RawValue;

use crate::sandbox::models::{BatchConversationSandbox, BatchConversationsRequest};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Upper bound on in-flight sandbox queries.
const FANOUT_CONCURRENCY: usize = 16;

/// Per-sandbox request timeout.
const FANOUT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// POST /sessions/batch-conversations: for each entry, query the
/// sandbox's agent server over the cluster network and pass its response
/// body through unparsed. A failing entry degrades to `[]`; the batch
/// itself never fails.
pub async fn batch_conversations(
    State(state): State<AppState>,
    payload: Result<Json<BatchConversationsRequest>, JsonRejection>,
) -> ApiResult<Json<HashMap<String, Box<RawValue>>>> {
    let Json(req) = payload
        .map_err(|err| ApiError::invalid_request(format!("Invalid request body: {err}")))?;

    if req.sandboxes.is_empty() {
        return Ok(Json(HashMap::new()));
    }
    debug!("batch-conversations: querying {} sandbox(es)", req.sandboxes.len());

    let results: HashMap<String, Box<RawValue>> =
        futures::stream::iter(req.sandboxes.into_iter().map(|(runtime_id, sandbox)| {
            let state = state.clone();
            async move {
                let data = fetch_conversations(&state, &runtime_id, &sandbox).await;
                (runtime_id, data)
            }
        }))
        .buffer_unordered(FANOUT_CONCURRENCY)
        .collect()
        .await;

    Ok(Json(results))
}

/// Query one sandbox. Every failure mode (unknown record, transport
/// error, non-2xx, unparseable body) yields an empty list for the entry.
async fn fetch_conversations(
    state: &AppState,
    runtime_id: &str,
    sandbox: &BatchConversationSandbox,
) -> Box<RawValue> {
    let record = state.store.get(runtime_id).or_else(|| {
        if sandbox.session_id.is_empty() {
            None
        } else {
            state.store.get_by_session(&sandbox.session_id)
        }
    });
    let Some(record) = record else {
        debug!(
            "batch-conversations: no record for {runtime_id} (session {})",
            sandbox.session_id
        );
        return empty_list();
    };

    let ids = sandbox.conversation_ids.join(",");
    let url = format!(
        "http://{}.{}.svc.cluster.local:{}/api/conversations?ids={}",
        record.service_name, state.config.namespace, state.config.agent_port, ids
    );
    debug!("batch-conversations: fetching {url}");

    let response = match state
        .http
        .get(&url)
        .timeout(FANOUT_TIMEOUT)
        .header("X-Session-API-Key", &record.session_api_key)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            debug!("batch-conversations: request for {runtime_id} failed: {err}");
            return empty_list();
        }
    };

    if !response.status().is_success() {
        debug!(
            "batch-conversations: non-2xx for {runtime_id}: {}",
            response.status()
        );
        return empty_list();
    }

    match response.text().await {
        Ok(body) => RawValue::from_string(body).unwrap_or_else(|_| empty_list()),
        Err(err) => {
            debug!("batch-conversations: reading body for {runtime_id} failed: {err}");
            empty_list()
        }
    }
}

fn empty_list() -> Box<RawValue> {
    RawValue::from_string("[]".to_string()).expect("literal JSON array")
}
