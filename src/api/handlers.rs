//! Management endpoint handlers.

use std::collections::{HashMap, HashSet};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, RawQuery, State};
use axum::Json;
use log::{debug, info, warn};

use crate::config::Config;
use crate::orchestrator::PodStatusInfo;
use crate::sandbox::models::{
    generate_runtime_id, generate_session_api_key, is_dns1123_subdomain, CommandSpec,
    ImageExistsResponse, ListResponse, RegistryPrefixResponse, RuntimeIdRequest, RuntimeResponse,
    SandboxRecord, SandboxStatus, StartRequest,
};
use crate::sandbox::PodStatus;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health, liveness and readiness all answer the same way; none require
/// authentication.
pub async fn health() -> &'static str {
    "OK"
}

/// POST /start: create a sandbox, or return the existing one for this
/// session id (idempotent, no orchestrator call).
pub async fn start_sandbox(
    State(state): State<AppState>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> ApiResult<Json<RuntimeResponse>> {
    let Json(req) = payload.map_err(bad_body)?;

    if req.image.is_empty() {
        return Err(ApiError::invalid_request("Image is required"));
    }
    if req.session_id.is_empty() {
        return Err(ApiError::invalid_request("Session ID is required"));
    }
    if !is_dns1123_subdomain(&req.session_id.to_lowercase()) {
        return Err(ApiError::invalid_request(
            "Session ID must lower-case to a valid DNS subdomain",
        ));
    }
    if req.resource_factor < 0.0 {
        return Err(ApiError::invalid_request("resource_factor must not be negative"));
    }

    if let Some(existing) = state.store.get_by_session(&req.session_id) {
        debug!(
            "start: returning existing runtime {} for session {}",
            existing.runtime_id, req.session_id
        );
        return Ok(Json(build_response(&existing, &state.config)));
    }

    let runtime_id = generate_runtime_id();
    let session_api_key = generate_session_api_key();
    let mut record = SandboxRecord::new(
        runtime_id.clone(),
        req.session_id.clone(),
        session_api_key,
        &state.config.base_domain,
        state.config.worker_1_port,
        state.config.worker_2_port,
    );

    // Insert before the cluster call so a concurrent duplicate start finds
    // the record. Two starts racing past the lookup above can still both
    // create a workload; the loser's pod is swept by the reaper.
    state.store.add(record.clone());

    if let Err(err) = state.orchestrator.create_sandbox(&req, &record).await {
        let _ = state.store.delete(&runtime_id);
        warn!("failed to create sandbox for session {}: {err}", req.session_id);
        return Err(ApiError::CreationFailed(format!("Failed to create sandbox: {err}")));
    }

    record.status = SandboxStatus::Running;
    let _ = state.store.update(record.clone());
    info!(
        "started sandbox runtime={} session={}",
        record.runtime_id, record.session_id
    );
    Ok(Json(build_response(&record, &state.config)))
}

/// POST /stop: delete the sandbox and drop its record.
pub async fn stop_sandbox(
    State(state): State<AppState>,
    payload: Result<Json<RuntimeIdRequest>, JsonRejection>,
) -> ApiResult<Json<RuntimeResponse>> {
    let Json(req) = payload.map_err(bad_body)?;
    let mut record = lookup_runtime(&state, &req.runtime_id).await?;

    if let Err(err) = state.orchestrator.delete_sandbox(&record).await {
        warn!("failed to delete sandbox {}: {err}", record.runtime_id);
        return Err(ApiError::DeletionFailed(format!("Failed to delete sandbox: {err}")));
    }

    record.status = SandboxStatus::Stopped;
    let _ = state.store.delete(&record.runtime_id);
    info!("stopped sandbox runtime={}", record.runtime_id);
    Ok(Json(build_response(&record, &state.config)))
}

/// POST /pause: tear down the workload but keep the record, service and
/// ingress so the sandbox can resume under the same names.
pub async fn pause_sandbox(
    State(state): State<AppState>,
    payload: Result<Json<RuntimeIdRequest>, JsonRejection>,
) -> ApiResult<Json<RuntimeResponse>> {
    let Json(req) = payload.map_err(bad_body)?;
    let mut record = lookup_runtime(&state, &req.runtime_id).await?;

    if let Err(err) = state.orchestrator.scale_to_zero(&record.pod_name).await {
        warn!("failed to pause sandbox {}: {err}", record.runtime_id);
        return Err(ApiError::PauseFailed(format!("Failed to pause runtime: {err}")));
    }

    record.status = SandboxStatus::Paused;
    record.pod_status = PodStatus::NotFound;
    let _ = state.store.update(record.clone());
    info!("paused sandbox runtime={}", record.runtime_id);
    Ok(Json(build_response(&record, &state.config)))
}

/// POST /resume: recreate the workload of a paused sandbox. A resume of
/// an already-running sandbox is a no-op (websocket recovery paths call
/// resume blindly).
pub async fn resume_sandbox(
    State(state): State<AppState>,
    payload: Result<Json<RuntimeIdRequest>, JsonRejection>,
) -> ApiResult<Json<RuntimeResponse>> {
    let Json(req) = payload.map_err(bad_body)?;
    let mut record = lookup_runtime(&state, &req.runtime_id).await?;

    if record.status == SandboxStatus::Running {
        debug!("resume: runtime {} already running", record.runtime_id);
        return Ok(Json(build_response(&record, &state.config)));
    }
    if record.status != SandboxStatus::Paused {
        return Err(ApiError::InvalidState("Runtime is not paused".to_string()));
    }

    let spec = resume_spec(&state.config, &record);
    if let Err(err) = state.orchestrator.recreate_pod(&spec, &record).await {
        warn!("failed to resume sandbox {}: {err}", record.runtime_id);
        return Err(ApiError::ResumeFailed(format!("Failed to resume runtime: {err}")));
    }

    record.status = SandboxStatus::Running;
    record.pod_status = PodStatus::Pending;
    let _ = state.store.update(record.clone());
    info!("resumed sandbox runtime={}", record.runtime_id);
    Ok(Json(build_response(&record, &state.config)))
}

/// GET /list: every record, with pod statuses refreshed through one
/// batch orchestrator call.
pub async fn list_sandboxes(State(state): State<AppState>) -> ApiResult<Json<ListResponse>> {
    let mut records = state.store.list();
    refresh_statuses_batch(&state, &mut records).await;

    let runtimes = records
        .iter()
        .map(|record| build_response(record, &state.config))
        .collect();
    Ok(Json(ListResponse { runtimes }))
}

/// GET /runtime/{runtime_id}
pub async fn get_runtime(
    State(state): State<AppState>,
    Path(runtime_id): Path<String>,
) -> ApiResult<Json<RuntimeResponse>> {
    let mut record = lookup_runtime(&state, &runtime_id).await?;
    refresh_status(&state, &mut record).await;
    Ok(Json(build_response(&record, &state.config)))
}

/// GET /sessions/{session_id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<RuntimeResponse>> {
    let mut record = lookup_session(&state, &session_id).await?;
    refresh_status(&state, &mut record).await;
    Ok(Json(build_response(&record, &state.config)))
}

/// GET /sessions/batch?ids=a,b&ids=c accepts comma- and repeat-separated ids,
/// mixed freely. Returns a plain array; unknown sessions are skipped.
pub async fn get_sessions_batch(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> ApiResult<Json<Vec<RuntimeResponse>>> {
    let session_ids = parse_ids_query(query.as_deref().unwrap_or(""));
    if session_ids.is_empty() {
        return Err(ApiError::invalid_request("ids parameter is required"));
    }
    debug!("batch: fetching {} session(s)", session_ids.len());

    let mut records = Vec::with_capacity(session_ids.len());
    let mut seen = HashSet::new();
    for session_id in &session_ids {
        let record = match state.store.get_by_session(session_id) {
            Some(record) => record,
            None => match state.orchestrator.discover_by_session_id(session_id).await {
                Ok(Some(record)) => {
                    info!("batch: recovered session {session_id} from the orchestrator");
                    state.store.add(record.clone());
                    record
                }
                _ => continue,
            },
        };
        if seen.insert(record.runtime_id.clone()) {
            records.push(record);
        }
    }

    refresh_statuses_batch(&state, &mut records).await;

    let responses = records
        .iter()
        .map(|record| build_response(record, &state.config))
        .collect();
    Ok(Json(responses))
}

/// GET /registry_prefix
pub async fn get_registry_prefix(
    State(state): State<AppState>,
) -> Json<RegistryPrefixResponse> {
    Json(RegistryPrefixResponse {
        registry_prefix: state.config.registry_prefix.clone(),
    })
}

/// GET /image_exists?image=...: registry verification is a declared
/// non-goal; the answer is always yes.
pub async fn check_image_exists(
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<ImageExistsResponse>> {
    let image = params.get("image").map(String::as_str).unwrap_or("");
    if image.is_empty() {
        return Err(ApiError::invalid_request("image parameter is required"));
    }
    Ok(Json(ImageExistsResponse { exists: true }))
}

fn bad_body(err: JsonRejection) -> ApiError {
    ApiError::invalid_request(format!("Invalid request body: {err}"))
}

/// Look up a record by runtime id, falling back to on-demand discovery so
/// a replica with a cold store can still serve the request.
async fn lookup_runtime(state: &AppState, runtime_id: &str) -> ApiResult<SandboxRecord> {
    if let Some(record) = state.store.get(runtime_id) {
        return Ok(record);
    }
    match state.orchestrator.discover_by_runtime_id(runtime_id).await {
        Ok(Some(record)) => {
            info!("recovered runtime {runtime_id} from the orchestrator (state was lost)");
            state.store.add(record.clone());
            Ok(record)
        }
        Ok(None) => Err(ApiError::runtime_not_found()),
        Err(err) => {
            debug!("discovery for runtime {runtime_id} failed: {err}");
            Err(ApiError::runtime_not_found())
        }
    }
}

async fn lookup_session(state: &AppState, session_id: &str) -> ApiResult<SandboxRecord> {
    if let Some(record) = state.store.get_by_session(session_id) {
        return Ok(record);
    }
    match state.orchestrator.discover_by_session_id(session_id).await {
        Ok(Some(record)) => {
            info!("recovered session {session_id} from the orchestrator (state was lost)");
            state.store.add(record.clone());
            Ok(record)
        }
        Ok(None) => Err(ApiError::session_not_found()),
        Err(err) => {
            debug!("discovery for session {session_id} failed: {err}");
            Err(ApiError::session_not_found())
        }
    }
}

/// Refresh one record's pod status from the orchestrator, persisting the
/// result. Lookup errors leave the cached status in place.
async fn refresh_status(state: &AppState, record: &mut SandboxRecord) {
    if let Ok(info) = state.orchestrator.pod_status(&record.pod_name).await {
        apply_status(record, &info);
        let _ = state.store.update(record.clone());
    }
}

/// Refresh many records with a single orchestrator list call.
async fn refresh_statuses_batch(state: &AppState, records: &mut [SandboxRecord]) {
    if records.is_empty() {
        return;
    }
    let pod_names: Vec<String> = records.iter().map(|r| r.pod_name.clone()).collect();
    match state.orchestrator.pod_statuses(&pod_names).await {
        Ok(statuses) => {
            for record in records.iter_mut() {
                if let Some(info) = statuses.get(&record.pod_name) {
                    apply_status(record, info);
                    let _ = state.store.update(record.clone());
                }
            }
        }
        Err(err) => debug!("batch status refresh failed: {err}"),
    }
}

fn apply_status(record: &mut SandboxRecord, info: &PodStatusInfo) {
    record.pod_status = info.status;
    record.restart_count = info.restart_count;
    record.restart_reasons = info.restart_reasons.clone();
}

/// Shape a record for the wire. In proxy mode the URLs point at this
/// control plane instead of the per-sandbox hostnames.
pub(crate) fn build_response(record: &SandboxRecord, config: &Config) -> RuntimeResponse {
    let mut resp = RuntimeResponse {
        runtime_id: record.runtime_id.clone(),
        session_id: record.session_id.clone(),
        url: record.url.clone(),
        vscode_url: None,
        session_api_key: record.session_api_key.clone(),
        status: record.status,
        pod_status: record.pod_status,
        work_hosts: record.work_hosts.clone(),
        restart_count: (record.restart_count != 0).then_some(record.restart_count),
        restart_reasons: record.restart_reasons.clone(),
    };
    if config.proxy_mode() {
        resp.url = format!("{}/sandbox/{}", config.proxy_base_url, record.runtime_id);
        resp.vscode_url = Some(format!(
            "{}/sandbox/{}/vscode",
            config.proxy_base_url, record.runtime_id
        ));
    }
    resp
}

/// Synthetic start spec used when resuming: the original image and command
/// are not stored, so resume re-provisions with defaults targeting the
/// agent port, preserving the session id.
fn resume_spec(config: &Config, record: &SandboxRecord) -> StartRequest {
    StartRequest {
        image: config.default_image.clone(),
        command: CommandSpec::Argv(vec![
            "/usr/local/bin/agent-server".to_string(),
            "--port".to_string(),
            config.agent_port.to_string(),
        ]),
        working_dir: "/workspace".to_string(),
        environment: HashMap::new(),
        session_id: record.session_id.clone(),
        resource_factor: 0.0,
        runtime_class: None,
    }
}

/// Parse the `ids` query values, splitting each on commas so
/// `?ids=a,b&ids=c` yields `[a, b, c]`.
fn parse_ids_query(query: &str) -> Vec<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key == "ids")
        .flat_map(|(_, value)| {
            value
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}
