//! Reverse proxy for sandbox traffic under `/sandbox/{runtime_id}`.
//!
//! Mounted only in proxy mode, outside the management auth layer: the
//! backing sandbox validates `X-Session-API-Key` itself. The raw
//! (percent-encoded) request path is forwarded byte for byte; the
//! sandbox's file-upload endpoints encode file paths into the URL and a
//! decoded `%2F` would corrupt them. Request and response bodies are
//! streamed; upgraded connections (websockets) become a byte tunnel.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{HeaderMap, HeaderValue, HOST, LOCATION, SET_COOKIE, UPGRADE};
use axum::http::{StatusCode, Uri};
use axum::response::Response;
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};

use super::error::ApiError;
use super::state::AppState;

const SANDBOX_PREFIX: &str = "/sandbox/";

/// Which sandbox port a proxied request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyTarget {
    Agent,
    Vscode,
}

pub async fn proxy_sandbox(
    State(state): State<AppState>,
    mut req: Request,
) -> Result<Response, ApiError> {
    // The URI path is used raw, never a decoding path extractor:
    // percent-encoded separators must survive verbatim.
    let raw_path = req.uri().path().to_string();
    let Some((runtime_id, target, backend_path)) = split_sandbox_path(&raw_path) else {
        return Err(ApiError::runtime_not_found());
    };

    let record = match state.store.get(&runtime_id) {
        Some(record) => record,
        None => match state.orchestrator.discover_by_runtime_id(&runtime_id).await {
            Ok(Some(record)) => {
                info!("proxy: recovered runtime {runtime_id} from the orchestrator");
                state.store.add(record.clone());
                record
            }
            _ => {
                debug!("proxy: runtime not found: {runtime_id}");
                return Err(ApiError::runtime_not_found());
            }
        },
    };

    state.store.touch_activity(&runtime_id);

    let backend_port = match target {
        ProxyTarget::Agent => state.config.agent_port,
        ProxyTarget::Vscode => state.config.vscode_port,
    };
    let proxy_prefix = match target {
        ProxyTarget::Agent => format!("/sandbox/{runtime_id}"),
        ProxyTarget::Vscode => format!("/sandbox/{runtime_id}/vscode"),
    };

    let authority = format!(
        "{}.{}.svc.cluster.local:{}",
        record.service_name, state.config.namespace, backend_port
    );
    let mut target_uri = format!("http://{authority}{backend_path}");
    if let Some(query) = req.uri().query() {
        target_uri.push('?');
        target_uri.push_str(query);
    }
    debug!("proxying request to {target_uri}");

    let uri: Uri = target_uri
        .parse()
        .map_err(|err| ApiError::ProxyError(format!("invalid backend URI: {err}")))?;
    *req.uri_mut() = uri;

    let host = HeaderValue::from_str(&authority)
        .map_err(|err| ApiError::ProxyError(format!("invalid backend host: {err}")))?;
    req.headers_mut().insert(HOST, host);

    // Take the downstream upgrade handle before the request is consumed;
    // it resolves once the 101 is relayed back to the client.
    let downstream_upgrade = if req.headers().contains_key(UPGRADE) {
        Some(hyper::upgrade::on(&mut req))
    } else {
        None
    };

    let mut response = state.proxy_client.request(req).await.map_err(|err| {
        warn!("proxy request to {authority} failed: {err}");
        ApiError::ProxyError(format!("upstream request failed: {err}"))
    })?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(downstream) = downstream_upgrade {
            let upstream = hyper::upgrade::on(&mut response);
            tokio::spawn(async move {
                match tokio::try_join!(downstream, upstream) {
                    Ok((downstream, upstream)) => {
                        let mut downstream = TokioIo::new(downstream);
                        let mut upstream = TokioIo::new(upstream);
                        if let Err(err) =
                            tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await
                        {
                            debug!("proxied upgrade tunnel closed: {err}");
                        }
                    }
                    Err(err) => warn!("upgrade handshake failed: {err}"),
                }
            });
        }
    }

    let (mut parts, body) = response.into_parts();
    rewrite_location(&mut parts.headers, &proxy_prefix);
    rewrite_cookies(&mut parts.headers, &proxy_prefix);
    Ok(Response::from_parts(parts, Body::new(body)))
}

/// Split a raw `/sandbox/{runtime_id}[/rest]` path. A leading `vscode`
/// segment in the rest selects the editor port and is stripped from the
/// backend path. The rest is returned exactly as received, encoding
/// included.
fn split_sandbox_path(raw_path: &str) -> Option<(String, ProxyTarget, String)> {
    let rest = raw_path.strip_prefix(SANDBOX_PREFIX)?;
    if rest.is_empty() {
        return None;
    }

    let (runtime_id, remainder) = match rest.split_once('/') {
        Some((runtime_id, remainder)) => (runtime_id, Some(remainder)),
        None => (rest, None),
    };
    if runtime_id.is_empty() {
        return None;
    }

    let (target, backend_path) = match remainder {
        Some(r) if r == "vscode" || r.starts_with("vscode/") => {
            let stripped = r.strip_prefix("vscode").unwrap_or("");
            let path = if stripped.is_empty() {
                "/".to_string()
            } else {
                stripped.to_string()
            };
            (ProxyTarget::Vscode, path)
        }
        Some(r) => (ProxyTarget::Agent, format!("/{r}")),
        None => (ProxyTarget::Agent, "/".to_string()),
    };

    Some((runtime_id.to_string(), target, backend_path))
}

/// Prefix relative redirect targets with the proxy prefix. Absolute and
/// protocol-relative targets pass through untouched.
fn rewrite_location(headers: &mut HeaderMap, prefix: &str) {
    let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) else {
        return;
    };
    if location.starts_with("//") {
        return;
    }
    match url::Url::parse(location) {
        Ok(_) => {}
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            if !location.starts_with(prefix) {
                let rewritten = format!("{prefix}{location}");
                if let Ok(value) = HeaderValue::from_str(&rewritten) {
                    headers.insert(LOCATION, value);
                }
            }
        }
        Err(_) => {}
    }
}

/// Re-emit every cookie with its `Path` scoped to the proxy prefix when
/// the backend set it to the root (or left it out).
fn rewrite_cookies(headers: &mut HeaderMap, prefix: &str) {
    let cookies: Vec<String> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok().map(str::to_string))
        .collect();
    if cookies.is_empty() {
        return;
    }
    headers.remove(SET_COOKIE);
    for cookie in cookies {
        let rewritten = rewrite_cookie_path(&cookie, prefix);
        if let Ok(value) = HeaderValue::from_str(&rewritten) {
            headers.append(SET_COOKIE, value);
        }
    }
}

/// Rewrite the `Path` attribute of one `Set-Cookie` value: absent, empty
/// or `/` becomes the proxy prefix; anything else passes through.
fn rewrite_cookie_path(cookie: &str, prefix: &str) -> String {
    let mut parts: Vec<String> = cookie.split(';').map(str::to_string).collect();
    let mut has_path = false;
    for part in parts.iter_mut() {
        let trimmed = part.trim();
        if trimmed.len() >= 5 && trimmed[..5].eq_ignore_ascii_case("path=") {
            has_path = true;
            let value = trimmed[5..].trim();
            if value.is_empty() || value == "/" {
                *part = format!(" Path={prefix}");
            }
        }
    }
    if !has_path {
        parts.push(format!(" Path={prefix}"));
    }
    parts.join(";")
}
