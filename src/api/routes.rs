//! API route definitions.

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::CONTENT_LENGTH;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{any, get, post};
use axum::Router;
use log::debug;
use tower_http::trace::TraceLayer;

use super::auth::require_api_key;
use super::batch;
use super::handlers;
use super::proxy;
use super::state::AppState;

/// Bodies above this size are not captured for debug logging.
const MAX_LOGGED_BODY: usize = 64 * 1024;

/// Create the application router.
///
/// Three route families: unauthenticated health checks, key-authenticated
/// management endpoints, and (in proxy mode only) the sandbox data path,
/// which bypasses management auth because the sandbox validates its own
/// session key.
pub fn create_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/liveness", get(handlers::health))
        .route("/readiness", get(handlers::health));

    let management_routes = Router::new()
        .route("/start", post(handlers::start_sandbox))
        .route("/stop", post(handlers::stop_sandbox))
        .route("/pause", post(handlers::pause_sandbox))
        .route("/resume", post(handlers::resume_sandbox))
        .route("/list", get(handlers::list_sandboxes))
        .route("/runtime/{runtime_id}", get(handlers::get_runtime))
        .route(
            "/sessions/batch-conversations",
            post(batch::batch_conversations),
        )
        .route("/sessions/batch", get(handlers::get_sessions_batch))
        .route("/sessions/{session_id}", get(handlers::get_session))
        .route("/registry_prefix", get(handlers::get_registry_prefix))
        .route("/image_exists", get(handlers::check_image_exists))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(middleware::from_fn(log_request_details));

    let mut router = Router::new().merge(public_routes).merge(management_routes);

    if state.config.proxy_mode() {
        log::info!(
            "proxy mode enabled: sandbox URLs under {}/sandbox/{{runtime_id}}",
            state.config.proxy_base_url
        );
        router = router
            .route("/sandbox/{runtime_id}", any(proxy::proxy_sandbox))
            .route("/sandbox/{runtime_id}/{*path}", any(proxy::proxy_sandbox));
    }

    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// At debug level, log management request headers and (small) bodies.
/// This includes API keys and session secrets; only enable debug logging
/// in controlled environments.
async fn log_request_details(req: Request, next: Next) -> Response {
    if !log::log_enabled!(log::Level::Debug) {
        return next.run(req).await;
    }

    debug!("request headers: {:?}", req.headers());

    let capture = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
        .is_some_and(|len| len > 0 && len <= MAX_LOGGED_BODY);
    if !capture {
        return next.run(req).await;
    }

    let (parts, body) = req.into_parts();
    match axum::body::to_bytes(body, MAX_LOGGED_BODY).await {
        Ok(bytes) => {
            debug!("request body: {}", String::from_utf8_lossy(&bytes));
            next.run(Request::from_parts(parts, Body::from(bytes))).await
        }
        Err(err) => {
            debug!("request body: <unable to read: {err}>");
            next.run(Request::from_parts(parts, Body::empty())).await
        }
    }
}
