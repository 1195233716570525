//! Application state shared across handlers.

use std::sync::Arc;

use axum::body::Body;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::sandbox::StateStore;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Sandbox records, indexed by runtime id and session id.
    pub store: Arc<StateStore>,
    /// Orchestrator adapter driving the cluster.
    pub orchestrator: Arc<dyn Orchestrator>,
    /// Process configuration.
    pub config: Arc<Config>,
    /// HTTP client for the sandbox proxy data path.
    pub proxy_client: Client<HttpConnector, Body>,
    /// HTTP client for the batch conversation fan-out.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(
        store: Arc<StateStore>,
        orchestrator: Arc<dyn Orchestrator>,
        config: Arc<Config>,
    ) -> Self {
        let proxy_client: Client<HttpConnector, Body> =
            Client::builder(TokioExecutor::new()).build_http();

        Self {
            store,
            orchestrator,
            config,
            proxy_client,
            http: reqwest::Client::new(),
        }
    }
}
