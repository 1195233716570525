use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;

use sandboxd::api::{self, AppState};
use sandboxd::config::Config;
use sandboxd::orchestrator::KubeOrchestrator;
use sandboxd::reaper::Reaper;
use sandboxd::reconciler;
use sandboxd::sandbox::StateStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::from_env()?);
    init_logging(&config.log_level);

    info!("initializing sandbox control plane");
    if config.api_key.is_empty() {
        anyhow::bail!("API_KEY environment variable is required");
    }

    // In-cluster configuration when running as a pod, kubeconfig when
    // running locally.
    let client = kube::Client::try_default()
        .await
        .context("creating Kubernetes client")?;
    let orchestrator: Arc<dyn sandboxd::orchestrator::Orchestrator> =
        Arc::new(KubeOrchestrator::new(client, config.clone()));

    let store = Arc::new(StateStore::new());

    // Pre-populate state before accepting traffic so sandboxes do not
    // appear lost after a restart. Failure is non-fatal; the periodic
    // sweep repairs the store.
    reconciler::run_startup_discovery(&store, orchestrator.as_ref()).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let _reconciler_handle =
        reconciler::spawn(store.clone(), orchestrator.clone(), shutdown_rx.clone());

    if config.cleanup_enabled {
        let reaper = Arc::new(Reaper::new(store.clone(), orchestrator.clone(), &config));
        let _reaper_handle = reaper.spawn(config.cleanup_interval(), shutdown_rx.clone());
    } else {
        info!("cleanup is disabled");
    }

    let state = AppState::new(store, orchestrator, config.clone());
    let app = api::create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    info!("listening on http://{addr}");
    info!("namespace: {}", config.namespace);
    info!("base domain: {}", config.base_domain);
    if config.proxy_mode() {
        info!("proxy base URL: {}", config.proxy_base_url);
    }

    let mut drain_rx = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = drain_rx.changed().await;
            })
            .await
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining...");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(config.shutdown_timeout(), server).await {
        Ok(Ok(Ok(()))) => info!("server shutdown complete"),
        Ok(Ok(Err(err))) => return Err(err).context("running server"),
        Ok(Err(join_err)) => warn!("server task aborted: {join_err}"),
        Err(_) => warn!(
            "graceful drain exceeded {}s, exiting with requests in flight",
            config.shutdown_timeout_seconds
        ),
    }

    Ok(())
}

fn init_logging(level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sandboxd={level},tower_http={level}")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();

    // Modules log through the `log` facade; env_logger carries those.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .try_init()
        .ok();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
