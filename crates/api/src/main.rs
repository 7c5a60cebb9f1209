use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use storefront_api::config::ServerSettings;
use storefront_infra::jobs::JobWorkerConfig;
use storefront_infra::store::RedisConnector;
use storefront_infra::{ServiceRegistry, ServicesConfig, process_registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server = ServerSettings::from_env().context("failed to load server settings")?;
    storefront_observability::init_with(&server.log);

    let services = ServicesConfig::from_env().context("failed to load service settings")?;
    let worker_config = JobWorkerConfig::from_settings(&services.jobs);
    let connector = Arc::new(RedisConnector::new(services.store.clone()));
    let registry = process_registry(|| ServiceRegistry::new(connector, services));

    // The API still serves without the auxiliary services; routes that need
    // them answer 503 and rate limiting admits everything.
    if let Err(err) = registry.initialize().await {
        error!(error = %err, "failed to initialize auxiliary services");
    }

    let worker = match registry.job_queue().await {
        Ok(queue) => Some(storefront_api::jobs::default_worker(queue).spawn(worker_config)),
        Err(err) => {
            warn!(error = %err, "job worker not started");
            None
        }
    };

    let app = storefront_api::app::build_app(registry.clone());

    let listener = tokio::net::TcpListener::bind(&server.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", server.bind_address))?;

    info!(address = %listener.local_addr()?, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("shutting down");
    if let Some(worker) = worker {
        worker.shutdown().await;
    }
    registry.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
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
                error!(error = %err, "failed to listen for SIGTERM");
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
