use anyhow::Context;

use bulkmsg_api::app::services;
use bulkmsg_infra::EngineConfig;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bulkmsg_observability::init();

    let config = EngineConfig::from_env();
    let services = services::build_services(config)
        .await
        .context("failed to build services")?;
    let workers = services.engine.spawn_workers();

    let app = bulkmsg_api::app::build_app(services);

    let bind_addr =
        std::env::var("BULKMSG_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    workers.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested");
}
