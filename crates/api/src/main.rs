use std::net::SocketAddr;

use anyhow::Context;
use tokio::signal;

use glyphmart_api::{app, config::ApiConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    glyphmart_observability::init();

    let config = ApiConfig::from_env().context("invalid configuration")?;
    if config.insecure_secret {
        tracing::warn!("JWT_SECRET not set; using insecure dev default");
    }

    let app = app::build_app(&config).await.context("failed to open store")?;
    let scheduler = config
        .service
        .audit
        .interval
        .map(|interval| app.services.spawn_audit_scheduler(interval));

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    if let Some(handle) = scheduler {
        handle.shutdown().await;
    }
    app.services.shutdown();
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
