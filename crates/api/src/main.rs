use std::sync::Arc;

use anyhow::Context;

use chunkline_api::{app, config::AppConfig, default_handlers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chunkline_observability::tracing::init(AppConfig::log_format_from_env());
    let config = AppConfig::from_env();

    let services = Arc::new(app::services::build_services(&config, default_handlers()).await?);
    let workers = services.spawn_workers(&config);

    let app = app::build_app(services.clone());
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        backend = services.backend(),
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    workers.shutdown().await;
    Ok(())
}
