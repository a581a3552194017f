use anyhow::Context;
use ride_notify::api::ApiServer;
use ride_notify::config::AppConfig;
use ride_notify::services::ServiceContainer;
use ride_notify::{database, logging, panic_hook};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env().context("loading configuration")?;

    let (logging_config, _log_guard) =
        logging::init_logging(&config.log_dir, config.log_filter.as_deref())?;
    panic_hook::install(&config.log_dir);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting ride-notify");

    let pool = database::init_pool(&config.database_url)
        .await
        .context("opening database")?;
    database::run_migrations(&pool)
        .await
        .context("running migrations")?;

    let container = ServiceContainer::new(pool, config.clone()).await?;
    container.initialize().await?;

    let shutdown = container.cancellation_token();
    logging_config.start_retention_cleanup(shutdown.clone());

    let state = container
        .app_state()
        .with_logging_config(logging_config.clone());
    let server = ApiServer::new(config.api.clone(), state, shutdown.clone());
    let server_task = tokio::spawn(async move { server.run().await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for ctrl-c")?;
            info!("Shutdown signal received");
        }
        _ = shutdown.cancelled() => {}
    }

    container.shutdown().await?;
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server exited with error"),
        Err(e) => error!(error = %e, "API server task failed"),
    }

    info!("ride-notify stopped");
    Ok(())
}
