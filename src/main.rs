use anyhow::Context;
use relay_server::config;
use relay_store::Database;
use relay_telemetry::init_telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load_config().context("failed to load config")?;
    let telemetry = init_telemetry(cfg.telemetry.to_telemetry_config());

    tracing::info!(config = %config::config_path().display(), "starting chat relay");

    let db = Database::open(&cfg.database.path)
        .with_context(|| format!("failed to open database at {}", cfg.database.path.display()))?;
    let notifier = relay_server::notifier_from_settings(&cfg.notify).context("failed to build notifier")?;

    let logs = telemetry.log_sink().map(|sink| relay_server::PersistedLogs {
        sink,
        retention_days: cfg.telemetry.log_retention_days,
    });
    let handle = relay_server::start(&cfg.server, db, notifier, logs)
        .await
        .with_context(|| format!("failed to bind {}", cfg.server.bind_addr()))?;

    tracing::info!(port = handle.port, "chat relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
