use cncd::{init_logging, ConfigStore, Engine, BUILD_DATE, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    let config_path = std::env::args()
        .nth(1)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(ConfigStore::default_path);

    let store = ConfigStore::load(&config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", config_path.display(), e))?;

    let engine = Engine::new(store);
    tracing::info!("cncd {} ({}) ready", VERSION, BUILD_DATE);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    engine.shutdown().await;

    Ok(())
}
