use anyhow::Result;
use backend::config::{init_logger, load_environment, Config};
use backend::create_app_state;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    load_environment();
    init_logger();

    let config = Config::from_env()?;
    let state = create_app_state(config).await?;

    info!(
        "Crawl backend running: {} jobs in queue, dispatch on '{}', monitor on '{}'",
        state.queue.size(),
        state.config.crawl_queue_schedule,
        state.config.monitor_check_schedule
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down, abandoning in-flight work for retry...");
    state.queue.abandon_in_flight().await;

    Ok(())
}
