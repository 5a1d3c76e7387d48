mod worker;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::worker::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,common=info,reqwest=info")),
        )
        .init();

    let config = WorkerConfig::from_env();
    info!("worker arrancando contra {}", config.base_url);
    worker::run(config).await
}
