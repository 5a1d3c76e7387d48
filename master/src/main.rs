mod handlers;
mod monitor;
mod scheduler;
mod state;

use crate::state::AppState;
use anyhow::Context;
use std::{env, path::PathBuf};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const WORKER_DEAD_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);
pub const MAX_TASK_ATTEMPTS: u32 = 3;

const DEFAULT_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,axum=info")),
        )
        .init();

    // master y workers tienen que ver el mismo staging (volumen compartido)
    let staging_dir = env::var("MR_STAGING_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir().join("mr-staging"));
    let state = AppState::new(staging_dir);

    // router HTTP
    let app = handlers::build_router(state.clone());

    // monitor de heartbeats en segundo plano
    let monitor_state = state.clone();
    tokio::spawn(async move {
        monitor::monitor_workers(monitor_state).await;
    });

    let addr = env::var("MASTER_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {addr}"))?;
    info!(
        "master escuchando en {} (staging {})",
        listener.local_addr()?,
        state.staging_dir.display()
    );

    axum::serve(listener, app).await?;
    Ok(())
}
