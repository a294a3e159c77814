mod failover;
mod handlers;
mod scheduler;
mod state;

use std::time::Duration;

use anyhow::Context;
use ingest_common::{ingestion_workflow, IngestConfig};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 20;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ingest_master=debug,tower_http=info,axum=info")),
        )
        .init();

    let cfg = IngestConfig::from_env().context("configuración del master")?;
    let workflow = ingestion_workflow(&cfg);
    workflow.dag.validate().context("grafo del workflow")?;

    let heartbeat_timeout = match std::env::var("WORKER_HEARTBEAT_TIMEOUT_SECS") {
        Ok(v) => v
            .parse()
            .with_context(|| format!("WORKER_HEARTBEAT_TIMEOUT_SECS inválido: {v}"))?,
        Err(_) => DEFAULT_HEARTBEAT_TIMEOUT_SECS,
    };

    info!(
        workflow = %workflow.id,
        tasks = workflow.dag.nodes.len(),
        bucket = %cfg.bucket,
        "workflow cargado"
    );

    let state = AppState::new(workflow, Duration::from_secs(heartbeat_timeout));

    // router HTTP
    let app = handlers::build_router(state.clone());

    // failover de workers en segundo plano
    tokio::spawn(failover::run_failover_loop(state.clone()));

    // disparos programados
    tokio::spawn(scheduler::run_scheduler_loop(state.clone()));

    let bind = std::env::var("MASTER_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("no se pudo escuchar en {bind}"))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
