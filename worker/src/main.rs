mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use ingest_common::{config::master_base_url, runner::CloudStageRunner, IngestConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::worker::WorkerSettings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ingest_worker=debug,ingest_common=info,reqwest=info")),
        )
        .init();

    let cfg = IngestConfig::from_env().context("configuración del worker")?;
    let settings = WorkerSettings::from_env(master_base_url())?;

    // credenciales de GCS / BigQuery desde el entorno
    let runner = CloudStageRunner::from_config(&cfg)
        .await
        .context("inicializando clientes de storage y warehouse")?;

    info!(
        master = %settings.base_url,
        home = %cfg.home.display(),
        bucket = %cfg.bucket,
        "worker iniciando"
    );

    worker::run(settings, Arc::new(runner)).await
}
