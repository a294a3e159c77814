use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tracing::warn;

use crate::config::{IngestConfig, UploadSettings};
use crate::error::StageError;
use crate::stage::{Stage, StageOutput};
use crate::stages::{
    convert::{self, ConvertOutcome},
    fetch,
    storage::BucketStore,
    unpack,
    warehouse::{BigQueryWarehouse, Warehouse},
};

/// Ejecuta un stage. El master/worker y el executor local sólo hablan con
/// esta interfaz.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, stage: &Stage) -> Result<StageOutput, StageError>;
}

/// Runner real: HTTP para la descarga, object storage para la subida y
/// warehouse para declarar las tablas.
pub struct CloudStageRunner {
    http: Client,
    storage: BucketStore,
    warehouse: Arc<dyn Warehouse>,
    upload: UploadSettings,
    strict_convert: bool,
}

impl CloudStageRunner {
    pub fn new(
        storage: BucketStore,
        warehouse: Arc<dyn Warehouse>,
        upload: UploadSettings,
        strict_convert: bool,
    ) -> Self {
        Self {
            http: Client::new(),
            storage,
            warehouse,
            upload,
            strict_convert,
        }
    }

    /// GCS + BigQuery con las credenciales del entorno.
    pub async fn from_config(cfg: &IngestConfig) -> Result<Self, StageError> {
        let storage = BucketStore::gcs(&cfg.bucket)?;
        let warehouse = BigQueryWarehouse::from_application_default_credentials().await?;
        Ok(Self::new(
            storage,
            Arc::new(warehouse),
            cfg.upload,
            cfg.strict_convert,
        ))
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StageError>
where
    F: FnOnce() -> Result<T, StageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StageError::Runtime(format!("panic o join error: {e}")))?
}

#[async_trait]
impl StageRunner for CloudStageRunner {
    async fn run(&self, stage: &Stage) -> Result<StageOutput, StageError> {
        match stage {
            Stage::Fetch { url, dest } => {
                let bytes = fetch::download_to_file(&self.http, url, dest).await?;
                Ok(StageOutput::Fetched {
                    path: dest.clone(),
                    bytes,
                })
            }
            Stage::Unpack { archive, dest_dir } => {
                let (archive, dest) = (archive.clone(), dest_dir.clone());
                let entries = blocking(move || unpack::unpack_archive(&archive, &dest)).await?;
                Ok(StageOutput::Unpacked {
                    dest_dir: dest_dir.clone(),
                    entries,
                })
            }
            Stage::Convert { src } => {
                let path = src.clone();
                let outcome = blocking(move || convert::csv_to_parquet(&path)).await?;
                if let ConvertOutcome::UnsupportedFormat { path } = &outcome {
                    if self.strict_convert {
                        return Err(StageError::UnsupportedFormat { path: path.clone() });
                    }
                    warn!(
                        src = %path.display(),
                        "no se generó parquet; la subida de este archivo va a fallar"
                    );
                }
                Ok(StageOutput::Converted(outcome))
            }
            Stage::Upload {
                bucket,
                object_name,
                local_file,
            } => {
                if bucket != self.storage.bucket() {
                    return Err(StageError::Runtime(format!(
                        "bucket {bucket} no coincide con el configurado ({})",
                        self.storage.bucket()
                    )));
                }
                let receipt = self
                    .storage
                    .upload_file(object_name, local_file, &self.upload)
                    .await?;
                Ok(StageOutput::Uploaded {
                    uri: receipt.uri,
                    bytes: receipt.bytes,
                    parts: receipt.parts,
                })
            }
            Stage::DeclareExternalTable { table } => {
                self.warehouse
                    .create_or_replace_external_table(table)
                    .await?;
                Ok(StageOutput::Declared {
                    table: table.qualified_name(),
                    source_uris: table.external_data_configuration.source_uris.clone(),
                })
            }
        }
    }
}
