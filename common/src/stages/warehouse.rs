use std::{collections::BTreeMap, fmt, sync::Mutex};

use async_trait::async_trait;
use gcp_bigquery_client::{model::query_request::QueryRequest, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StageError;

pub const PARQUET_FORMAT: &str = "PARQUET";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableReference {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalDataConfiguration {
    pub source_format: String,
    pub source_uris: Vec<String>,
}

/// Recurso de tabla externa con la forma que espera la API REST de BigQuery
/// (`tables.insert`): la tabla lee directo del objeto en GCS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTableResource {
    pub table_reference: TableReference,
    pub external_data_configuration: ExternalDataConfiguration,
}

impl ExternalTableResource {
    pub fn parquet(project_id: &str, dataset_id: &str, table_id: &str, source_uri: &str) -> Self {
        Self {
            table_reference: TableReference {
                project_id: project_id.to_string(),
                dataset_id: dataset_id.to_string(),
                table_id: table_id.to_string(),
            },
            external_data_configuration: ExternalDataConfiguration {
                source_format: PARQUET_FORMAT.to_string(),
                source_uris: vec![source_uri.to_string()],
            },
        }
    }

    /// `project.dataset.table`
    pub fn qualified_name(&self) -> String {
        let r = &self.table_reference;
        format!("{}.{}.{}", r.project_id, r.dataset_id, r.table_id)
    }

    /// Mismas reglas básicas que aplica BigQuery a los identificadores.
    pub fn validate(&self) -> Result<(), StageError> {
        let r = &self.table_reference;
        let reject = |message: String| StageError::Warehouse {
            table: self.qualified_name(),
            message,
        };

        if r.project_id.is_empty() || r.dataset_id.is_empty() || r.table_id.is_empty() {
            return Err(reject("identificador vacío".to_string()));
        }
        let rules: [(&str, &String, fn(char) -> bool); 3] = [
            ("project", &r.project_id, |c| {
                c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':')
            }),
            ("dataset", &r.dataset_id, |c| c.is_ascii_alphanumeric() || c == '_'),
            ("table", &r.table_id, |c| {
                c.is_ascii_alphanumeric() || matches!(c, '_' | '-')
            }),
        ];
        for (what, id, allowed) in rules {
            if id.len() > 1024 || !id.chars().all(allowed) {
                return Err(reject(format!("{what} id inválido: {id}")));
            }
        }
        if self.external_data_configuration.source_uris.is_empty() {
            return Err(reject("sin source uris".to_string()));
        }
        Ok(())
    }

    /// DDL que declara la tabla de una sola vez, sin ventana en la que no exista.
    /// Supone identificadores ya validados con [`validate`](Self::validate).
    pub fn create_or_replace_ddl(&self) -> String {
        let uris = self
            .external_data_configuration
            .source_uris
            .iter()
            .map(|u| format!("'{}'", u.replace('\\', "\\\\").replace('\'', "\\'")))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE OR REPLACE EXTERNAL TABLE `{}` OPTIONS (format = '{}', uris = [{}])",
            self.qualified_name(),
            self.external_data_configuration.source_format,
            uris
        )
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Crea la tabla externa o reemplaza la definición existente.
    async fn create_or_replace_external_table(
        &self,
        table: &ExternalTableResource,
    ) -> Result<(), StageError>;
}

pub struct BigQueryWarehouse {
    client: Client,
}

impl fmt::Debug for BigQueryWarehouse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQueryWarehouse").finish_non_exhaustive()
    }
}

impl BigQueryWarehouse {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Credenciales por defecto de la aplicación (ADC).
    pub async fn from_application_default_credentials() -> Result<Self, StageError> {
        let client = Client::from_application_default_credentials()
            .await
            .map_err(|e| StageError::Warehouse {
                table: "*".to_string(),
                message: format!("no se pudo crear el cliente de BigQuery: {e}"),
            })?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn create_or_replace_external_table(
        &self,
        resource: &ExternalTableResource,
    ) -> Result<(), StageError> {
        resource.validate()?;

        let name = resource.qualified_name();
        let sql = resource.create_or_replace_ddl();
        debug!(table = %name, sql = %sql, "declarando tabla externa");

        self.client
            .job()
            .query(&resource.table_reference.project_id, QueryRequest::new(sql))
            .await
            .map_err(|e| StageError::Warehouse {
                table: name.clone(),
                message: e.to_string(),
            })?;

        info!(table = %name, "tabla externa declarada en BigQuery");
        Ok(())
    }
}

/// Warehouse en memoria: mismas semánticas de create-or-replace, sin red.
#[derive(Debug, Default)]
pub struct InMemoryWarehouse {
    tables: Mutex<BTreeMap<String, ExternalTableResource>>,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tables(&self) -> BTreeMap<String, ExternalTableResource> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get(&self, qualified_name: &str) -> Option<ExternalTableResource> {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(qualified_name)
            .cloned()
    }
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    async fn create_or_replace_external_table(
        &self,
        table: &ExternalTableResource,
    ) -> Result<(), StageError> {
        table.validate()?;

        let name = table.qualified_name();
        let replaced = {
            let mut tables = self.tables.lock().map_err(|_| StageError::Warehouse {
                table: name.clone(),
                message: "lock envenenado".to_string(),
            })?;
            tables.insert(name.clone(), table.clone()).is_some()
        };

        info!(table = %name, replaced, "tabla externa declarada (en memoria)");
        Ok(())
    }
}
