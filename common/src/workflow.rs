use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::IngestConfig;
use crate::dag::{Dag, DagNode};
use crate::schedule::Schedule;
use crate::stage::Stage;
use crate::stages::convert::parquet_path_for;
use crate::stages::warehouse::ExternalTableResource;

pub const WORKFLOW_ID: &str = "movielens_ingestion";
pub const FETCH_NODE: &str = "fetch_dataset";
pub const UNPACK_NODE: &str = "unpack_dataset";
/// Prefijo de los objetos subidos al bucket.
pub const RAW_PREFIX: &str = "raw";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultArgs {
    pub owner: String,
    /// Reintentos por tarea ante cualquier falla.
    pub retries: u32,
    pub depends_on_past: bool,
}

impl Default for DefaultArgs {
    fn default() -> Self {
        Self {
            owner: "data-eng".to_string(),
            retries: 1,
            depends_on_past: false,
        }
    }
}

/// Definición completa del workflow: grafo + recurrencia + política de fallas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub schedule: Schedule,
    pub catchup: bool,
    pub max_active_runs: u32,
    pub default_args: DefaultArgs,
    pub tags: Vec<String>,
    pub dag: Dag,
}

/// Nombre base sin extensión: `movies.csv` -> `movies`.
pub fn base_name(file: &str) -> &str {
    Path::new(file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file)
}

pub fn convert_node(base: &str) -> String {
    format!("convert_{base}")
}

pub fn upload_node(base: &str) -> String {
    format!("upload_{base}")
}

pub fn declare_node(base: &str) -> String {
    format!("declare_table_{base}")
}

/// Arma el workflow de ingesta:
/// fetch -> unpack -> { convert_b -> upload_b -> declare_table_b } por cada CSV.
/// Las tablas apuntan a `gs://<bucket>/raw/<b>.parquet`.
pub fn ingestion_workflow(cfg: &IngestConfig) -> WorkflowDefinition {
    ingestion_workflow_with_uris(cfg, |object_name| {
        format!("gs://{}/{}", cfg.bucket, object_name)
    })
}

/// Igual que `ingestion_workflow`, pero la URI de origen de cada tabla sale
/// de `source_uri` (por ejemplo, la del bucket local de `run-local`).
pub fn ingestion_workflow_with_uris<F>(cfg: &IngestConfig, source_uri: F) -> WorkflowDefinition
where
    F: Fn(&str) -> String,
{
    let archive = cfg.archive_path();
    let dataset_dir = cfg.dataset_dir();

    let mut nodes = vec![
        DagNode {
            id: FETCH_NODE.to_string(),
            stage: Stage::Fetch {
                url: cfg.dataset.url.clone(),
                dest: archive.clone(),
            },
        },
        DagNode {
            id: UNPACK_NODE.to_string(),
            stage: Stage::Unpack {
                archive,
                dest_dir: cfg.home.clone(),
            },
        },
    ];
    let mut edges = vec![(FETCH_NODE.to_string(), UNPACK_NODE.to_string())];

    for csv_file in &cfg.dataset.csv_files {
        let base = base_name(csv_file);
        let src = dataset_dir.join(csv_file);
        let parquet = parquet_path_for(&src);
        let parquet_name = parquet
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("{base}.parquet"));
        let object_name = format!("{RAW_PREFIX}/{parquet_name}");
        let uri = source_uri(&object_name);

        let (convert, upload, declare) = (convert_node(base), upload_node(base), declare_node(base));

        nodes.push(DagNode {
            id: convert.clone(),
            stage: Stage::Convert { src },
        });
        nodes.push(DagNode {
            id: upload.clone(),
            stage: Stage::Upload {
                bucket: cfg.bucket.clone(),
                object_name,
                local_file: parquet,
            },
        });
        nodes.push(DagNode {
            id: declare.clone(),
            stage: Stage::DeclareExternalTable {
                table: ExternalTableResource::parquet(
                    &cfg.project_id,
                    &cfg.bigquery_dataset,
                    base,
                    &uri,
                ),
            },
        });

        edges.push((UNPACK_NODE.to_string(), convert.clone()));
        edges.push((convert, upload.clone()));
        edges.push((upload, declare));
    }

    WorkflowDefinition {
        id: WORKFLOW_ID.to_string(),
        schedule: Schedule::Yearly,
        catchup: false,
        max_active_runs: 1,
        default_args: DefaultArgs::default(),
        tags: vec!["de-project".to_string()],
        dag: Dag { nodes, edges },
    }
}
