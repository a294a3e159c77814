use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::stages::convert::ConvertOutcome;
use crate::stages::warehouse::ExternalTableResource;

/// Acción concreta de un nodo del DAG. Viaja serializada del master al worker
/// dentro de cada `Task`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Stage {
    /// Descarga `url` a `dest`.
    Fetch { url: String, dest: PathBuf },
    /// Extrae el zip `archive` dentro de `dest_dir`.
    Unpack { archive: PathBuf, dest_dir: PathBuf },
    /// Convierte un CSV al parquet hermano.
    Convert { src: PathBuf },
    Upload {
        bucket: String,
        object_name: String,
        local_file: PathBuf,
    },
    DeclareExternalTable { table: ExternalTableResource },
}

impl Stage {
    pub fn op_name(&self) -> &'static str {
        match self {
            Stage::Fetch { .. } => "fetch",
            Stage::Unpack { .. } => "unpack",
            Stage::Convert { .. } => "convert",
            Stage::Upload { .. } => "upload",
            Stage::DeclareExternalTable { .. } => "declare_external_table",
        }
    }
}

/// Resultado de un stage exitoso.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageOutput {
    Fetched { path: PathBuf, bytes: u64 },
    Unpacked { dest_dir: PathBuf, entries: usize },
    Converted(ConvertOutcome),
    Uploaded { uri: String, bytes: u64, parts: usize },
    Declared { table: String, source_uris: Vec<String> },
}
