use std::{env, path::PathBuf};

use crate::error::ConfigError;

pub const DEFAULT_BIGQUERY_DATASET: &str = "movielens_25m";
pub const DEFAULT_INGEST_HOME: &str = "/opt/ingest";

/// 5 MB: con chunks más grandes la subida excede el timeout del cliente en
/// enlaces lentos (~800 kbps).
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 5 * 1024 * 1024;
pub const DEFAULT_MULTIPART_THRESHOLD: usize = 5 * 1024 * 1024;

/// Dataset público que ingiere el pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSource {
    pub url: String,
    pub archive_name: String,
    pub folder: String,
    pub csv_files: Vec<String>,
}

impl Default for DatasetSource {
    fn default() -> Self {
        Self {
            url: "https://files.grouplens.org/datasets/movielens/ml-25m.zip".to_string(),
            archive_name: "ml-25m.zip".to_string(),
            folder: "ml-25m".to_string(),
            csv_files: vec![
                "movies.csv".to_string(),
                "tags.csv".to_string(),
                "ratings.csv".to_string(),
            ],
        }
    }
}

/// Tamaño de chunk y umbral multipart para las subidas a object storage.
/// Se pasa explícitamente en cada subida en vez de tocar estado global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSettings {
    pub chunk_size: usize,
    pub multipart_threshold: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub project_id: String,
    pub bucket: String,
    pub bigquery_dataset: String,
    /// Directorio local de trabajo (archivo zip + carpeta extraída).
    pub home: PathBuf,
    pub dataset: DatasetSource,
    pub upload: UploadSettings,
    /// Si es true, un archivo con extensión no soportada falla la tarea en vez
    /// de sólo loguearse.
    pub strict_convert: bool,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Igual que `from_env`, pero leyendo de una función arbitraria.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| -> Result<String, ConfigError> {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        let strict_convert = match lookup("INGEST_STRICT_CONVERT") {
            None => false,
            Some(v) => parse_bool("INGEST_STRICT_CONVERT", &v)?,
        };

        Ok(Self {
            project_id: required("GCP_PROJECT_ID")?,
            bucket: required("GCP_GCS_BUCKET")?,
            bigquery_dataset: lookup("BIGQUERY_DATASET")
                .unwrap_or_else(|| DEFAULT_BIGQUERY_DATASET.to_string()),
            home: lookup("INGEST_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_INGEST_HOME)),
            dataset: DatasetSource::default(),
            upload: UploadSettings::default(),
            strict_convert,
        })
    }

    pub fn archive_path(&self) -> PathBuf {
        self.home.join(&self.dataset.archive_name)
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.home.join(&self.dataset.folder)
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        }),
    }
}

/// URL base del master.
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
pub fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}
