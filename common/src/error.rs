use std::path::PathBuf;

use thiserror::Error;

/// Errores de un stage del pipeline. Cualquiera de ellos termina la tarea como
/// fallida y queda sujeto a la política de reintentos del workflow.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("error de transporte descargando {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("el servidor respondió {status} para {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("no se pudo extraer {}: {source}", archive.display())]
    Extraction {
        archive: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("no se pudo convertir {} a parquet: {message}", path.display())]
    Conversion { path: PathBuf, message: String },

    #[error("formato no soportado para {} (se esperaba .csv)", path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("error de object storage en {location}: {source}")]
    Storage {
        location: String,
        #[source]
        source: object_store::Error,
    },

    #[error("el warehouse rechazó la tabla {table}: {message}")]
    Warehouse { table: String, message: String },

    #[error("error de I/O en {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("la tarea no se pudo ejecutar: {0}")]
    Runtime(String),
}

impl StageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errores al construir o validar el grafo de tareas.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("nodo duplicado: {0}")]
    DuplicateNode(String),

    #[error("la arista {from} -> {to} referencia un nodo inexistente")]
    UnknownNode { from: String, to: String },

    #[error("el grafo tiene un ciclo que pasa por {0}")]
    Cycle(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("falta la variable de entorno {0}")]
    Missing(&'static str),

    #[error("valor inválido para {name}: {value}")]
    Invalid { name: &'static str, value: String },
}
