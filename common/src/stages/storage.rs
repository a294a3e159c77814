use std::{fmt, path::Path, sync::Arc};

use object_store::{
    gcp::GoogleCloudStorageBuilder, local::LocalFileSystem, memory::InMemory,
    path::Path as ObjectPath, ObjectStore, PutPayload, WriteMultipart,
};
use serde::{Deserialize, Serialize};
use tokio::{fs::File, io::AsyncReadExt};
use tracing::{debug, info};

use crate::config::UploadSettings;
use crate::error::StageError;

const MAX_PARTS_IN_FLIGHT: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub uri: String,
    pub bytes: u64,
    /// 0 si el archivo se subió con un único PUT.
    pub parts: usize,
}

/// Bucket de object storage sobre el que escribe el pipeline.
#[derive(Clone)]
pub struct BucketStore {
    bucket: String,
    /// Prefijo de las URIs que se informan: `gs://<bucket>` o `file://<root>`.
    uri_prefix: String,
    store: Arc<dyn ObjectStore>,
}

impl fmt::Debug for BucketStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketStore")
            .field("bucket", &self.bucket)
            .field("uri_prefix", &self.uri_prefix)
            .finish()
    }
}

impl BucketStore {
    /// Bucket de GCS con credenciales tomadas del entorno
    /// (GOOGLE_APPLICATION_CREDENTIALS / GOOGLE_SERVICE_ACCOUNT, etc).
    pub fn gcs(bucket: &str) -> Result<Self, StageError> {
        let store = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|source| StageError::Storage {
                location: format!("gs://{bucket}"),
                source,
            })?;

        Ok(Self {
            bucket: bucket.to_string(),
            uri_prefix: format!("gs://{bucket}"),
            store: Arc::new(store),
        })
    }

    /// Bucket respaldado por un directorio local (`<root>/<object>`). Las URIs
    /// son `file://` absolutas, así apuntan a archivos que existen.
    pub fn local(bucket: &str, root: &Path) -> Result<Self, StageError> {
        std::fs::create_dir_all(root).map_err(|e| StageError::io(root, e))?;
        let root = root.canonicalize().map_err(|e| StageError::io(root, e))?;
        let root = root.as_path();
        let store = LocalFileSystem::new_with_prefix(root).map_err(|source| {
            StageError::Storage {
                location: root.display().to_string(),
                source,
            }
        })?;

        Ok(Self {
            bucket: bucket.to_string(),
            uri_prefix: format!("file://{}", root.display()),
            store: Arc::new(store),
        })
    }

    pub fn in_memory(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            uri_prefix: format!("memory://{bucket}"),
            store: Arc::new(InMemory::new()),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    pub fn uri_for(&self, object_name: &str) -> String {
        format!("{}/{}", self.uri_prefix, object_name)
    }

    /// Sube `local_file` a `object_name`, pisando el objeto si ya existe.
    ///
    /// Hasta `multipart_threshold` bytes se usa un único PUT; por encima se
    /// hace multipart con partes de `chunk_size` bytes.
    pub async fn upload_file(
        &self,
        object_name: &str,
        local_file: &Path,
        settings: &UploadSettings,
    ) -> Result<UploadReceipt, StageError> {
        let uri = self.uri_for(object_name);
        let location = ObjectPath::from(object_name);
        let storage_err = |source| StageError::Storage {
            location: uri.clone(),
            source,
        };

        let mut file = File::open(local_file)
            .await
            .map_err(|e| StageError::io(local_file, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| StageError::io(local_file, e))?
            .len();

        if size <= settings.multipart_threshold as u64 {
            let mut buf = Vec::with_capacity(size as usize);
            file.read_to_end(&mut buf)
                .await
                .map_err(|e| StageError::io(local_file, e))?;
            self.store
                .put(&location, PutPayload::from(buf))
                .await
                .map_err(storage_err)?;

            info!(uri = %uri, bytes = size, "objeto subido en un único request");
            return Ok(UploadReceipt {
                uri,
                bytes: size,
                parts: 0,
            });
        }

        let chunk_size = settings.chunk_size.max(1);
        let upload = self
            .store
            .put_multipart(&location)
            .await
            .map_err(storage_err)?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, chunk_size);

        let mut buf = vec![0u8; chunk_size];
        let mut sent: u64 = 0;
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| StageError::io(local_file, e))?;
            if n == 0 {
                break;
            }
            // una parte en vuelo a la vez
            writer
                .wait_for_capacity(MAX_PARTS_IN_FLIGHT)
                .await
                .map_err(storage_err)?;
            writer.write(&buf[..n]);
            sent += n as u64;
            debug!(uri = %uri, sent, total = size, "progreso de subida");
        }
        writer.finish().await.map_err(storage_err)?;

        let parts = size.div_ceil(chunk_size as u64) as usize;
        info!(uri = %uri, bytes = sent, parts, "objeto subido en multipart");
        Ok(UploadReceipt {
            uri,
            bytes: sent,
            parts,
        })
    }

    pub async fn read_object(&self, object_name: &str) -> Result<Vec<u8>, StageError> {
        let location = ObjectPath::from(object_name);
        let result = self
            .store
            .get(&location)
            .await
            .map_err(|source| StageError::Storage {
                location: self.uri_for(object_name),
                source,
            })?;
        let bytes = result.bytes().await.map_err(|source| StageError::Storage {
            location: self.uri_for(object_name),
            source,
        })?;
        Ok(bytes.to_vec())
    }
}
