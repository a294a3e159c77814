use std::{
    fs::{self, File},
    io,
    path::Path,
};

use tracing::{info, warn};
use zip::ZipArchive;

use crate::error::StageError;

/// Extrae `archive` dentro de `dest_dir`, sobrescribiendo lo que exista.
/// Las entradas con rutas que escapan de `dest_dir` se ignoran.
/// Devuelve la cantidad de archivos extraídos.
pub fn unpack_archive(archive: &Path, dest_dir: &Path) -> Result<usize, StageError> {
    let zip_err = |source| StageError::Extraction {
        archive: archive.to_path_buf(),
        source,
    };

    let file = File::open(archive).map_err(|e| StageError::io(archive, e))?;
    let mut zip = ZipArchive::new(file).map_err(zip_err)?;

    fs::create_dir_all(dest_dir).map_err(|e| StageError::io(dest_dir, e))?;

    let mut extracted = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(zip_err)?;

        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "entrada con ruta insegura, se ignora");
            continue;
        };
        let out_path = dest_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| StageError::io(&out_path, e))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| StageError::io(parent, e))?;
        }

        let mut out = File::create(&out_path).map_err(|e| StageError::io(&out_path, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| StageError::io(&out_path, e))?;
        extracted += 1;
    }

    info!(
        archive = %archive.display(),
        dest = %dest_dir.display(),
        files = extracted,
        "archivo extraído"
    );
    Ok(extracted)
}
