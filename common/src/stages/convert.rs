//! CSV -> Parquet.
//!
//! El esquema se infiere leyendo el archivo completo (primera línea =
//! encabezados) y después se hace streaming de record batches al writer.

use std::{
    fs::File,
    io::{BufReader, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::csv::{reader::Format, ReaderBuilder};
use parquet::{
    arrow::ArrowWriter,
    basic::Compression,
    file::properties::WriterProperties,
};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{error, info};

use crate::error::StageError;

const BATCH_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConvertOutcome {
    Written {
        path: PathBuf,
        rows: usize,
        columns: usize,
    },
    /// La entrada no termina en `.csv`: no se escribe nada.
    UnsupportedFormat { path: PathBuf },
}

/// Ruta del parquet hermano: misma carpeta y nombre base, extensión `.parquet`.
pub fn parquet_path_for(src: &Path) -> PathBuf {
    src.with_extension("parquet")
}

fn is_csv(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("csv")
}

/// Convierte `src` a parquet.
///
/// Si `src` no es un `.csv` se loguea el error y se devuelve
/// `ConvertOutcome::UnsupportedFormat` sin fallar; el llamador decide si eso
/// corta la tarea.
pub fn csv_to_parquet(src: &Path) -> Result<ConvertOutcome, StageError> {
    if !is_csv(src) {
        error!(
            src = %src.display(),
            "sólo se aceptan archivos de origen en formato CSV"
        );
        return Ok(ConvertOutcome::UnsupportedFormat {
            path: src.to_path_buf(),
        });
    }

    let conversion = |message: String| StageError::Conversion {
        path: src.to_path_buf(),
        message,
    };

    let file = File::open(src).map_err(|e| StageError::io(src, e))?;
    let mut reader = BufReader::new(file);

    let (schema, _) = Format::default()
        .with_header(true)
        .infer_schema(&mut reader, None)
        .map_err(|e| conversion(e.to_string()))?;
    if schema.fields().is_empty() {
        return Err(conversion("CSV vacío".to_string()));
    }
    let schema = Arc::new(schema);

    reader
        .seek(SeekFrom::Start(0))
        .map_err(|e| StageError::io(src, e))?;
    let csv_reader = ReaderBuilder::new(schema.clone())
        .with_header(true)
        .with_batch_size(BATCH_SIZE)
        .build(reader)
        .map_err(|e| conversion(e.to_string()))?;

    let dest = parquet_path_for(src);
    // el temporal se borra solo si algo falla antes del persist
    let tmp = tmp_file_for(&dest)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(tmp, schema.clone(), Some(props))
        .map_err(|e| conversion(e.to_string()))?;

    let mut rows = 0usize;
    for batch in csv_reader {
        let batch = batch.map_err(|e| conversion(e.to_string()))?;
        rows += batch.num_rows();
        writer.write(&batch).map_err(|e| conversion(e.to_string()))?;
    }
    let tmp = writer
        .into_inner()
        .map_err(|e| conversion(e.to_string()))?;

    tmp.persist(&dest)
        .map_err(|e| StageError::io(&dest, e.error))?;

    let columns = schema.fields().len();
    info!(
        src = %src.display(),
        dest = %dest.display(),
        rows,
        columns,
        "csv convertido a parquet"
    );

    Ok(ConvertOutcome::Written {
        path: dest,
        rows,
        columns,
    })
}

/// `<dest>.XXXXXX.tmp` en la misma carpeta, para que el rename sea atómico.
fn tmp_file_for(dest: &Path) -> Result<NamedTempFile, StageError> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let prefix = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| StageError::io(dir, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, StringArray};
    use arrow::datatypes::DataType;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::io::Write;

    fn write_file(path: &Path, content: &str) {
        let mut f = File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    fn leftover_tmp_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("tmp"))
            .collect()
    }

    fn read_parquet(path: &Path) -> (usize, Vec<arrow::record_batch::RecordBatch>) {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap()).unwrap();
        let columns = builder.schema().fields().len();
        let batches: Vec<_> = builder.build().unwrap().map(|b| b.unwrap()).collect();
        (columns, batches)
    }

    #[test]
    fn csv_to_parquet_conserva_filas_y_columnas_para_los_tres_archivos() {
        let tmp = tempfile::tempdir().unwrap();
        let inputs = [
            (
                "movies.csv",
                "movieId,title,genres\n1,\"Toy Story (1995)\",Adventure|Animation\n2,\"Jumanji, The (1995)\",Adventure\n",
                2,
                3,
            ),
            (
                "tags.csv",
                "userId,movieId,tag,timestamp\n3,260,classic,1439472355\n3,260,sci-fi,1439472256\n4,1732,dark comedy,1573943598\n",
                3,
                4,
            ),
            (
                "ratings.csv",
                "userId,movieId,rating,timestamp\n1,296,5.0,1147880044\n1,306,3.5,1147868817\n",
                2,
                4,
            ),
        ];

        for (name, content, rows, cols) in inputs {
            let src = tmp.path().join(name);
            write_file(&src, content);

            let outcome = csv_to_parquet(&src).unwrap();
            let dest = parquet_path_for(&src);
            assert_eq!(
                outcome,
                ConvertOutcome::Written {
                    path: dest.clone(),
                    rows,
                    columns: cols,
                }
            );

            let (columns, batches) = read_parquet(&dest);
            let total: usize = batches.iter().map(|b| b.num_rows()).sum();
            assert_eq!(columns, cols, "{name}");
            assert_eq!(total, rows, "{name}");
        }
        assert!(leftover_tmp_files(tmp.path()).is_empty());
    }

    #[test]
    fn csv_to_parquet_infiere_tipos_y_conserva_texto() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("mixed.csv");
        write_file(
            &src,
            "id,score,name,seen_at\n1,4.5,ana,2015-03-09T22:52:09\n2,3.0,bob,2016-01-01T00:00:00\n",
        );

        csv_to_parquet(&src).unwrap();

        let builder =
            ParquetRecordBatchReaderBuilder::try_new(File::open(parquet_path_for(&src)).unwrap())
                .unwrap();
        let schema = builder.schema().clone();
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(schema.field(1).data_type(), &DataType::Float64);
        assert_eq!(schema.field(2).data_type(), &DataType::Utf8);
        assert!(matches!(schema.field(3).data_type(), DataType::Timestamp(_, _)));

        let batch = builder.build().unwrap().next().unwrap().unwrap();
        let names = batch
            .column(2)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names.value(1), "bob");
    }

    #[test]
    fn csv_to_parquet_ignora_extensiones_no_soportadas() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("ratings.json");
        write_file(&src, r#"{"userId":1}"#);

        let outcome = csv_to_parquet(&src).unwrap();

        assert_eq!(outcome, ConvertOutcome::UnsupportedFormat { path: src.clone() });
        assert!(!tmp.path().join("ratings.parquet").exists());
    }

    #[test]
    fn csv_to_parquet_sobrescribe_el_parquet_anterior() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("movies.csv");
        write_file(&src, "a,b\n1,2\n");
        csv_to_parquet(&src).unwrap();

        write_file(&src, "a,b\n1,2\n3,4\n5,6\n");
        csv_to_parquet(&src).unwrap();

        let (_, batches) = read_parquet(&parquet_path_for(&src));
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn csv_to_parquet_falla_con_csv_vacio() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("tags.csv");
        write_file(&src, "");

        let err = csv_to_parquet(&src).unwrap_err();
        assert!(matches!(err, StageError::Conversion { .. }));
        assert!(!parquet_path_for(&src).exists());
    }

    #[test]
    fn csv_to_parquet_con_fila_rota_no_deja_temporales() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("ratings.csv");
        write_file(&src, "userId,movieId,rating\n1,296,5.0\n1,306,3.5,extra\n");

        let err = csv_to_parquet(&src).unwrap_err();

        assert!(matches!(err, StageError::Conversion { .. }));
        assert!(!parquet_path_for(&src).exists());
        assert!(leftover_tmp_files(tmp.path()).is_empty());
    }

    #[test]
    fn csv_to_parquet_que_falla_al_escribir_no_deja_temporales() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("ratings.csv");
        // pasa la inferencia como entero pero no entra en un Int64
        write_file(&src, "userId\n1\n99999999999999999999999\n");

        if csv_to_parquet(&src).is_err() {
            assert!(!parquet_path_for(&src).exists());
        }
        assert!(leftover_tmp_files(tmp.path()).is_empty());
    }
}
