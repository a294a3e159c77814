use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::Client;
use tokio::{fs, io::AsyncWriteExt};
use tracing::info;

use crate::error::StageError;

/// Descarga `url` a `dest` siguiendo redirects. Se escribe primero en
/// `<dest>.part` y se renombra al terminar, así `dest` sólo existe completo.
/// Devuelve la cantidad de bytes escritos.
pub async fn download_to_file(client: &Client, url: &str, dest: &Path) -> Result<u64, StageError> {
    let transport = |source| StageError::Transport {
        url: url.to_string(),
        source,
    };

    let resp = client.get(url).send().await.map_err(transport)?;
    let status = resp.status();
    if !status.is_success() {
        return Err(StageError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StageError::io(parent, e))?;
        }
    }

    let part = part_path(dest);
    let mut file = fs::File::create(&part)
        .await
        .map_err(|e| StageError::io(&part, e))?;

    let mut written: u64 = 0;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(transport)?;
        file.write_all(&chunk)
            .await
            .map_err(|e| StageError::io(&part, e))?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| StageError::io(&part, e))?;
    drop(file);

    fs::rename(&part, dest)
        .await
        .map_err(|e| StageError::io(dest, e))?;

    info!(url, dest = %dest.display(), bytes = written, "descarga completa");
    Ok(written)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn download_to_file_escribe_el_cuerpo_completo() {
        let base = serve(Router::new().route("/data.zip", get(|| async { "contenido-zip" }))).await;
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("sub").join("data.zip");

        let bytes = download_to_file(&Client::new(), &format!("{base}/data.zip"), &dest)
            .await
            .unwrap();

        assert_eq!(bytes, 13);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "contenido-zip");
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn download_to_file_falla_con_status_de_error() {
        let base = serve(Router::new().route(
            "/missing.zip",
            get(|| async { (StatusCode::NOT_FOUND, "nope") }),
        ))
        .await;
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("missing.zip");

        let err = download_to_file(&Client::new(), &format!("{base}/missing.zip"), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::HttpStatus { status: 404, .. }));
        assert!(!dest.exists());
    }
}
