// src/files.rs
// Axum routes for the file object store: multipart upload in, opaque-id
// download out.
use std::path::PathBuf;

use axum::extract::{DefaultBodyLimit, Extension, Multipart, Path};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::net::{ws_handler, NodeShared};

#[derive(Clone)]
pub struct FileStore {
    dir: PathBuf,
    max_bytes: usize,
    /// host:port used to build dereferenceable download URLs.
    advertised: String,
}

impl FileStore {
    pub fn new(dir: PathBuf, max_bytes: usize, advertised: String) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, max_bytes, advertised })
    }
}

#[derive(Debug, Error)]
enum FileError {
    #[error("no file part in the request")]
    MissingPart,

    #[error("file too large")]
    TooLarge,

    #[error("file not found")]
    NotFound,

    #[error("storage error")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for FileError {
    fn into_response(self) -> Response {
        let status = match &self {
            FileError::MissingPart => StatusCode::BAD_REQUEST,
            FileError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            FileError::NotFound => StatusCode::NOT_FOUND,
            FileError::Io(e) => {
                warn!("file store io error: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// The whole HTTP surface of a node: the WebSocket endpoint plus the file
/// routes. Static routes win over the `/:filename` capture.
pub fn router(store: FileStore, shared: NodeShared) -> Router {
    let body_cap = store.max_bytes.saturating_mul(2).saturating_add(64 * 1024);
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/upload", post(upload))
        .route("/api/metrics", get(node_metrics))
        .route("/:filename", get(download))
        .layer(DefaultBodyLimit::max(body_cap))
        .layer(Extension(store))
        .layer(Extension(shared))
}

async fn node_metrics() -> Response {
    let (connections, peer_links, frames_in, duplicates) = crate::metrics::snapshot();
    Json(serde_json::json!({
        "active_connections": connections,
        "peer_links": peer_links,
        "frames_received": frames_in,
        "duplicates_dropped": duplicates,
    }))
    .into_response()
}

async fn upload(
    Extension(store): Extension<FileStore>,
    mut multipart: Multipart,
) -> Result<Response, FileError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| FileError::MissingPart)?
    {
        if field.name() != Some("file") {
            continue;
        }
        let ext = field.file_name().map(extension_of).unwrap_or_default();
        // a read failure here is almost always the body cap tripping
        let data = field.bytes().await.map_err(|_| FileError::TooLarge)?;
        if data.len() > store.max_bytes {
            return Err(FileError::TooLarge);
        }

        let name = format!("{}{}", Uuid::new_v4().simple(), ext);
        tokio::fs::write(store.dir.join(&name), &data).await?;
        let file_url = format!("http://{}/{}", store.advertised, name);
        info!(%file_url, bytes = data.len(), "file stored");
        return Ok((StatusCode::OK, Json(serde_json::json!({ "file_url": file_url })))
            .into_response());
    }
    Err(FileError::MissingPart)
}

async fn download(
    Extension(store): Extension<FileStore>,
    Path(filename): Path<String>,
) -> Result<Response, FileError> {
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return Err(FileError::NotFound);
    }
    match tokio::fs::read(store.dir.join(&filename)).await {
        Ok(bytes) => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response()),
        Err(e) => {
            debug!(%filename, "download miss: {e}");
            Err(FileError::NotFound)
        }
    }
}

/// Keep a short alphanumeric extension from the uploaded name, nothing else.
fn extension_of(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 8
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!(".{ext}")
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_are_sanitized() {
        assert_eq!(extension_of("report.pdf"), ".pdf");
        assert_eq!(extension_of("archive.tar.gz"), ".gz");
        assert_eq!(extension_of("noext"), "");
        assert_eq!(extension_of(".hidden"), "");
        assert_eq!(extension_of("evil.p/df"), "");
        assert_eq!(extension_of("x.waytoolongext"), "");
    }
}
