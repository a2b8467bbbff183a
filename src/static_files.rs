use std::path::{Path, PathBuf};

use axum::{
    body::Body,
    extract::State,
    http::{Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use mime_guess::MimeGuess;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::server::AppState;

const INDEX_FILE: &str = "index.html";

/// Fallback handler serving the front-end assets from the public directory.
pub async fn serve(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let Some(path) = resolve_path(&state.public_dir, uri.path()) else {
        debug!(path = uri.path(), "rejected static path");
        return not_found();
    };
    stream_file(path).await
}

/// Maps a request path onto `root`, refusing anything that could escape it.
pub fn resolve_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    let mut pushed = false;
    for segment in request_path.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if segment == ".." || segment.contains('\\') || segment.contains('\0') {
            return None;
        }
        path.push(segment);
        pushed = true;
    }
    if !pushed || request_path.ends_with('/') {
        path.push(INDEX_FILE);
    }
    Some(path)
}

async fn stream_file(path: PathBuf) -> Response {
    let Ok(file) = File::open(&path).await else {
        return not_found();
    };
    match file.metadata().await {
        Ok(meta) if meta.is_file() => {}
        _ => return not_found(),
    }

    let stream = ReaderStream::new(file);
    let mut response = Body::from_stream(stream).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first() {
        if let Ok(value) = mime.to_string().parse() {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }
    response
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}
