//! HTTP server re-serving the mirror.
//!
//! Routes:
//!
//! * `GET /<db>.cvd` and `GET /<db>-<version>.cdiff` stream the published
//!   file, with `ETag`/`Last-Modified` and `If-None-Match` support.
//! * `GET /versions` lists the version records as JSON.
//! * `GET /health` answers `OK`.
//!
//! The handler opens the artifact once and takes the length from that open
//! handle.  A concurrent publish renames a new file over the path, which
//! does not affect an already opened handle, so every response carries one
//! complete file.  No lock is shared with the updater.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use log::{debug, error, info};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::mirror::{http_date, MirrorDir};
use crate::store::{StoreError, VersionStore};
use crate::types::{ArtifactName, VersionRecord};

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("version store error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServeError::NotFound(_) => StatusCode::NOT_FOUND,
            ServeError::Io(_) | ServeError::Store(_) => {
                error!("Request failed: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16()
        }));
        (status, body).into_response()
    }
}

/// Read-only view of the mirror handed to request handlers.
#[derive(Clone)]
pub struct ServerState {
    mirror: MirrorDir,
    store: Arc<VersionStore>,
    databases: Arc<[String]>,
}

impl ServerState {
    pub fn new(mirror: MirrorDir, store: Arc<VersionStore>, databases: &[String]) -> Self {
        Self {
            mirror,
            store,
            databases: databases.into(),
        }
    }

    fn tracks(&self, database: &str) -> bool {
        self.databases.iter().any(|d| d == database)
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/versions", get(versions))
        .route("/{file}", get(artifact))
        .with_state(state)
}

/// Serves `state` on `listener` until `shutdown` fires.
pub async fn run_server(
    listener: TcpListener,
    state: ServerState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!("Mirror server listening on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    info!("Mirror server stopped");
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn versions(State(state): State<ServerState>) -> Result<Json<Vec<VersionRecord>>, ServeError> {
    let records = state
        .store
        .records()
        .await?
        .into_iter()
        .filter(|r| state.tracks(&r.database))
        .collect();
    Ok(Json(records))
}

async fn artifact(
    State(state): State<ServerState>,
    Path(file): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ServeError> {
    let name = match ArtifactName::parse(&file) {
        Some(name) if state.tracks(name.database()) => name,
        _ => return Err(ServeError::NotFound(file)),
    };

    let path = state.mirror.artifact_path(&name);
    let handle = match File::open(&path).await {
        Ok(handle) => handle,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ServeError::NotFound(file))
        }
        Err(e) => return Err(e.into()),
    };
    let meta = handle.metadata().await?;
    let len = meta.len();
    let modified = meta.modified().ok();
    let etag = entity_tag(&name, len, modified);

    let not_modified = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|tag| tag.trim() == etag || tag.trim() == "*"));

    let mut response = if not_modified {
        debug!("{} not modified", file);
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        debug!("Serving {} ({} bytes)", file, len);
        // Bounded by the length taken from this handle, whatever happens to
        // the path afterwards.
        let body = Body::from_stream(ReaderStream::new(handle.take(len)));
        let mut response = Response::new(body);
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        response
    };

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, value);
    }
    if let Some(modified) = modified {
        if let Ok(value) = HeaderValue::from_str(&http_date(modified)) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    Ok(response)
}

/// Strong validator derived from the file's identity.  Every publish writes
/// a new file, so size and modification time change with the content.
fn entity_tag(name: &ArtifactName, len: u64, modified: Option<std::time::SystemTime>) -> String {
    let nanos = modified
        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(name.to_string().as_bytes());
    hasher.update(len.to_le_bytes());
    hasher.update(nanos.to_le_bytes());
    format!("\"{}\"", hex::encode(&hasher.finalize()[..12]))
}
