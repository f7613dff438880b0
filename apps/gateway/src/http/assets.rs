//! Static asset serving with weak ETags.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::ApiError;
use crate::AppState;

/// `GET /static/{*path}`: assets under the app root.
pub async fn static_asset(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let relative = sanitize_relative(&path)
        .ok_or_else(|| ApiError::forbidden("path escapes the asset root"))?;
    serve_file(&state.config.app_root.join(relative), &headers).await
}

/// `GET /vscode-remote-resource?path=…`: a file anywhere on the remote.
pub async fn remote_resource(
    State(_state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let path = params
        .get("path")
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing `path` query parameter"))?;
    serve_file(Path::new(path), &headers).await
}

/// `GET /favicon.ico`.
pub async fn favicon(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    serve_file(&state.config.app_root.join("favicon.ico"), &headers).await
}

/// `GET /manifest.json`: fixed PWA manifest.
pub async fn manifest() -> impl IntoResponse {
    Json(json!({
        "name": "Workbench",
        "short_name": "Workbench",
        "start_url": "/",
        "lang": "en-US",
        "display": "fullscreen",
    }))
}

/// Fallback for unknown paths.
pub async fn no_matching_request() -> impl IntoResponse {
    (StatusCode::BAD_REQUEST, "no matching request")
}

/// Reject traversal: only plain path segments survive.
fn sanitize_relative(raw: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

async fn serve_file(path: &Path, headers: &HeaderMap) -> Result<Response, ApiError> {
    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("Not found"));
    }

    let mtime_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let etag = format!("W/\"{}-{}-{}\"", metadata.ino(), metadata.len(), mtime_ms);

    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());
    if if_none_match == Some(etag.as_str()) {
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, &etag)
            .body(axum::body::Body::empty())
            .map_err(|_| ApiError::internal("response build failed"));
    }

    let body = tokio::fs::read(path).await?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type_for(path))
        .header(header::ETAG, &etag)
        .body(body.into())
        .map_err(|_| ApiError::internal("response build failed"))
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") | Some("mjs") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") | Some("map") => "application/json; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("wasm") => "application/wasm",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
