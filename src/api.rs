use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

use crate::config::ApiConfig;
use crate::fallback::FallbackReader;
use crate::metadata::MetadataStore;
use crate::provider::{ReadRequest, UploadFile, UploadOptions};
use crate::redundancy::RedundancyManager;
use crate::registry::ProviderRegistry;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
    pub manager: Arc<RedundancyManager>,
    pub reader: Arc<FallbackReader>,
    pub metadata_store: Arc<dyn MetadataStore>,
}

/// One uploaded file in the upload response
#[derive(Debug, Serialize)]
pub struct UploadedEntry {
    /// Serving path for the file
    pub src: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn internal_error(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message.to_string(),
            code: "INTERNAL_ERROR".to_string(),
        }),
    )
}

fn bad_request(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
            code: "BAD_REQUEST".to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/upload", post(upload_files))
        .route("/file/:file_id", get(serve_file))
        .route("/file/:file_id", delete(delete_file))
        .route("/api/providers", get(list_providers))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "filehost-storage"
    }))
}

/// Upload one or more files from a multipart form
///
/// Each part is routed and stored independently; one failing part fails
/// the whole request so callers never get a partial success list.
#[instrument(skip(state, multipart))]
async fn upload_files(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Vec<UploadedEntry>>, (StatusCode, Json<ErrorResponse>)> {
    let mut entries = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "malformed multipart payload");
                return Err(bad_request("Malformed multipart payload"));
            }
        };

        let file_name = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| "file".to_string());
        let content_type = field
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let data = field.bytes().await.map_err(|e| {
            warn!(error = %e, file_name = %file_name, "failed to read upload body");
            bad_request("Failed to read upload body")
        })?;

        if data.is_empty() {
            return Err(bad_request("Empty file"));
        }

        let file = UploadFile::new(data, file_name, content_type);
        let result = state.manager.upload(file, UploadOptions::default()).await;

        if !result.success {
            error!(
                error = result.error.as_deref().unwrap_or("unknown"),
                "upload failed"
            );
            return Err(internal_error(
                result.error.as_deref().unwrap_or("Upload failed"),
            ));
        }

        info!(file_id = %result.file_id, "file uploaded");
        entries.push(UploadedEntry { src: result.url });
    }

    if entries.is_empty() {
        return Err(bad_request("No file in request"));
    }

    Ok(Json(entries))
}

/// Serve a file, walking the backend fallback chain
///
/// The caller's conditional and range headers pass straight through to
/// the backends; whatever the winning candidate answers is the response.
#[instrument(skip(state, headers))]
async fn serve_file(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let request = ReadRequest::from_headers(headers);
    let mut file_response = state.reader.get_file(&file_id, &request).await;

    // File ids are unique per upload, so served bodies never change
    if file_response.status.is_success()
        && !file_response.headers.contains_key(header::CACHE_CONTROL)
    {
        file_response.headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=31536000, immutable"),
        );
    }

    let mut response = Response::builder().status(file_response.status);
    if let Some(response_headers) = response.headers_mut() {
        *response_headers = file_response.headers;
    }

    let body = match file_response.body {
        Some(bytes) => Body::from(bytes),
        None => Body::empty(),
    };

    response.body(body).unwrap_or_else(|e| {
        error!(error = %e, "failed to build file response");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

/// Delete a file from every backend that holds a copy
///
/// Backend deletes are best effort; removing the metadata record is the
/// authoritative step that makes the id unreachable.
#[instrument(skip(state))]
async fn delete_file(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let metadata = state.metadata_store.get(&file_id).await.map_err(|e| {
        error!(error = %e, "metadata lookup failed");
        internal_error("Metadata lookup failed")
    })?;

    let Some(metadata) = metadata else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "File not found".to_string(),
                code: "NOT_FOUND".to_string(),
            }),
        ));
    };

    if let Some(storage) = metadata.storage.as_ref() {
        let primary = state.registry.get(Some(storage.primary));
        if !primary.delete_file(&storage.primary_id).await {
            warn!(provider = %storage.primary, "primary delete did not succeed");
        }

        for mirror in &storage.mirrors {
            let Some(id) = mirror.id.as_deref() else {
                continue;
            };
            let provider = state.registry.get(Some(mirror.provider));
            if !provider.delete_file(id).await {
                warn!(provider = %mirror.provider, "mirror delete did not succeed");
            }
        }
    } else {
        // Legacy record: the copy lives under the public id on the
        // original single backend
        let provider = state.registry.provider_for_file(Some(&metadata));
        provider.delete_file(&file_id).await;
    }

    state.metadata_store.delete(&file_id).await.map_err(|e| {
        error!(error = %e, "failed to delete metadata record");
        internal_error("Failed to delete metadata")
    })?;

    info!(file_id = %file_id, "file deleted");
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Configured state of every storage provider
#[instrument(skip(state))]
async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list_available())
}

/// Start the storage API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting storage API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
